//! Error types for the cloning library.

use thiserror::Error;

use crate::download::DownloadReport;

/// Main error type for clone and merge operations.
#[derive(Error, Debug)]
pub enum CloneError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store cannot describe its schema.
    #[error("Schema error: {0}")]
    Schema(String),

    /// PostgreSQL connection or query error.
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Connection pool error with context.
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A store operation failed outside of the SQL layer.
    #[error("Store error: {0}")]
    Store(String),

    /// Traversal collected more rows than the configured budget.
    ///
    /// Carries the partial dump and trace gathered before the limit was hit,
    /// so callers can inspect how far the traversal got.
    #[error("dump hit the configured limit of {limit} rows")]
    LimitExceeded {
        limit: usize,
        partial: Box<DownloadReport>,
    },

    /// A merge action touched an unexpected number of rows.
    #[error("Integrity violation for {id}: {message}")]
    Integrity { id: String, message: String },

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The operation was cancelled (SIGINT, etc.)
    #[error("Operation cancelled")]
    Cancelled,
}

impl CloneError {
    /// Create a Pool error with context about where it occurred.
    pub fn pool(message: impl ToString, context: impl Into<String>) -> Self {
        CloneError::Pool {
            message: message.to_string(),
            context: context.into(),
        }
    }

    /// Create an Integrity error for a specific record.
    pub fn integrity(id: impl ToString, message: impl Into<String>) -> Self {
        CloneError::Integrity {
            id: id.to_string(),
            message: message.into(),
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for clone and merge operations.
pub type Result<T> = std::result::Result<T, CloneError>;
