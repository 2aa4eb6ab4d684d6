//! Configuration loading and validation.
//!
//! A config file names the database to clone from or into, plus the standing
//! per-table policies for downloads. YAML and JSON are both accepted,
//! detected by file extension.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::download::DownloadOptions;
use crate::error::{CloneError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Database connection parameters.
    pub database: DatabaseConfig,

    /// Standing download policies.
    #[serde(default)]
    pub clone: CloneConfig,
}

/// PostgreSQL connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub database: String,

    pub user: String,

    #[serde(default)]
    pub password: String,
}

fn default_port() -> u16 {
    5432
}

/// Per-table traversal policies and the row budget, as configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloneConfig {
    /// Tables to include without following their outgoing edges.
    #[serde(default)]
    pub dont_recurse: Vec<String>,

    /// Tables to exclude from the clone set entirely.
    #[serde(default)]
    pub dont_include: Vec<String>,

    /// Abort downloads that collect this many rows. Zero disables.
    #[serde(default)]
    pub limit: usize,
}

impl Config {
    /// Load configuration from a file.
    ///
    /// `.json` files are parsed as JSON; everything else as YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_lowercase());

        match extension.as_deref() {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| CloneError::Config(format!("failed to parse JSON config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database.host.is_empty() {
            return Err(CloneError::Config("database.host must be set".into()));
        }
        if self.database.database.is_empty() {
            return Err(CloneError::Config("database.database must be set".into()));
        }
        if self.database.user.is_empty() {
            return Err(CloneError::Config("database.user must be set".into()));
        }
        let overlap: Vec<&String> = self
            .clone
            .dont_recurse
            .iter()
            .filter(|t| self.clone.dont_include.contains(*t))
            .collect();
        if let Some(table) = overlap.first() {
            return Err(CloneError::Config(format!(
                "table {} is listed in both dont_recurse and dont_include",
                table
            )));
        }
        Ok(())
    }
}

impl CloneConfig {
    /// Build traversal options from the configured policies.
    pub fn to_options(&self) -> DownloadOptions {
        let mut options = DownloadOptions::new().limit_size(self.limit);
        for table in &self.dont_recurse {
            options = options.dont_recurse(table.clone());
        }
        for table in &self.dont_include {
            options = options.dont_include(table.clone());
        }
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_YAML: &str = r#"
database:
  host: localhost
  database: app
  user: postgres
  password: postgres
clone:
  dont_include: [user, firm]
  dont_recurse: [stakeholder]
  limit: 50000
"#;

    #[test]
    fn test_parse_valid_yaml() {
        let config = Config::from_yaml(VALID_YAML).unwrap();
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.clone.dont_include, vec!["user", "firm"]);
        assert_eq!(config.clone.limit, 50_000);
    }

    #[test]
    fn test_missing_host_is_rejected() {
        let yaml = r#"
database:
  host: ""
  database: app
  user: postgres
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, CloneError::Config(_)));
    }

    #[test]
    fn test_conflicting_table_policies_are_rejected() {
        let yaml = r#"
database:
  host: localhost
  database: app
  user: postgres
clone:
  dont_recurse: [user]
  dont_include: [user]
"#;
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("user"));
    }

    #[test]
    fn test_to_options_carries_policies() {
        let config = Config::from_yaml(VALID_YAML).unwrap();
        let options = config.clone.to_options();
        assert!(options.excludes("user"));
        assert!(!options.excludes("stakeholder"));
    }
}
