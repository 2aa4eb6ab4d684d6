//! relclone CLI - clone connected database subsets and merge them back.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use relclone::{
    apply_merge_strategy, download, generate_merge_strategy, reverse_foreign_key_mapping,
    reverse_primary_key_mapping, upload, CloneError, Config, Dump, MappingEntry, PostgresPool,
    RowStore, Value,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Level};

#[derive(Parser)]
#[command(name = "relclone")]
#[command(about = "Clone a connected subset of a relational database")]
#[command(version)]
struct Cli {
    /// Path to YAML or JSON configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the subset reachable from a seed row into a JSON dump
    Download {
        /// Seed table
        #[arg(long)]
        table: String,

        /// Seed column
        #[arg(long)]
        column: String,

        /// Seed value (parsed as an integer when possible)
        #[arg(long)]
        value: String,

        /// Output file for the dump ("-" for stdout)
        #[arg(long, default_value = "dump.json")]
        output: PathBuf,
    },

    /// Upload a JSON dump into the configured database
    Upload {
        /// Input dump file
        #[arg(long, default_value = "dump.json")]
        input: PathBuf,

        /// Where to write the old-to-new key mapping
        #[arg(long, default_value = "mapping.json")]
        mapping: PathBuf,
    },

    /// Generate (and optionally apply) a three-way merge of a diverged clone
    Merge {
        /// Snapshot of the original rows at clone time
        #[arg(long)]
        base: PathBuf,

        /// Current snapshot of the original
        #[arg(long)]
        main: PathBuf,

        /// Current snapshot of the clone
        #[arg(long)]
        branch: PathBuf,

        /// Mapping captured when the clone was uploaded
        #[arg(long)]
        mapping: PathBuf,

        /// Execute the non-conflicting actions against the database
        #[arg(long)]
        apply: bool,
    },

    /// Print the introspected schema model as JSON
    Schema,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), CloneError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format)?;

    let config = Config::load(&cli.config)?;
    info!("loaded configuration from {:?}", cli.config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, aborting at the next I/O boundary");
                cancel.cancel();
            }
        });
    }

    let pool = PostgresPool::connect(&config.database).await?;

    match cli.command {
        Commands::Download {
            table,
            column,
            value,
            output,
        } => {
            let mut store = pool.store().await?;
            let options = config.clone.to_options();
            let report =
                download(&mut store, &cancel, &table, &column, parse_value(&value), &options)
                    .await?;
            for line in &report.trace {
                debug!("{line}");
            }
            write_json(&output, &report.dump)?;
            info!("downloaded {} rows to {:?}", report.dump.len(), output);
        }

        Commands::Upload { input, mapping } => {
            let mut dump: Dump = read_json(&input)?;
            let mut store = pool.store().await?;
            store.begin().await?;
            match upload(&mut store, &cancel, &mut dump).await {
                Ok(()) => store.commit().await?,
                Err(e) => {
                    store.rollback().await?;
                    return Err(e);
                }
            }
            write_json(&mapping, &store.mapping().to_vec())?;
            info!(
                "uploaded {} rows, {} keys remapped to {:?}",
                dump.len(),
                store.mapping().len(),
                mapping
            );
        }

        Commands::Merge {
            base,
            main,
            branch,
            mapping,
            apply,
        } => {
            let base: Dump = read_json(&base)?;
            let main: Dump = read_json(&main)?;
            let mut branch: Dump = read_json(&branch)?;
            let mapping: Vec<MappingEntry> = read_json(&mapping)?;

            let schema = pool.schema();
            reverse_primary_key_mapping(&schema.primary_keys, &mapping, &mut branch);
            reverse_foreign_key_mapping(&schema.foreign_keys, &mapping, &mut branch);

            let actions = generate_merge_strategy(&schema.primary_keys, &base, &main, &branch);
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for action in &actions {
                serde_json::to_writer(&mut out, action)?;
                writeln!(out)?;
            }

            if apply {
                let mut store = pool.store().await?;
                store.begin().await?;
                match apply_merge_strategy(&mut store, &cancel, &mapping, &actions).await {
                    Ok(()) => store.commit().await?,
                    Err(e) => {
                        store.rollback().await?;
                        return Err(e);
                    }
                }
                info!("applied {} merge actions", actions.len());
            }
        }

        Commands::Schema => {
            println!("{}", serde_json::to_string_pretty(pool.schema())?);
        }
    }

    Ok(())
}

/// Seed values usually are integer keys, but string keys exist too.
fn parse_value(raw: &str) -> Value {
    match raw.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::Text(raw.to_string()),
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T, CloneError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

fn write_json<T: serde::Serialize>(path: &PathBuf, value: &T) -> Result<(), CloneError> {
    if path.as_os_str() == "-" {
        serde_json::to_writer_pretty(std::io::stdout().lock(), value)?;
        println!();
        return Ok(());
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), value)?;
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), CloneError> {
    let level = match verbosity {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => {
            return Err(CloneError::Config(format!(
                "invalid verbosity '{}': expected debug, info, warn, or error",
                other
            )))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => builder.json().init(),
        "text" => builder.init(),
        other => {
            return Err(CloneError::Config(format!(
                "invalid log format '{}': expected text or json",
                other
            )))
        }
    }

    Ok(())
}
