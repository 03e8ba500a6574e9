//! gitorm CLI - migration management for git-backed stores.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

use gitorm::db::{Database, DatabaseConfig, DatabaseError, Manifest};

#[derive(Parser)]
#[command(name = "gitorm")]
#[command(about = "Schema migrations for gitorm stores")]
#[command(version)]
struct Cli {
    /// Path to the store's git repository
    #[arg(short, long, default_value = ".gitorm")]
    database: PathBuf,

    /// Path to the JSON manifest (record types and migration steps)
    #[arg(short, long, default_value = "gitorm.json")]
    manifest: PathBuf,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show applied and pending steps
    Status,

    /// Apply every pending step
    Apply,

    /// Revert the most recent steps
    Revert {
        /// Number of steps to revert
        #[arg(long, default_value = "1")]
        steps: usize,
    },

    /// Print the last applied step
    Version,

    /// Generate a step that brings the store in line with the manifest types
    Plan {
        /// Id for the generated step
        #[arg(long)]
        id: String,

        /// Append the step to the manifest file instead of printing it
        #[arg(long)]
        write: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(&cli.verbosity, &cli.log_format) {
        eprintln!("Failed to setup logging: {}", e);
        return ExitCode::FAILURE;
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            if e.is_fatal() {
                eprintln!("The store's migration history needs operator attention.");
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), DatabaseError> {
    let mut manifest = Manifest::from_path(&cli.manifest)?;
    let create = matches!(cli.command, Commands::Apply);
    let config = DatabaseConfig::new(&cli.database).create_if_missing(create);
    let db = Database::from_manifest(config, &manifest)?;
    let migrator = db.migrator()?;

    match cli.command {
        Commands::Status => {
            let status = migrator.status()?;
            for entry in &status.applied {
                println!("applied  {}  {}", entry.step_id, entry.applied_at.to_rfc3339());
            }
            for id in &status.pending {
                println!("pending  {}", id);
            }
            let drift = migrator.verify()?;
            if status.pending.is_empty() && !drift.is_empty() {
                println!("schema drift: {} change(s) not covered by any step", drift.len());
                for change in drift {
                    println!("  {}", change);
                }
            }
        }
        Commands::Apply => {
            let report = migrator.apply_all()?;
            if report.is_empty() {
                println!("nothing to apply");
            }
            for id in &report.steps {
                println!("applied  {}", id);
            }
            info!(applied = report.steps.len(), "apply finished");
        }
        Commands::Revert { steps } => {
            let report = migrator.revert_last(steps)?;
            for id in &report.steps {
                println!("reverted {}", id);
            }
            info!(reverted = report.steps.len(), "revert finished");
        }
        Commands::Version => match migrator.current_version()? {
            Some(id) => println!("{}", id),
            None => println!("(no steps applied)"),
        },
        Commands::Plan { id, write } => match migrator.plan(&id)? {
            None => println!("store matches the manifest types"),
            Some(step) if write => {
                let changes = step.changes.len();
                manifest.push_step(step);
                manifest.save(&cli.manifest)?;
                println!("added step {} ({} changes) to {}", id, changes, cli.manifest.display());
            }
            Some(step) => {
                let json = serde_json::to_string_pretty(&step)
                    .map_err(|e| DatabaseError::Manifest(e.to_string()))?;
                println!("{}", json);
            }
        },
    }
    Ok(())
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}
