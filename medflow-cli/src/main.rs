//! Medflow CLI: operator tooling for the Medflow workflow engine.
//!
//! Validates definitions, runs workflows against the configured providers,
//! and exports or verifies audit logs.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Medflow: audited workflow orchestration for clinical pipelines
#[derive(Parser, Debug)]
#[command(name = "medflow", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Parse and validate a workflow definition file
    Validate {
        /// Path to a YAML or JSON definition
        file: PathBuf,
    },
    /// Run a workflow to completion or until it waits on a reviewer
    Run {
        /// Definition file to publish and run
        #[arg(short, long, conflicts_with = "builtin", required_unless_present = "builtin")]
        file: Option<PathBuf>,
        /// Name of a built-in workflow
        #[arg(short, long)]
        builtin: Option<String>,
        /// Input fields as key=value pairs
        #[arg(short, long)]
        input: Vec<String>,
        /// Full instance input as a JSON object (merged under key=value pairs)
        #[arg(long)]
        input_json: Option<String>,
        /// Actor recorded in the audit trail
        #[arg(long, default_value = "cli")]
        actor: String,
        /// Approve every human review step with the given output
        #[arg(long)]
        auto_approve: bool,
        /// Output recorded for auto-approved review steps
        #[arg(long, default_value = r#"{"approved": true}"#)]
        approve_output: String,
    },
    /// Inspect audit logs
    Audit {
        #[command(subcommand)]
        action: AuditAction,
    },
    /// Built-in workflow definitions
    Builtins {
        #[command(subcommand)]
        action: BuiltinsAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum AuditAction {
    /// Export entries from a JSONL audit log
    Export {
        /// Audit log file (defaults to `audit.path` from config)
        #[arg(short, long)]
        path: Option<PathBuf>,
        /// Only entries of this instance
        #[arg(long)]
        instance: Option<uuid::Uuid>,
        /// Output format: json, jsonl, csv, text
        #[arg(long, default_value = "json")]
        format: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Recompute the hash chain of a JSONL audit log
    Verify {
        /// Audit log file (defaults to `audit.path` from config)
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum BuiltinsAction {
    /// List built-in workflows
    List,
    /// Show the steps of a built-in workflow
    Show {
        /// Workflow name
        name: String,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Print the path of the per-user config file
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "medflow", "medflow")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "medflow.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, cli.config.as_deref()).await
}
