//! OpenTenancy CLI
//!
//! Operator interface for tenant isolation, audit trail and backups.
//!
//! # Usage
//!
//! ```bash
//! tenancyctl config init
//! tenancyctl isolation enable orders
//! tenancyctl backup create --tenant 7 --type full
//! tenancyctl backup restore --tenant 7 --id 12 --yes
//! tenancyctl audit show --tenant 7 --failed-since 60 --format json
//! tenancyctl run
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use tenancy_security::TenancyServices;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod output;

#[derive(Parser)]
#[command(name = "tenancyctl")]
#[command(author = "OpenTenancy")]
#[command(version)]
#[command(about = "OpenTenancy tenant isolation and audit CLI", long_about = None)]
struct Cli {
    /// Config file
    #[arg(long, short, env = "TENANCY_CONFIG")]
    config: Option<PathBuf>,

    /// Profile name, selects tenancy.<profile>.toml
    #[arg(long, short)]
    profile: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    format: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the config file
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Generate a master key file
    Keygen {
        /// Destination; defaults to key_path from the config
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Run the retention sweeper until interrupted
    Run,
    /// Tenant backups
    Backup {
        #[command(subcommand)]
        action: BackupCommands,
    },
    /// Audit trail
    Audit {
        #[command(subcommand)]
        action: AuditCommands,
    },
    /// Row isolation policies
    Isolation {
        #[command(subcommand)]
        action: IsolationCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default config (and master key) next to the config path
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },
    /// Print the effective config
    Show,
    /// Print the config path
    Path,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackupKind {
    Full,
    Incremental,
    Differential,
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Back up one tenant
    Create {
        #[arg(long)]
        tenant: i64,
        #[arg(long = "type", value_enum, default_value = "full")]
        kind: BackupKind,
    },
    /// List a tenant's backups
    List {
        #[arg(long)]
        tenant: i64,
    },
    /// Counts and sizes for a tenant
    Status {
        #[arg(long)]
        tenant: i64,
    },
    /// Check an artifact against its record
    Verify {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        id: i64,
    },
    /// Restore a backup into its tenant
    Restore {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        id: i64,
        /// Confirm overwriting current rows
        #[arg(long)]
        yes: bool,
    },
    /// Delete expired backups (one tenant, or all)
    Sweep {
        #[arg(long)]
        tenant: Option<i64>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExportKind {
    Json,
    Csv,
    Cef,
}

#[derive(Subcommand)]
enum AuditCommands {
    /// Show persisted entries, newest first
    Show {
        #[arg(long)]
        tenant: i64,
        #[arg(long)]
        user: Option<i64>,
        #[arg(long)]
        action: Option<String>,
        /// Only failures from the last N minutes
        #[arg(long)]
        failed_since: Option<i64>,
        #[arg(long, default_value = "50")]
        limit: i64,
        #[arg(long, default_value = "0")]
        offset: i64,
    },
    /// Verify the tenant's hash chain
    Verify {
        #[arg(long)]
        tenant: i64,
    },
    /// Export a tenant's trail
    Export {
        #[arg(long)]
        tenant: i64,
        #[arg(long = "as", value_enum, default_value = "json")]
        kind: ExportKind,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum IsolationCommands {
    /// Install the row policy on a table
    Enable { table: String },
    /// Remove the row policy from a table
    Disable { table: String },
    /// Show a table's policy state
    Status { table: String },
    /// Confirm a tenant only sees its own rows
    Check {
        #[arg(long)]
        tenant: i64,
        table: String,
    },
    /// Recent policy violations for a tenant
    Violations {
        #[arg(long)]
        tenant: i64,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
    /// Recent access denials for a tenant
    Denials {
        #[arg(long)]
        tenant: i64,
        #[arg(long, default_value = "50")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = config::resolve_path(cli.config.as_deref(), cli.profile.as_deref());

    let result = match cli.command {
        Commands::Config { action } => commands::config::handle(action, &config_path, cli.format),
        Commands::Keygen { path } => commands::config::keygen(&config_path, path),
        command => with_services(command, &config_path, cli.format).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Commands that need the database, key and audit log
async fn with_services(
    command: Commands,
    config_path: &std::path::Path,
    format: output::OutputFormat,
) -> anyhow::Result<()> {
    let config = config::load(config_path)?;
    let services = TenancyServices::start(&config)?;

    let result = match command {
        Commands::Run => commands::run::handle(&services, &config).await,
        Commands::Backup { action } => commands::backup::handle(action, &services, &config, format).await,
        Commands::Audit { action } => commands::audit::handle(action, &services, format),
        Commands::Isolation { action } => commands::isolation::handle(action, &services, format),
        Commands::Config { .. } | Commands::Keygen { .. } => Ok(()),
    };

    if let Err(e) = services.shutdown().await {
        tracing::error!(error = %e, "Audit log did not flush cleanly");
    }
    result
}
