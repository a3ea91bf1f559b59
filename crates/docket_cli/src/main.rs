//! Docket CLI
//!
//! Offline maintenance tools for a Docket storage directory. Every command
//! takes the directory lock, so the application must not be running.
//!
//! # Commands
//!
//! - `inspect` - Key counts per concern, storage mode, schema version
//! - `queue` - Pending operations and dead letters of a tenant
//! - `migrate` - Schema migration status and execution
//! - `backup` - Export, import and check tenant backups
//! - `verify` - Replay the log and decode every record
//! - `reset` - Emergency wipe of all local state

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Docket local store tools.
#[derive(Parser)]
#[command(name = "docket")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the storage directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Device whose data to operate on (default: the only device present)
    #[arg(global = true, short, long)]
    device: Option<String>,

    /// Tenant to operate on (default: the only tenant present)
    #[arg(global = true, short, long)]
    tenant: Option<String>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display key counts, storage mode and schema version
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show or manage the sync queue of a tenant
    Queue {
        #[command(subcommand)]
        action: Option<QueueAction>,
    },

    /// Show or run schema migrations
    Migrate {
        #[command(subcommand)]
        action: Option<MigrateAction>,
    },

    /// Export or import a tenant backup
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },

    /// Replay the log and check every record
    Verify,

    /// Delete all local state
    Reset {
        /// Confirm the wipe
        #[arg(long)]
        yes: bool,
    },

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List pending operations and dead letters
    List {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
    /// Move a dead letter back into the queue
    Requeue {
        /// Operation id of the dead letter
        op_id: u64,
    },
    /// Drop a dead letter for good
    Discard {
        /// Operation id of the dead letter
        op_id: u64,
    },
}

#[derive(Subcommand)]
enum MigrateAction {
    /// Show the schema version and applied migrations
    Status,
    /// List known migrations and whether they are applied
    List,
    /// Apply pending migrations
    Run {
        /// Show what would run without applying anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Write a tenant backup to a file
    Create {
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Replace a tenant's data with a backup file
    Restore {
        /// Backup file
        #[arg(short, long)]
        input: PathBuf,
        /// Overwrite a tenant that already has data
        #[arg(long)]
        force: bool,
    },
    /// Check a backup file and show its metadata
    Info {
        /// Backup file
        #[arg(short, long)]
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let scope = commands::Scope {
        device: cli.device,
        tenant: cli.tenant,
    };

    match cli.command {
        Commands::Inspect { format } => {
            let path = cli.path.ok_or("Storage path required for inspect")?;
            commands::inspect::run(&path, &format)?;
        }
        Commands::Queue { action } => {
            let path = cli.path.ok_or("Storage path required for queue")?;
            match action.unwrap_or(QueueAction::List {
                format: "text".to_string(),
            }) {
                QueueAction::List { format } => commands::queue::list(&path, &scope, &format)?,
                QueueAction::Requeue { op_id } => commands::queue::requeue(&path, &scope, op_id)?,
                QueueAction::Discard { op_id } => commands::queue::discard(&path, &scope, op_id)?,
            }
        }
        Commands::Migrate { action } => {
            let path = cli.path.ok_or("Storage path required for migrate")?;
            match action.unwrap_or(MigrateAction::Status) {
                MigrateAction::Status => commands::migrate::status(&path, &scope)?,
                MigrateAction::List => commands::migrate::list(&path, &scope)?,
                MigrateAction::Run { dry_run } => commands::migrate::run(&path, &scope, dry_run)?,
            }
        }
        Commands::Backup { action } => match action {
            BackupAction::Create { output } => {
                let path = cli.path.ok_or("Storage path required for backup create")?;
                commands::backup::create(&path, &scope, &output)?;
            }
            BackupAction::Restore { input, force } => {
                let path = cli.path.ok_or("Storage path required for backup restore")?;
                commands::backup::restore(&path, &scope, &input, force)?;
            }
            BackupAction::Info { input } => commands::backup::info(&input)?,
        },
        Commands::Verify => {
            let path = cli.path.ok_or("Storage path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Reset { yes } => {
            let path = cli.path.ok_or("Storage path required for reset")?;
            commands::reset::run(&path, yes)?;
        }
        Commands::Version => {
            println!("Docket CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Storage format v{}", docket_core::FORMAT_VERSION);
        }
    }

    Ok(())
}
