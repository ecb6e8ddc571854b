//! Tabula CLI
//!
//! Command-line tools for Tabula databases.
//!
//! # Commands
//!
//! - `inspect` - Summarize a snapshot file or database directory
//! - `backup` - Write a timestamped backup through a checkpoint
//! - `bench` - Drive a file database with concurrent procedures

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Tabula command-line database tools.
#[derive(Parser)]
#[command(name = "tabula")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the database directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a snapshot file or database directory
    Inspect {
        /// Show per-table details
        #[arg(short, long)]
        tables: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Write a timestamped backup of the database
    Backup {
        /// Directory receiving the backup file
        #[arg(short, long)]
        output: PathBuf,

        /// Database name used as the backup file prefix
        #[arg(short, long, default_value = "tabula")]
        name: String,
    },

    /// Run concurrent transfer procedures against a file database
    Bench {
        /// Worker threads submitting procedures
        #[arg(short, long, default_value = "8")]
        threads: usize,

        /// Procedures per thread
        #[arg(long, default_value = "10000")]
        procedures: usize,

        /// Number of accounts
        #[arg(short, long, default_value = "1000")]
        accounts: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect { tables, format } => {
            let path = cli.path.ok_or("Database path required for inspect")?;
            commands::inspect::run(&path, tables, &format)?;
        }
        Commands::Backup { output, name } => {
            let path = cli.path.ok_or("Database path required for backup")?;
            commands::backup::run(&path, &output, &name)?;
        }
        Commands::Bench {
            threads,
            procedures,
            accounts,
            format,
        } => {
            let path = cli.path.ok_or("Database path required for bench")?;
            let options = commands::bench::BenchOptions {
                threads,
                procedures,
                accounts,
            };
            commands::bench::run(&path, &options, &format)?;
        }
        Commands::Version => {
            println!("Tabula CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
