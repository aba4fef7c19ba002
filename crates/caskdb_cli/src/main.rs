//! CaskDB CLI
//!
//! Command-line tools for CaskDB stores.
//!
//! # Commands
//!
//! - `decode-data` - Print the entries of a data file
//! - `decode-hint` - Print the records of a hint file
//! - `inspect` - Display store statistics and segment layout
//! - `verify` - Check every record checksum and hint file
//! - `merge` - Compact immutable segments to reclaim space

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// CaskDB command-line store tools.
#[derive(Parser)]
#[command(name = "caskdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
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
    /// Print the entries of a data file
    DecodeData {
        /// Data file to decode
        file: PathBuf,

        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print the records of a hint file
    DecodeHint {
        /// Hint file to decode
        hint: PathBuf,

        /// Data file to resolve values from
        #[arg(short, long)]
        data: Option<PathBuf>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Display store statistics and segment layout
    Inspect {
        /// Show per-segment details
        #[arg(short, long)]
        segments: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify record checksums and hint files
    Verify,

    /// Compact immutable segments to reclaim space
    Merge {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::DecodeData {
            file,
            limit,
            format,
        } => {
            commands::decode_data::run(&file, limit, &format)?;
        }
        Commands::DecodeHint { hint, data, format } => {
            commands::decode_hint::run(&hint, data.as_deref(), &format)?;
        }
        Commands::Inspect { segments, format } => {
            let path = cli.path.ok_or("Store path required for inspect")?;
            commands::inspect::run(&path, segments, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::Merge { format } => {
            let path = cli.path.ok_or("Store path required for merge")?;
            commands::merge::run(&path, &format)?;
        }
        Commands::Version => {
            println!("CaskDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("CaskDB Core v{}", caskdb_core::VERSION);
        }
    }

    Ok(())
}
