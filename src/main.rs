//! taskherd CLI — configuration scaffolding.
//!
//! The scheduler itself is a library embedded in user binaries; the only
//! CLI surface is `generate-config`, which copies the bundled default
//! config for editing. Logs go to stderr.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "taskherd")]
#[command(about = "Resource-aware local scheduler for heavyweight compute jobs", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the bundled default config file for editing.
    GenerateConfig {
        /// Destination path (default: ./config.yaml).
        path: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    // `debug: true` in the effective config forces at least debug-level
    // logging, on top of whatever -v flags were given.
    let config = taskherd::Config::detect().unwrap_or_else(|e| {
        eprintln!("warning: {e:#}; using default config");
        taskherd::Config::default()
    });
    let verbose = if config.debug {
        cli.verbose.max(2)
    } else {
        cli.verbose
    };
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::GenerateConfig { path } => {
            let written = taskherd::Config::generate(path.as_deref())?;
            println!("{}", written.display());
        }
    }
    Ok(())
}
