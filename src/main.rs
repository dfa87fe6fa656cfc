//! Beacon loader main executable

pub mod common;
pub mod conf;
pub mod db;
pub mod err;
pub mod ingest;

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Beacon batch loader",
    long_about = "This tool loads a VCF file and pseudodata into the Beacon tables"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
enum Commands {
    /// Load a VCF file and pseudodata in one transaction.
    Load(ingest::Args),
    /// Create missing tables.
    InitSchema(db::Args),
    /// Remove all rows from the tables.
    Clear(db::Args),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(common::tracing_level(&cli.common))
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let result = tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Load(args) => ingest::run(&cli.common, args)?,
            Commands::InitSchema(args) => db::run_init_schema(&cli.common, args)?,
            Commands::Clear(args) => db::run_clear(&cli.common, args)?,
        }

        Ok::<(), anyhow::Error>(())
    });

    let term = Term::stderr();
    match result {
        Ok(()) => {
            let _ = term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")));
            ExitCode::SUCCESS
        }
        Err(e) => {
            let _ = term.write_line(&format!("Error: {:#}", e));
            match e.downcast_ref::<err::LoadError>() {
                Some(load_error) => ExitCode::from(load_error.exit_code()),
                None => ExitCode::FAILURE,
            }
        }
    }
}
