//! Phenoscore worker main executable

pub mod common;
pub mod err;
pub mod pheno;

use std::process::{ExitCode, Termination};

use clap::{Args, Parser, Subcommand};
use console::{Emoji, Term};

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Phenotype and face similarity of cases",
    long_about = "This tool compares cases by their ontology terms and facial embeddings"
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
#[derive(Debug, Subcommand)]
enum Commands {
    /// Phenotype-related commands.
    Pheno(Pheno),
}

/// Parsing of "pheno *" sub commands.
#[derive(Debug, Args)]
#[command(args_conflicts_with_subcommands = true)]
struct Pheno {
    /// The sub command to run
    #[command(subcommand)]
    command: PhenoCommands,
}

/// Enum supporting the parsing of "pheno *" sub commands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
enum PhenoCommands {
    Compare(pheno::query::Args),
    Matrix(pheno::matrix::Args),
    Prepare(pheno::prepare::Args),
    Prune(pheno::prune::Args),
}

fn run(cli: &Cli) -> Result<(), anyhow::Error> {
    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();

    // Install collector and go into sub commands.
    let term = Term::stderr();
    tracing::subscriber::with_default(collector, || {
        match &cli.command {
            Commands::Pheno(pheno) => match &pheno.command {
                PhenoCommands::Compare(args) => pheno::query::run(&cli.common, args)?,
                PhenoCommands::Matrix(args) => pheno::matrix::run(&cli.common, args)?,
                PhenoCommands::Prepare(args) => pheno::prepare::run(&cli.common, args)?,
                PhenoCommands::Prune(args) => pheno::prune::run(&cli.common, args)?,
            },
        }

        Ok::<(), anyhow::Error>(())
    })?;
    term.write_line(&format!("All done. Have a nice day!{}", Emoji(" 😃", "")))?;

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:?}", e);
            // Scoring errors carry their own exit code.
            match e.downcast::<err::Error>() {
                Ok(e) => e.report(),
                Err(_) => ExitCode::FAILURE,
            }
        }
    }
}
