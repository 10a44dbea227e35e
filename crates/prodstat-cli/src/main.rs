mod cli_args;
mod commands;
mod tracker_setup;

use std::process::ExitCode;

use clap::Parser;
use prodstat_types::{Diagnostic, ProdstatError};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::cli_args::Cli;

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

/// Exit status of the first prodstat error in the chain, else 1.
fn exit_code_for(error: &anyhow::Error) -> u8 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<ProdstatError>())
        .map(ProdstatError::exit_code)
        .unwrap_or(1)
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    if diagnostics.is_empty() {
        return;
    }
    eprintln!("{} diagnostics:", diagnostics.len());
    for diagnostic in diagnostics {
        eprintln!("  {diagnostic}");
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match commands::run(cli) {
        Ok(diagnostics) => {
            print_diagnostics(&diagnostics);
            ExitCode::SUCCESS
        }
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(exit_code_for(&error))
        }
    }
}
