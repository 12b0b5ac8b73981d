use anyhow::Context;
use clap::Parser;
use profsession::TraceLayer;
use profsession::cli::{Cli, Command};
use profsession::error::exit_code;
use profsession_runtime::TrackingAllocator;
use std::process::ExitCode;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[global_allocator]
static ALLOC: TrackingAllocator = TrackingAllocator;

fn main() -> ExitCode {
    init_logging();

    match run() {
        Ok(()) => ExitCode::from(exit_code::SUCCESS as u8),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(err) = e.downcast_ref::<profsession::Error>() {
                ExitCode::from(err.exit_code() as u8)
            } else {
                ExitCode::from(exit_code::GENERAL_ERROR as u8)
            }
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(TraceLayer)
        .init();
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            // Validate CLI arguments
            args.validate()
                .map_err(profsession::Error::InvalidArgument)
                .context("Invalid arguments")?;
            profsession::commands::run::run(&args)?;
        }
        Command::Modes => {
            profsession::commands::modes::run();
        }
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "profsession", &mut std::io::stdout());
        }
    }

    Ok(())
}
