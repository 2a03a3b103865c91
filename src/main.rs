use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tradeledger::cli::{Cli, run};

fn main() -> std::process::ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    run(Cli::parse())
}
