mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, LogFormat};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.log_format);

    match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check(args) => {
            if !commands::check::run(args).await? {
                std::process::exit(1);
            }
        }
        Commands::Nodes { source } => commands::nodes::run(source).await?,
        Commands::Watch(args) => commands::watch::run(args).await?,
    }

    Ok(())
}

fn setup_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    // logs go to stderr so stdout carries only the report
    match format {
        LogFormat::Text => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
