//! callscribe - A staged, queue-driven transcription pipeline for recorded phone calls
//!
//! Entry point for the callscribe CLI application.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use callscribe::cli::{commands, Cli, Commands};
use callscribe::config::Settings;

/// RUST_LOG wins, then --v, then the configured level
fn init_logging(verbose: bool, configured: &str) {
    let default_level = if verbose { "debug" } else { configured };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            callscribe::cli::completions::print(shell);
        }
        command => {
            // Load configuration only for runtime commands.
            let settings = Settings::load()?;
            init_logging(cli.verbose, &settings.general.log_level);

            match command {
                Commands::Serve { stage } => {
                    commands::serve_stage(&settings, stage, cli.port).await?;
                }
                Commands::Pipeline => {
                    commands::run_pipeline(&settings, cli.port).await?;
                }
                Commands::Deliver => {
                    commands::run_deliverer(&settings).await?;
                }
                Commands::Show { id } => {
                    commands::show_request(&settings, &id).await?;
                }
                Commands::Doctor { json } => {
                    commands::run_doctor(&settings, json).await?;
                }
                Commands::Config(config_cmd) => {
                    commands::config_command(&settings, config_cmd)?;
                }
                Commands::Completions { .. } => unreachable!(),
            }
        }
    }

    Ok(())
}
