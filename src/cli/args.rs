//! CLI argument definitions using clap

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::pipeline::StageKind;

/// callscribe - A staged, queue-driven transcription pipeline for recorded phone calls
#[derive(Parser, Debug)]
#[command(name = "callscribe")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Listen port (overrides <STAGE>_PORT and the config file)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Enable verbose output
    #[arg(long = "v", global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one pipeline stage as an HTTP worker
    Serve {
        /// Stage to run
        #[arg(value_enum)]
        stage: StageKind,
    },

    /// Run every stage and the task deliverer in one process
    Pipeline,

    /// Run the durable queue deliverer alone
    Deliver,

    /// Print a persisted request record as JSON
    Show {
        /// Request ID
        id: String,
    },

    /// Check storage, queues and stage routing
    Doctor {
        /// Output diagnostics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_takes_stage_and_global_flags() {
        let cli = Cli::try_parse_from(["callscribe", "serve", "tagging-qa", "--port", "9001", "--v"])
            .unwrap();
        assert_eq!(cli.port, Some(9001));
        assert!(cli.verbose);
        match cli.command {
            Commands::Serve { stage } => assert_eq!(stage, StageKind::TaggingQa),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn unknown_stage_is_rejected() {
        assert!(Cli::try_parse_from(["callscribe", "serve", "redaction"]).is_err());
    }
}
