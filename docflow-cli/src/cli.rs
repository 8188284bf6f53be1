use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "docflow-cli")]
#[command(about = "Extract structured fields from batches of documents")]
#[command(version)]
pub struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, global = true, env = "DOCFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Also write daily rolling log files to this directory
    #[arg(long, global = true, env = "DOCFLOW_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process a batch of text documents
    Run {
        /// Extraction template (JSON or TOML)
        #[arg(short, long)]
        template: PathBuf,

        /// Documents to process, in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Route the batch through the processing queue
        #[arg(long)]
        queue: bool,

        /// Disable retry, monitoring, detailed progress and state preservation
        #[arg(long)]
        basic: bool,

        /// Write the session as JSON to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Continue a cancelled batch from a saved state file
    Resume {
        state_file: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Manage saved processing states
    States {
        #[command(subcommand)]
        command: StatesCommand,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum StatesCommand {
    /// List saved states, newest first
    List,
    /// Delete a saved state file
    Delete { state_file: PathBuf },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_run_arguments() {
        let args = Args::parse_from([
            "docflow", "run", "-t", "invoice.json", "a.txt", "b.txt", "--queue",
        ]);
        match args.command {
            Commands::Run {
                template,
                files,
                queue,
                basic,
                output,
            } => {
                assert_eq!(template, PathBuf::from("invoice.json"));
                assert_eq!(files.len(), 2);
                assert!(queue);
                assert!(!basic);
                assert!(output.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_run_requires_files() {
        assert!(Args::try_parse_from(["docflow", "run", "-t", "t.json"]).is_err());
    }

    #[test]
    fn test_states_delete() {
        let args = Args::parse_from(["docflow", "-q", "states", "delete", "s.json"]);
        assert!(args.quiet);
        assert!(matches!(
            args.command,
            Commands::States {
                command: StatesCommand::Delete { .. }
            }
        ));
    }
}
