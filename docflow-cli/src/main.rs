mod cli;
mod collaborators;
mod commands;

use crate::cli::{Args, Commands, ConfigCommand, StatesCommand};
use clap::Parser;
use docflow::logging::{LoggingOptions, cleanup_old_logs, init_logging};
use std::process;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let filter = if args.verbose {
        Some("docflow=debug,docflow_cli=debug".to_string())
    } else if args.quiet {
        Some("warn".to_string())
    } else {
        None
    };
    let options = LoggingOptions {
        filter,
        log_dir: args.log_dir.clone(),
        json: args.json_logs,
        ..Default::default()
    };
    let _guard = init_logging(&options)?;

    if let Some(dir) = options.log_dir.clone() {
        let retention_days = options.retention_days;
        tokio::spawn(async move {
            if let Err(e) = cleanup_old_logs(&dir, retention_days).await {
                warn!(error = %e, "Failed to clean up old log files");
            }
        });
    }

    let config_path = commands::config_path(args.config.as_deref())?;

    // Init must work even when the existing file no longer parses.
    if let Commands::Config {
        command: ConfigCommand::Init { force },
    } = args.command
    {
        return commands::init_config(&config_path, force);
    }

    let config = commands::load_config(&config_path)?;

    match args.command {
        Commands::Run {
            template,
            files,
            queue,
            basic,
            output,
        } => commands::run(config, &template, files, queue, basic, output.as_deref()).await,
        Commands::Resume { state_file, output } => {
            commands::resume(config, &state_file, output.as_deref()).await
        }
        Commands::States { command } => match command {
            StatesCommand::List => commands::list_states(&config).await,
            StatesCommand::Delete { state_file } => {
                commands::delete_state(&config, &state_file).await
            }
        },
        Commands::Config { .. } => commands::show_config(&config),
    }
}
