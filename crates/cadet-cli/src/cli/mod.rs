//! CLI entry and dispatch.

use std::time::Duration;

use anyhow::{Context, Result};
use cadet_core::config;
use cadet_core::core::interrupt;
use clap::Parser;

use crate::logging;

mod commands;

/// Time allowed for background tasks (a pending stdin read, the log writer)
/// to finish once the command has returned.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(name = "cadet")]
#[command(version)]
#[command(about = "Conversational agent that answers with tools: files, tests, GitHub and MCP")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    chat: ChatArgs,
}

/// Options for the default chat mode.
#[derive(clap::Args, Debug, Clone, Default)]
struct ChatArgs {
    /// Root directory for file tools (default: current directory)
    #[arg(long, default_value = ".")]
    root: String,

    /// Checkpoint thread to resume or start (default: from config)
    #[arg(long, value_name = "ID")]
    thread: Option<String>,

    /// Override the model from config
    #[arg(long)]
    model: Option<String>,

    /// Override the per-run step limit
    #[arg(long, value_name = "N")]
    max_steps: Option<usize>,

    /// Skip MCP tool discovery
    #[arg(long = "no-mcp")]
    no_mcp: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Inspect or delete saved conversation checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum CheckpointCommands {
    /// Lists threads with a saved checkpoint
    List,
    /// Prints the latest checkpoint of a thread
    Show {
        #[arg(value_name = "THREAD_ID")]
        id: String,
    },
    /// Deletes every checkpoint of a thread
    Clear {
        #[arg(value_name = "THREAD_ID")]
        id: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // A missing .env is normal; variables may come from the shell.
    let _ = dotenvy::dotenv();

    let config = config::Config::load().context("load config")?;
    let _log_guard = logging::init(&config);
    interrupt::init().context("install signal handler")?;

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    let result = rt.block_on(dispatch(cli, config));
    rt.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn dispatch(cli: Cli, config: config::Config) -> Result<()> {
    let Some(command) = cli.command else {
        let ChatArgs {
            root,
            thread,
            model,
            max_steps,
            no_mcp,
        } = cli.chat;
        return commands::chat::run(
            commands::chat::ChatOptions {
                root: root.into(),
                thread_id: thread,
                model,
                max_steps,
                no_mcp,
            },
            config,
        )
        .await;
    };

    match command {
        Commands::Checkpoints { command } => match command {
            CheckpointCommands::List => commands::checkpoints::list(&config),
            CheckpointCommands::Show { id } => commands::checkpoints::show(&config, &id),
            CheckpointCommands::Clear { id } => commands::checkpoints::clear(&config, &id),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}
