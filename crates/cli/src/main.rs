//! RelayClaw CLI: the main entry point.
//!
//! Commands:
//! - `gateway`: Start the HTTP/WebSocket gateway (optionally with a worker)
//! - `worker`: Consume the job queue and deliver replies
//! - `agent`: Interactive or single-message chat in the terminal
//! - `sessions`: List or reset stored sessions
//! - `config`: Show or initialize the configuration file

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relayclaw::runtime::BoxError;
use relayclaw_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "relayclaw",
    about = "RelayClaw: conversational agent gateway",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (default: $RELAYCLAW_CONFIG or ~/.relayclaw/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Gateway {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,

        /// Also run a queue worker in this process
        #[arg(long)]
        with_worker: bool,
    },

    /// Run a queue worker
    Worker,

    /// Chat with the agent
    Agent {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Manage stored sessions
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List sessions, most recently updated first
    List,
    /// Clear a session transcript
    Reset {
        /// Session id, `channel:peer`
        id: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn config_path(cli_path: Option<PathBuf>) -> PathBuf {
    cli_path
        .or_else(|| std::env::var("RELAYCLAW_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| AppConfig::config_dir().join("config.toml"))
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();
    let path = config_path(cli.config);

    // `config init` must work even when the existing file does not parse.
    if let Commands::Config {
        action: ConfigAction::Init { force },
    } = &cli.command
    {
        return commands::config_cmd::init(&path, *force);
    }

    let config = AppConfig::load_with_env(&path).map_err(|e| format!("Failed to load config: {e}"))?;
    relayclaw::logging::init(&config.logging, cli.verbose);

    match cli.command {
        Commands::Gateway { port, with_worker } => commands::gateway::run(config, port, with_worker).await?,
        Commands::Worker => commands::worker::run(config).await?,
        Commands::Agent { message } => commands::agent::run(config, message).await?,
        Commands::Sessions { action } => match action {
            SessionsAction::List => commands::sessions::list(config).await?,
            SessionsAction::Reset { id } => commands::sessions::reset(config, &id).await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(&config, &path)?,
            ConfigAction::Init { .. } => {}
        },
    }

    Ok(())
}
