//! Parley CLI: the main entry point.
//!
//! Commands:
//! - `chat`: Interactive REPL on one session, with in-process peers
//! - `ask`: Answer a single question and exit
//! - `tools`: List the tools offered by the configured providers

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use parley_config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "parley",
    about = "Parley: ReAct agents that stream, call tools and talk to each other",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.parley/config.toml
    #[arg(short, long, global = true, env = "PARLEY_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with an agent session
    Chat {
        /// Session to chat as
        #[arg(short, long, default_value = "main")]
        session: String,

        /// Extra sessions to host in-process so they can be messaged
        #[arg(short, long = "peer")]
        peers: Vec<String>,
    },

    /// Ask a single question and print the answer
    Ask {
        question: String,

        /// Session that keeps the conversation
        #[arg(short, long, default_value = "main")]
        session: String,
    },

    /// List the tools the configured providers offer
    Tools,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_json);

    let config = match &cli.config {
        Some(path) => AppConfig::load_at(path),
        None => AppConfig::load(),
    }
    .map_err(|e| format!("Failed to load config: {e}"))?;

    match cli.command {
        Commands::Chat { session, peers } => commands::chat::run(config, session, peers).await?,
        Commands::Ask { question, session } => commands::ask::run(config, question, session).await?,
        Commands::Tools => commands::tools::run(config).await?,
    }

    Ok(())
}

/// Logs go to stderr so the conversation on stdout stays readable.
fn init_tracing(verbose: bool, json: bool) {
    let filter = if verbose { "parley=debug" } else { "parley=info" };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
