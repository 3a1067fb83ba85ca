//! routeqa CLI: the main entry point.
//!
//! Commands:
//! - `ask`: Ask a question, once or interactively
//! - `index`: Build a document corpus from text files
//! - `doctor`: Check the API key, database and corpora
//! - `config`: Write or show the configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "routeqa",
    about = "routeqa: answers questions from a sales database, product specs and customer feedback",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file to use instead of ~/.routeqa/config.toml
    #[arg(short, long, global = true, env = "ROUTEQA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question (interactive when no message is given)
    Ask {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Conversation thread to continue
        #[arg(short, long, default_value = "default")]
        thread: String,
    },

    /// Build a JSONL corpus for one of the document tools
    Index {
        #[arg(short, long, value_enum)]
        kind: CorpusKind,

        /// Directory of .txt, .md and .jsonl sources
        #[arg(short, long)]
        input: PathBuf,

        /// Output file (defaults to the configured corpus path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Replace an existing corpus
        #[arg(long)]
        force: bool,

        /// Skip embeddings; the corpus supports keyword search only
        #[arg(long)]
        no_embed: bool,
    },

    /// Diagnose configuration and backends
    Doctor,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration with secrets hidden
    Show,
    /// Print the configuration file path
    Path,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum CorpusKind {
    Product,
    Feedback,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Ask { message, thread } => commands::ask::run(config_path, message, thread).await?,
        Commands::Index {
            kind,
            input,
            output,
            force,
            no_embed,
        } => commands::index::run(config_path, kind, input, output, force, no_embed).await?,
        Commands::Doctor => commands::doctor::run(config_path).await?,
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_cmd::init(config_path, force)?,
            ConfigAction::Show => commands::config_cmd::show(config_path)?,
            ConfigAction::Path => commands::config_cmd::path(config_path),
        },
    }

    Ok(())
}
