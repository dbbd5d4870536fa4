//! AdaptRAG CLI: question answering and chat over a local corpus.
//!
//! Provides both single-question and interactive chat modes.

mod commands;
mod corpus;
mod repl;
mod runtime;

use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// AdaptRAG: adaptive retrieval-augmented answers from your documents
#[derive(Parser, Debug)]
#[command(name = "adaptrag", version, about, long_about = None)]
struct Cli {
    /// Question to answer (starts interactive chat if omitted)
    question: Option<String>,

    /// Directory of .txt / .md files to index
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Session id for multi-turn chat
    #[arg(short, long)]
    session: Option<String>,

    /// Stream the answer token by token
    #[arg(long)]
    stream: bool,

    /// Bypass the semantic cache
    #[arg(long)]
    no_cache: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    /// Subcommand
    #[command(subcommand)]
    command: Option<commands::Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "adaptrag", "adaptrag")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "adaptrag.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let config = match &cli.config {
        Some(path) => adaptrag_core::config::load_config_file(path)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?,
        None => adaptrag_core::config::load_config(Some(&workspace), None)
            .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?,
    };

    if let Some(command) = cli.command {
        return commands::handle_command(command, config, &workspace).await;
    }

    let runtime = runtime::Runtime::build(config, &workspace, cli.corpus.as_deref()).await?;
    let settings = repl::TurnSettings {
        stream: cli.stream,
        no_cache: cli.no_cache,
        quiet: cli.quiet,
    };

    match cli.question {
        Some(question) => {
            repl::run_single_question(&runtime, &question, cli.session.as_deref(), settings).await
        }
        None => {
            let session = cli
                .session
                .unwrap_or_else(|| format!("chat-{}", Utc::now().format("%Y%m%d-%H%M%S")));
            repl::run_interactive(&runtime, &session, settings).await
        }
    }
}
