//! `routeqa ask`: single-message or interactive question answering.

use std::path::Path;
use std::sync::Arc;

use routeqa_agent::{TurnEvent, TurnService};
use routeqa_config::AppConfig;
use routeqa_core::ThreadId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::runtime::{CliResult, config_file, load_config, turn_service};

pub async fn run(config_path: Option<&Path>, message: Option<String>, thread: String) -> CliResult<()> {
    let config = load_config(config_path)?;

    // Check for API key early: give a clear error
    if !config.has_api_key() && config.default_provider != "ollama" {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    GOOGLE_API_KEY=...    (Gemini, the default provider)");
        eprintln!("    OPENAI_API_KEY=...    (OpenAI)");
        eprintln!("    ROUTEQA_API_KEY=...   (generic)");
        eprintln!();
        eprintln!("  Or add api_key to {}", config_file(config_path).display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let service = turn_service(&config).await?;
    let thread = ThreadId::from(thread);

    match message {
        Some(msg) => {
            if !ask_once(&service, &thread, &msg).await {
                return Err("The question could not be answered.".into());
            }
        }
        None => interactive(&service, &thread, &config).await?,
    }
    Ok(())
}

/// Run one turn, printing tool progress to stderr and the answer to stdout.
/// Returns whether an answer was produced.
async fn ask_once(service: &Arc<TurnService>, thread: &ThreadId, message: &str) -> bool {
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let mut events = service.submit_turn_streaming(thread.clone(), message, cancel);
    let mut answered = false;
    while let Some(event) = events.recv().await {
        match event {
            TurnEvent::ToolsRequested { names } => eprintln!("  → {}", names.join(", ")),
            TurnEvent::ToolsCompleted { results } => {
                for failed in results.iter().filter(|r| !r.success) {
                    eprintln!("  ✗ {} failed", failed.name);
                }
            }
            TurnEvent::Answer { content } => {
                println!("{content}");
                answered = true;
            }
            TurnEvent::Failed { message } => eprintln!("  [Error] {message}"),
        }
    }
    watcher.abort();
    answered
}

async fn interactive(service: &Arc<TurnService>, thread: &ThreadId, config: &AppConfig) -> CliResult<()> {
    println!();
    println!("  routeqa interactive mode");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.default_model);
    println!("  Tools:     {}", service.agent().tools().names().join(", "));
    println!("  Thread:    {thread}");
    println!();
    println!("  Type your question and press Enter.");
    println!("  Type 'exit' to quit; Ctrl+C stops the current answer.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("  You > ");
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "exit" | "quit") {
            break;
        }
        ask_once(service, thread, line).await;
        println!();
    }

    println!();
    println!("  Goodbye!");
    Ok(())
}
