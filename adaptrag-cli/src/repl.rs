//! Single-question and interactive chat modes.

use adaptrag_core::types::{EngineEvent, NodeStatus, QueryResult};
use std::io::{self, BufRead, Write};
use tokio_stream::StreamExt;

use crate::runtime::Runtime;

/// Per-turn switches taken from the command line.
#[derive(Debug, Clone, Copy)]
pub struct TurnSettings {
    pub stream: bool,
    pub no_cache: bool,
    pub quiet: bool,
}

/// Answer one question and exit. With a session id the turn goes through the
/// conversation manager so history is loaded and saved.
pub async fn run_single_question(
    runtime: &Runtime,
    question: &str,
    session: Option<&str>,
    settings: TurnSettings,
) -> anyhow::Result<()> {
    announce(runtime, settings);
    match session {
        Some(id) => ask_in_session(runtime, id, question, settings).await,
        None => {
            let mut options = runtime.engine.default_options();
            options.skip_semantic_cache = settings.no_cache;
            if settings.stream {
                let events = runtime.engine.stream_query(question, options);
                let result = print_stream(events).await?;
                print_summary(&result, settings);
            } else {
                let result = runtime.engine.query(question, options).await?;
                println!("{}", result.answer);
                print_summary(&result, settings);
            }
            Ok(())
        }
    }
}

/// Chat until `/quit` or end of input.
pub async fn run_interactive(
    runtime: &Runtime,
    session: &str,
    settings: TurnSettings,
) -> anyhow::Result<()> {
    println!("\x1b[1;32m  AdaptRAG\x1b[0m");
    println!(
        "  Session: {} | Model: {} | Documents: {}",
        session,
        runtime.engine.config().llm.model,
        runtime.indexed
    );
    println!("  Type /help for commands, /quit to exit\n");
    announce(runtime, settings);

    let mut corrections = runtime.engine.subscribe_corrections();
    let stdin = io::stdin();
    loop {
        if let Some(rx) = corrections.as_mut() {
            while let Ok(correction) = rx.try_recv() {
                println!(
                    "\n\x1b[33m[Correction]\x1b[0m {} (confidence {:.0}%)",
                    correction.corrected_answer,
                    correction.confidence * 100.0
                );
            }
        }

        print!("\x1b[1;34m> \x1b[0m");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input).is_err() || input.is_empty() {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match input {
                "/quit" | "/exit" | "/q" => break,
                "/help" => print_help(),
                "/clear" => {
                    runtime.engine.clear_cache();
                    println!("  Semantic cache cleared.");
                }
                "/stats" => {
                    let metrics = runtime.engine.cache_metrics();
                    println!(
                        "  Cache: {} entries | {} hits | {} misses | hit rate {:.0}%",
                        runtime.engine.cache_len(),
                        metrics.hits,
                        metrics.misses,
                        metrics.hit_rate() * 100.0
                    );
                }
                "/session" => match runtime.conversations.session(session).await? {
                    Some(s) => println!(
                        "  {} messages | ~{} tokens | {} trimmed | {} summarized",
                        s.metadata.message_count,
                        s.metadata.total_tokens,
                        s.metadata.truncated_count,
                        s.metadata.summarized_rounds
                    ),
                    None => println!("  Session not saved yet."),
                },
                other => println!("  Unknown command: {}. Type /help.", other),
            }
            continue;
        }

        if let Err(e) = ask_in_session(runtime, session, input, settings).await {
            eprintln!("\x1b[31mError:\x1b[0m {}", e);
        }
    }
    Ok(())
}

async fn ask_in_session(
    runtime: &Runtime,
    session: &str,
    question: &str,
    settings: TurnSettings,
) -> anyhow::Result<()> {
    let mut options = runtime.engine.default_options();
    options.skip_semantic_cache = settings.no_cache;
    if settings.stream {
        let events = runtime
            .conversations
            .ask_streaming(session, question, options)
            .await?;
        let result = print_stream(events).await?;
        print_summary(&result, settings);
    } else {
        let result = runtime
            .conversations
            .ask_with_options(session, question, options)
            .await?;
        println!("\n\x1b[32mAdaptRAG:\x1b[0m {}", result.answer);
        print_summary(&result, settings);
    }
    Ok(())
}

/// Print tokens as they arrive; return the final result.
async fn print_stream(
    mut events: impl tokio_stream::Stream<Item = EngineEvent> + Unpin,
) -> anyhow::Result<QueryResult> {
    while let Some(event) = events.next().await {
        match event {
            EngineEvent::Token(token) => {
                print!("{}", token);
                let _ = io::stdout().flush();
            }
            EngineEvent::Workflow(step) => {
                tracing::debug!(node = %step.name, status = %step.status, "Workflow step");
            }
            EngineEvent::Done(result) => {
                println!();
                return Ok(*result);
            }
            EngineEvent::Error(message) => anyhow::bail!(message),
        }
    }
    anyhow::bail!("Stream ended without a result")
}

fn announce(runtime: &Runtime, settings: TurnSettings) {
    if settings.quiet {
        return;
    }
    if !runtime.completion_available {
        eprintln!("\x1b[33m  Completion unavailable: no LLM API key configured.\x1b[0m");
    }
    if runtime.indexed == 0 {
        eprintln!("\x1b[90m  No corpus indexed; pass --corpus <DIR> to answer from documents.\x1b[0m");
    }
}

fn print_summary(result: &QueryResult, settings: TurnSettings) {
    if settings.quiet {
        return;
    }
    let errors = result
        .trace
        .iter()
        .filter(|s| s.status == NodeStatus::Error)
        .count();
    let mut line = format!(
        "\x1b[90m  [{} docs | {} rewrite(s) | {} ms",
        result.retrieved_docs.len(),
        result.rewrite_count,
        result.duration_ms
    );
    if result.cache_hit {
        line.push_str(" | cache hit");
    }
    if let Some(grade) = &result.grade {
        line.push_str(&format!(" | grade {:.2}", grade.score));
    }
    if errors > 0 {
        line.push_str(&format!(" | {} degraded step(s)", errors));
    }
    line.push_str("]\x1b[0m");
    println!("{}", line);

    for doc in result.retrieved_docs.iter().take(3) {
        let source = doc
            .metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or(doc.id.as_str());
        println!("\x1b[90m    - {} ({:.3})\x1b[0m", source, doc.effective_score());
    }
}

fn print_help() {
    println!("  /help     Show this help");
    println!("  /stats    Semantic cache statistics");
    println!("  /session  Current session metadata");
    println!("  /clear    Clear the semantic cache");
    println!("  /quit     Exit");
}
