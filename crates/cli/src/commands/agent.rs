//! `relayclaw agent`: Interactive or single-message chat mode.
//!
//! Runs the conversation loop inline on the `cli` channel and streams the
//! model's text to stdout as it arrives.

use std::io::Write;

use relayclaw::Runtime;
use relayclaw::runtime::BoxError;
use relayclaw_agent::{AgentStreamEvent, ConversationLoop};
use relayclaw_config::AppConfig;
use tokio::io::{AsyncBufReadExt, BufReader};

const CHANNEL: &str = "cli";

fn local_peer() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "local".into())
}

/// Stream one turn to stdout. Tool activity goes to stderr.
async fn turn(conversation: &ConversationLoop, peer: &str, text: &str) -> Result<(), BoxError> {
    let mut rx = conversation.run_conversation(CHANNEL, peer, text);
    let mut stdout = std::io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            AgentStreamEvent::Text { content } => {
                print!("{content}");
                stdout.flush()?;
            }
            AgentStreamEvent::ToolStart { tool_name, tool_args } => {
                eprintln!("\n  [tool] {tool_name} {tool_args}");
            }
            AgentStreamEvent::ToolResult { tool_name, tool_result } => {
                let preview: String = tool_result.chars().take(200).collect();
                eprintln!("  [tool] {tool_name} → {preview}");
            }
            AgentStreamEvent::Error { error } => {
                eprintln!("\n  [Error] {error}");
            }
            AgentStreamEvent::Done { usage } => {
                println!();
                if let Some(usage) = usage {
                    tracing::debug!(
                        prompt = usage.prompt_tokens,
                        completion = usage.completion_tokens,
                        "Turn complete"
                    );
                }
            }
        }
    }
    Ok(())
}

pub async fn run(config: AppConfig, message: Option<String>) -> Result<(), BoxError> {
    let runtime = Runtime::from_config(config).await?;
    let conversation = &runtime.conversation;
    let peer = local_peer();

    if let Some(msg) = message {
        return turn(conversation, &peer, &msg).await;
    }

    let provider = conversation.provider();
    println!();
    println!("  RelayClaw Agent: Interactive Mode");
    println!();
    println!("  Provider:  {}", provider.name());
    println!("  Model:     {}", provider.model());
    println!("  Tools:     {}", runtime.tools().names().join(", "));
    println!("  Session:   {CHANNEL}:{peer}");
    println!();
    println!("  Type your message and press Enter.");
    println!("  Type '/reset' to clear the session, 'exit' or Ctrl+C to quit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "exit" | "quit" => break,
            "/reset" => {
                let id = relayclaw_core::session::session_id(CHANNEL, &peer);
                let cleared = runtime.sessions().reset(&id).await?;
                println!("  {}", if cleared { "Session cleared." } else { "Nothing to clear." });
                continue;
            }
            _ => {}
        }

        print!("  Assistant > ");
        turn(conversation, &peer, line).await?;
        println!();
    }

    println!();
    println!("  Goodbye! 👋");
    println!();
    Ok(())
}
