//! Scripted providers for tests in this and downstream crates.

use async_trait::async_trait;
use relayclaw_core::message::{ChatMessage, MessageToolCall, Usage};
use relayclaw_core::provider::{Provider, StreamChunk, ToolDefinition};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A provider that replays one chunk script per `chat` call.
///
/// Once the scripts run out, the last script is repeated, so a provider
/// that always asks for a tool is a one-element script list. Every request's
/// history is recorded for later inspection.
pub struct ScriptedProvider {
    scripts: Vec<Vec<StreamChunk>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// A single round that answers with text.
    pub fn text(answer: &str) -> Self {
        Self::new(vec![vec![
            StreamChunk::Text(answer.into()),
            StreamChunk::Done(Some(Usage::new(10, 5))),
        ]])
    }

    /// One round calling `tool` with `arguments`, then a text answer.
    pub fn tool_then_answer(tool: &str, arguments: &str, answer: &str) -> Self {
        Self::new(vec![
            vec![tool_call("call_1", tool, arguments), StreamChunk::Done(Some(Usage::new(10, 5)))],
            vec![StreamChunk::Text(answer.into()), StreamChunk::Done(Some(Usage::new(20, 5)))],
        ])
    }

    /// Asks for `tool` on every round, forever.
    pub fn always_tool(tool: &str) -> Self {
        Self::new(vec![vec![tool_call("call_n", tool, "{}"), StreamChunk::Done(None)]])
    }

    /// Fails immediately.
    pub fn failing(message: &str) -> Self {
        Self::new(vec![vec![StreamChunk::Error(message.into())]])
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Histories seen by each call, in order.
    pub fn histories(&self) -> Vec<Vec<ChatMessage>> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

pub fn tool_call(id: &str, name: &str, arguments: &str) -> StreamChunk {
    StreamChunk::ToolCall(MessageToolCall {
        id: id.into(),
        name: name.into(),
        arguments: arguments.into(),
    })
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    async fn chat(
        &self,
        history: &[ChatMessage],
        _tools: &[ToolDefinition],
        _system_prompt: &str,
    ) -> mpsc::Receiver<StreamChunk> {
        let index = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(history.to_vec());
            calls.len() - 1
        };
        let script = self
            .scripts
            .get(index)
            .or_else(|| self.scripts.last())
            .cloned()
            .unwrap_or_else(|| vec![StreamChunk::Done(None)]);

        let (tx, rx) = mpsc::channel(script.len().max(1));
        for chunk in script {
            let _ = tx.try_send(chunk);
        }
        rx
    }
}
