//! Post-conversation processing.
//!
//! A [`PostProcessor`] sees the session after a conversation finishes. It
//! runs on a detached task; the caller never waits for it and its failures
//! only show up in the log.

use async_trait::async_trait;
use relayclaw_core::message::Role;
use relayclaw_core::session::Session;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[async_trait]
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, session: &Session) -> relayclaw_core::Result<()>;
}

/// Run `processor` on its own task. Errors and panics stay inside it.
pub fn spawn_detached(processor: Arc<dyn PostProcessor>, session: Session) {
    tokio::spawn(async move {
        let name = processor.name().to_string();
        let inner = tokio::spawn(async move { processor.process(&session).await });
        match inner.await {
            Ok(Ok(())) => debug!(processor = %name, "Post-processing complete"),
            Ok(Err(e)) => warn!(processor = %name, error = %e, "Post-processing failed"),
            Err(e) => warn!(processor = %name, error = %e, "Post-processing task panicked"),
        }
    });
}

/// What a reflection pass learned about one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionSummary {
    pub session_id: String,
    pub user_messages: usize,
    pub tool_messages: usize,
    pub topics: Vec<String>,
}

/// Heuristic reflection: message counts plus the most frequent words the
/// user typed. No extra model call.
pub struct Reflection;

impl Reflection {
    pub fn summarize(session: &Session) -> Option<ReflectionSummary> {
        let user: Vec<&str> = session
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .collect();
        if user.is_empty() {
            return None;
        }
        let tool_messages = session.messages.iter().filter(|m| m.role == Role::Tool).count();

        Some(ReflectionSummary {
            session_id: session.id.clone(),
            user_messages: user.len(),
            tool_messages,
            topics: topic_hints(&user, 5),
        })
    }
}

/// Most frequent words longer than three characters, ties broken
/// alphabetically. Falls back to `["general"]`.
pub fn topic_hints(texts: &[&str], limit: usize) -> Vec<String> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for word in text
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| w.chars().count() > 3)
        {
            *freq.entry(word.to_lowercase()).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let topics: Vec<String> = ranked.into_iter().take(limit).map(|(w, _)| w).collect();

    if topics.is_empty() {
        vec!["general".to_string()]
    } else {
        topics
    }
}

#[async_trait]
impl PostProcessor for Reflection {
    fn name(&self) -> &str {
        "reflection"
    }

    async fn process(&self, session: &Session) -> relayclaw_core::Result<()> {
        if let Some(summary) = Self::summarize(session) {
            info!(
                session = %summary.session_id,
                user_messages = summary.user_messages,
                tool_messages = summary.tool_messages,
                topics = %summary.topics.join(", "),
                "Reflection"
            );
        }
        Ok(())
    }
}
