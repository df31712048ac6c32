//! Session domain types and the [`SessionStore`] trait.
//!
//! A session is the transcript for one peer on one channel. Its id is
//! `"<channel>:<peer_id>"`, so the same peer always lands in the same session.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::message::{ChatMessage, Role};

/// Build the session id for a channel/peer pair.
pub fn session_id(channel: &str, peer_id: &str) -> String {
    format!("{channel}:{peer_id}")
}

/// A bounded, append-only conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub channel: String,
    pub peer_id: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(channel: &str, peer_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: session_id(channel, peer_id),
            channel: channel.to_string(),
            peer_id: peer_id.to_string(),
            messages: Vec::new(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append and trim to at most `max_messages`.
    pub fn push(&mut self, message: ChatMessage, max_messages: usize) {
        self.messages.push(message);
        trim_history(&mut self.messages, max_messages);
        self.updated_at = Utc::now();
    }

    /// Clear the transcript. Identity and creation time survive.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            channel: self.channel.clone(),
            peer_id: self.peer_id.clone(),
            message_count: self.messages.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing view of a session, without the transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub channel: String,
    pub peer_id: String,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Drop the oldest messages until at most `max` remain.
///
/// The kept window never opens on a `tool` message: a tool result whose
/// assistant call was trimmed away is dropped too, since providers reject
/// tool results that reference an unknown call.
pub fn trim_history(messages: &mut Vec<ChatMessage>, max: usize) {
    if messages.len() > max {
        let excess = messages.len() - max;
        messages.drain(..excess);
    }
    let orphans = messages.iter().take_while(|m| m.role == Role::Tool).count();
    if orphans > 0 {
        messages.drain(..orphans);
    }
}

/// Persistent storage for session transcripts.
///
/// Writes to the same session are last-writer-wins; implementations only
/// guarantee that each individual call is atomic.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Return the session for this channel/peer, creating it on first use.
    async fn get_or_create(&self, channel: &str, peer_id: &str) -> Result<Session, SessionError>;

    /// Look a session up by id.
    async fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError>;

    /// Append a message, then trim the transcript to the configured window.
    async fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError>;

    /// The current transcript, oldest first.
    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, SessionError>;

    /// Clear a transcript. Returns false when the session does not exist.
    async fn reset(&self, session_id: &str) -> Result<bool, SessionError>;

    /// All sessions, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError>;
}
