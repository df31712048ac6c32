//! In-memory session store: useful for tests and single-process setups.

use async_trait::async_trait;
use relayclaw_core::error::SessionError;
use relayclaw_core::message::ChatMessage;
use relayclaw_core::session::{Session, SessionStore, SessionSummary, session_id};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Sessions held in a map, each trimmed to `max_messages` on append.
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    max_messages: usize,
}

impl InMemorySessionStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_messages,
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(50)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(&self, channel: &str, peer_id: &str) -> Result<Session, SessionError> {
        let id = session_id(channel, peer_id);
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .entry(id)
            .or_insert_with(|| Session::new(channel, peer_id))
            .clone())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn append(&self, session_id: &str, message: ChatMessage) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.push(message, self.max_messages);
        Ok(())
    }

    async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>, SessionError> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.messages.clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    async fn reset(&self, session_id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.write().await;
        Ok(match sessions.get_mut(session_id) {
            Some(session) => {
                session.reset();
                true
            }
            None => false,
        })
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let sessions = self.sessions.read().await;
        let mut out: Vec<SessionSummary> = sessions.values().map(Session::summary).collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }
}
