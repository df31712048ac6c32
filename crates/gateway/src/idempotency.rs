//! Event deduplication for inbound webhooks.
//!
//! Platforms redeliver events they think were lost. Each event key is
//! remembered for a TTL; a periodic sweep evicts expired keys.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct IdempotencyStore {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True if `key` was seen within the TTL. Otherwise the key is recorded
    /// and this returns false.
    pub fn is_duplicate(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = seen.get(key) {
            if now.duration_since(*at) < self.ttl {
                debug!(key = %key, "Duplicate event detected");
                return true;
            }
        }
        seen.insert(key.to_string(), now);
        false
    }

    /// Forget `key` so a redelivery of the same event is accepted again.
    pub fn forget(&self, key: &str) {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }

    /// Drop expired keys. Returns how many were evicted.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let before = seen.len();
        seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        let evicted = before - seen.len();
        if evicted > 0 {
            debug!(evicted, remaining = seen.len(), "Idempotency store cleanup");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep expired keys every `interval` until the handle is aborted.
    pub fn spawn_cleanup(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.evict_expired();
            }
        })
    }
}
