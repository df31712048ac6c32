//! The conversation loop that drives every reply.
//!
//! Each inbound message runs through a bounded **model → tools → model**
//! cycle:
//!
//! 1. **Receive** a message for a channel/peer session
//! 2. **Send** the transcript to the injected provider
//! 3. **If tool calls**: execute them in order, record results, loop back to 2
//! 4. **If text only**: finish
//!
//! Callers consume a stream of [`AgentStreamEvent`]s that always ends with
//! exactly one `done`.

pub mod conversation;
pub mod reflection;
pub mod stream_event;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use conversation::ConversationLoop;
pub use reflection::{PostProcessor, Reflection, ReflectionSummary};
pub use stream_event::AgentStreamEvent;
