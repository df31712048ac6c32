//! # RelayClaw Core
//!
//! Domain types, traits, and error definitions for the RelayClaw agent gateway.
//! Nothing in here talks to the network or the filesystem; it defines the
//! vocabulary every other crate implements against.
//!
//! ## Design Philosophy
//!
//! Every seam is a trait here and the implementations live in their own crates:
//! - [`Provider`]: one adapter per vendor wire protocol, normalized to [`StreamChunk`]
//! - [`Tool`] / [`ToolRegistry`]: named capabilities the model may invoke
//! - [`SessionStore`]: bounded per-peer transcripts
//! - [`Channel`]: how a finished answer goes back to the user
//! - [`JobQueue`]: the hand-off between the API process and background workers

pub mod error;
pub mod message;
pub mod provider;
pub mod channel;
pub mod tool;
pub mod session;
pub mod job;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{ChatMessage, MessageToolCall, Role, Usage};
pub use provider::{Provider, StreamChunk, ToolDefinition};
pub use channel::Channel;
pub use tool::{Tool, ToolRegistry};
pub use session::{Session, SessionStore, SessionSummary};
pub use job::{Job, JobQueue, Priority, QueueStats, QueuedJob};
