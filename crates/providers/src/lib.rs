//! LLM provider adapters for RelayClaw.
//!
//! All adapters implement `relayclaw_core::Provider` and normalize their
//! vendor's wire protocol into `StreamChunk`s:
//! - [`OpenAiCompatProvider`]: incremental token and tool-call deltas over SSE
//! - [`AnthropicProvider`]: content-block events folded into a message snapshot
//! - [`ResponsesProvider`]: one buffered request with manual redirect handling
//!
//! [`build_from_config`] selects and constructs the configured one.

pub mod anthropic;
pub mod openai_compat;
pub mod responses;
pub mod router;
mod sse;

pub use anthropic::AnthropicProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use responses::ResponsesProvider;
pub use router::build_from_config;
