//! Shared wiring for the `relayclaw` binary.
//!
//! The commands in `main.rs` are thin; everything that turns an
//! [`relayclaw_config::AppConfig`] into running components lives here so
//! the integration tests can build the same runtime.

pub mod logging;
pub mod runtime;

pub use runtime::Runtime;
