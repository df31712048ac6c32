//! Tracing subscriber setup.

use relayclaw_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// The filter directive to use when `RUST_LOG` is not set.
pub fn default_directive(config: &LoggingConfig, verbose: bool) -> String {
    if verbose {
        "debug".into()
    } else if config.level.trim().is_empty() {
        "info".into()
    } else {
        config.level.clone()
    }
}

/// Install the global subscriber. `RUST_LOG` wins; otherwise `--verbose`,
/// then the config level.
pub fn init(config: &LoggingConfig, verbose: bool) {
    let directive = default_directive(config, verbose);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&directive));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    // A second init (tests, embedding) keeps the first subscriber.
    let _ = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
}
