//! Structured logging for graphshard.
//!
//! Built on `tracing`. The filter is read from the `GSHARD_LOG` environment
//! variable and falls back to the configured level.
//!
//! # Environment Variables
//!
//! - `GSHARD_LOG=info` - Default log level
//! - `GSHARD_LOG=debug` - Verbose logging, including every committed batch
//! - `GSHARD_LOG=warn,graphshard_storage::loader=debug` - Combined filters
//!
//! # Example
//!
//! ```ignore
//! use graphshard_storage::logging;
//!
//! // Initialize logging (call once at startup)
//! logging::init();
//!
//! // Or from the [logging] section of the configuration
//! logging::init_from_config(&config.logging);
//! ```

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "GSHARD_LOG";

/// Initializes the global tracing subscriber at `info`.
///
/// Subsequent calls are ignored (tracing only allows one subscriber).
pub fn init() {
    init_with_default("info");
}

/// Initializes the global tracing subscriber with a custom default level.
///
/// # Arguments
/// * `default_level` - Default log level if `GSHARD_LOG` is not set
pub fn init_with_default(default_level: &str) {
    let subscriber = fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = subscriber.try_init();
}

/// Initializes logging with JSON output format, one object per event.
pub fn init_json(default_level: &str) {
    let subscriber = fmt()
        .with_env_filter(filter(default_level))
        .with_target(true)
        .json();

    let _ = subscriber.try_init();
}

/// Initializes logging from the `[logging]` configuration section.
pub fn init_from_config(config: &LoggingConfig) {
    if config.json {
        init_json(&config.level);
    } else {
        init_with_default(&config.level);
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_does_not_panic() {
        // Multiple calls should not panic
        init();
        init_with_default("warn");
        init_from_config(&LoggingConfig::default());
    }
}
