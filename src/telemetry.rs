//! Logging initialization.
//!
//! Log output goes through `tracing-subscriber` with an `EnvFilter`. The
//! filter comes from `RUST_LOG` when set, otherwise from the default below.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard filter directives (e.g. `intentflow=debug`)
//! - `INTENTFLOW_LOG_FORMAT`: `json` for one JSON object per line, anything
//!   else for human-readable output

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "intentflow=info";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Fallback filter directives.
    pub default_filter: String,
    /// Emit JSON lines instead of the pretty format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: DEFAULT_FILTER.to_string(),
            json: std::env::var("INTENTFLOW_LOG_FORMAT")
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}

impl LogConfig {
    /// Raise the default filter to debug (`--verbose`).
    pub fn verbose(mut self) -> Self {
        self.default_filter = "intentflow=debug".to_string();
        self
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_filter))
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` when a subscriber was already installed (e.g. by a test
/// harness); that is not an error.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = config.env_filter();
    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogConfig {
            default_filter: DEFAULT_FILTER.to_string(),
            json: false,
        };
        assert_eq!(config.default_filter, "intentflow=info");
        assert_eq!(config.verbose().default_filter, "intentflow=debug");
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = LogConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
    }
}
