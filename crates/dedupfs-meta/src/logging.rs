//! Structured logging setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{MetaError, MetaResult};

/// Log output configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Install the global subscriber when an engine opens. Embedders that
    /// set up their own subscriber leave this off.
    pub install: bool,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            install: false,
            json: false,
            filter: "info".to_string(),
        }
    }
}

fn parse_filter(directive: &str) -> MetaResult<EnvFilter> {
    EnvFilter::try_new(directive)
        .map_err(|e| MetaError::Config(format!("invalid log filter {:?}: {}", directive, e)))
}

/// Check the configured filter directive
pub fn validate(config: &LoggingConfig) -> MetaResult<()> {
    parse_filter(&config.filter).map(|_| ())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured filter.
/// Returns false, leaving the existing one in place, when a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> MetaResult<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_filter(&config.filter)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer()).try_init()
    };
    Ok(result.is_ok())
}
