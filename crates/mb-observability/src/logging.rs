//! Structured logging via the tracing ecosystem.
//!
//! `RUST_LOG` wins when set; otherwise the configured level applies to the
//! workspace crates. Production wiring switches to JSON lines.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    /// Emit JSON lines instead of human-readable output.
    pub json_format: bool,
    /// Include module targets in each line.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            json_format: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Verbose human-readable output for development.
    pub fn development() -> Self {
        Self {
            level: Level::DEBUG,
            ..Default::default()
        }
    }

    /// JSON output for production log shipping.
    pub fn production() -> Self {
        Self {
            json_format: true,
            ..Default::default()
        }
    }
}

/// Initializes logging with defaults.
pub fn init_logging() {
    init_logging_with_config(LoggingConfig::default());
}

/// Initializes the global subscriber with the given configuration.
pub fn init_logging_with_config(config: LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "mb_core={level},mb_misp={level},mb_cli={level}",
            level = config.level
        ))
    });

    if config.json_format {
        let fmt_layer = fmt::layer().json().with_target(config.include_target);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    } else {
        let fmt_layer = fmt::layer().with_target(config.include_target);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
    }
}
