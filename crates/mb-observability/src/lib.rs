//! # mb-observability
//!
//! Structured logging bootstrap for the misp-bridge workspace.

pub mod logging;

pub use logging::{init_logging, init_logging_with_config, LoggingConfig};
