//! awg-manager observability
//!
//! Structured logging with pretty/JSON/compact console output and optional
//! rotated JSON log files.
//!
//! # Quick Start
//!
//! ```no_run
//! use awg_observability::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::default()).expect("Failed to init logging");
//! tracing::info!("Application started");
//! ```

pub mod config;
pub mod error;
pub mod logging;

pub use config::*;
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
