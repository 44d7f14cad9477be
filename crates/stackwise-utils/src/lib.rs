//! # Stackwise Utilities
//!
//! Shared utilities for the Stackwise workspace:
//! - [`logging`]: `tracing` subscriber setup
//! - [`settings`]: capture defaults from the environment

pub mod logging;
pub mod settings;

// Re-export commonly used items for convenience
pub use logging::{init_logging, init_logging_with_level, LogFormat, LogGuard, LogLevel, LoggingError};
pub use settings::{SettingsError, TraceSettings};
pub use tracing::{debug, error, info, trace, warn};
