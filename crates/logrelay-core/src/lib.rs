//! logrelay Core
//!
//! Core types, configuration and the sink trait shared by every logrelay crate.

pub mod config;
pub mod error;
pub mod log_entry;
pub mod traits;

// Re-export commonly used types
pub use config::Config;
pub use error::{LogRelayError, OutputError, Result};
pub use log_entry::{concat, CorrelationKey, LogEntry, ParseSeverityError, Severity};
pub use traits::Sink;
