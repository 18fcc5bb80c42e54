//! logrelay output
//!
//! Sinks for the composite logger: a plain line sink for files or stdout, a
//! structured stdout sink, and the correlated Telegram alert sink.

pub mod alert;
pub mod file;
pub mod metrics;
pub mod stdout;

pub use alert::{
    AlertHeader, AlertMessage, AlertSink, AlertTransport, CorrelationStore, DispatchQueue,
    TelegramTransport,
};
pub use file::{FileSink, RotatingFile, RotationStrategy};
pub use metrics::AlertMetrics;
pub use stdout::{OutputFormat, StdoutSink};
