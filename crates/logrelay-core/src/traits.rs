use async_trait::async_trait;

use crate::error::OutputError;
use crate::log_entry::{LogEntry, Severity};

/// A logging backend with its own severity gate and lifecycle
///
/// The composite logger only calls [`Sink::write`] for entries whose severity
/// is at or above [`Sink::minimum_level`]. Sinks are shared between callers,
/// so every method takes `&self` and implementations keep their mutable state
/// behind locks.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Returns the name of the sink (for logging/debugging)
    fn name(&self) -> &'static str;

    /// Lowest severity this sink wants to receive
    fn minimum_level(&self) -> Severity;

    /// Write one entry
    ///
    /// Errors are reported to the caller of the sink, never to the
    /// application code that produced the log line.
    async fn write(&self, entry: &LogEntry) -> Result<(), OutputError>;

    /// Release resources; asynchronous sinks drain before returning
    async fn close(&self);

    async fn debug(&self, message: &str) -> Result<(), OutputError> {
        self.write(&LogEntry::new(Severity::Debug, message)).await
    }

    async fn info(&self, message: &str) -> Result<(), OutputError> {
        self.write(&LogEntry::new(Severity::Info, message)).await
    }

    async fn warning(&self, message: &str) -> Result<(), OutputError> {
        self.write(&LogEntry::new(Severity::Warning, message)).await
    }

    async fn error(&self, message: &str) -> Result<(), OutputError> {
        self.write(&LogEntry::new(Severity::Error, message)).await
    }

    async fn fatal(&self, message: &str) -> Result<(), OutputError> {
        self.write(&LogEntry::new(Severity::Fatal, message)).await
    }
}
