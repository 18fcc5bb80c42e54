use async_trait::async_trait;
use logrelay_core::config::{AppConfig, StructuredSinkConfig};
use logrelay_core::{LogEntry, OutputError, Severity, Sink};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Output format for stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Pretty-printed, human-readable format
    #[default]
    Pretty,
    /// Compact JSON (one line per entry)
    Json,
}

/// JSON shape of one structured record
#[derive(Debug, Serialize)]
struct Record<'a> {
    time: String,
    level: Severity,
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    app: &'a str,
    env: &'a str,
}

pub type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Writes structured log records to stdout
pub struct StdoutSink {
    level: Severity,
    format: OutputFormat,
    app_name: String,
    environment: String,
    out: Mutex<Writer>,
}

impl StdoutSink {
    /// Create a sink writing to the process stdout
    pub fn new(config: &StructuredSinkConfig, app: &AppConfig) -> Self {
        Self::with_writer(config, app, Box::new(tokio::io::stdout()))
    }

    /// Create a sink writing to an arbitrary async writer
    pub fn with_writer(config: &StructuredSinkConfig, app: &AppConfig, out: Writer) -> Self {
        let format = if config.json {
            OutputFormat::Json
        } else {
            OutputFormat::Pretty
        };

        Self {
            level: config.level,
            format,
            app_name: app.name.clone(),
            environment: app.environment.clone(),
            out: Mutex::new(out),
        }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Format an entry according to the output format
    fn format_entry(&self, entry: &LogEntry) -> Result<String, OutputError> {
        match self.format {
            OutputFormat::Pretty => Ok(self.format_pretty(entry)),
            OutputFormat::Json => {
                let record = Record {
                    time: entry.timestamp_rfc3339(),
                    level: entry.severity,
                    msg: entry.body(),
                    correlation_id: entry.correlation_key.map(|k| k.to_string()),
                    app: &self.app_name,
                    env: &self.environment,
                };
                serde_json::to_string(&record)
                    .map_err(|e| OutputError::Serialization(e.to_string()))
            }
        }
    }

    /// Format an entry in a human-readable way
    fn format_pretty(&self, entry: &LogEntry) -> String {
        let mut parts = Vec::new();

        parts.push(format!("[{}]", entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f")));
        parts.push(format!("[{:<7}]", entry.severity.as_str()));

        if let Some(key) = entry.correlation_key {
            parts.push(format!("[{}]", key));
        }

        parts.push(entry.body().to_string());

        parts.join(" ")
    }
}

#[async_trait]
impl Sink for StdoutSink {
    fn name(&self) -> &'static str {
        "structured"
    }

    fn minimum_level(&self) -> Severity {
        self.level
    }

    async fn write(&self, entry: &LogEntry) -> Result<(), OutputError> {
        let mut output = self.format_entry(entry)?;
        output.push('\n');

        // One lock per line keeps concurrent callers from interleaving
        let mut out = self.out.lock().await;
        out.write_all(output.as_bytes())
            .await
            .map_err(|e| OutputError::Stdout(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| OutputError::Stdout(e.to_string()))?;

        debug!(format = ?self.format, "Wrote entry to stdout");
        Ok(())
    }

    async fn close(&self) {
        let mut out = self.out.lock().await;
        if let Err(e) = out.flush().await {
            debug!(error = %e, "Failed to flush stdout on close");
        }
    }
}
