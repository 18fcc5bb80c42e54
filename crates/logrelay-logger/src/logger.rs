use logrelay_core::{Config, LogEntry, Severity, Sink};
use logrelay_output::{AlertMetrics, AlertSink, FileSink, StdoutSink};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default time a fatal call waits for asynchronous sinks before exiting
pub const DEFAULT_FATAL_GRACE: Duration = Duration::from_secs(2);

/// Logger that fans every call out to its sinks, in order
///
/// Each sink receives the entry only when the call's severity is at or above
/// the sink's minimum level. A failing sink is reported through `tracing` and
/// never affects the caller or the other sinks.
pub struct CompositeLogger {
    sinks: Vec<Arc<dyn Sink>>,
    fatal_grace: Duration,
    alert_metrics: Option<Arc<AlertMetrics>>,
}

impl CompositeLogger {
    /// Create a logger without sinks
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            fatal_grace: DEFAULT_FATAL_GRACE,
            alert_metrics: None,
        }
    }

    /// Create a logger from configuration
    ///
    /// Disabled sinks are not constructed. A sink that fails to start is
    /// skipped with a warning, so the result may have no sinks at all.
    pub async fn from_config(config: &Config) -> Self {
        let mut logger = Self::new().with_fatal_grace(config.logger.fatal_grace());

        let file = &config.logger.file;
        if file.enabled {
            match FileSink::new(file) {
                Ok(sink) => logger.push(Arc::new(sink)),
                Err(e) => warn!(sink = "file", error = %e, "Failed to create sink, skipping"),
            }
        }

        let structured = &config.logger.structured;
        if structured.enabled {
            logger.push(Arc::new(StdoutSink::new(structured, &config.app)));
        }

        let alert = &config.logger.alert;
        if alert.enabled {
            match AlertSink::connect(alert, &config.app).await {
                Ok(sink) => logger = logger.with_alert_sink(sink),
                Err(e) => warn!(sink = "alert", error = %e, "Failed to create sink, skipping"),
            }
        }

        logger
    }

    /// Add a sink after the existing ones
    pub fn with_sink<S: Sink + 'static>(mut self, sink: S) -> Self {
        self.push(Arc::new(sink));
        self
    }

    /// Add an alert sink and keep a handle on its metrics
    pub fn with_alert_sink(mut self, sink: AlertSink) -> Self {
        self.alert_metrics = Some(sink.shared_metrics());
        self.push(Arc::new(sink));
        self
    }

    pub fn with_fatal_grace(mut self, grace: Duration) -> Self {
        self.fatal_grace = grace;
        self
    }

    fn push(&mut self, sink: Arc<dyn Sink>) {
        info!(sink = sink.name(), level = %sink.minimum_level(), "Adding sink to logger");
        self.sinks.push(sink);
    }

    /// Get the number of sinks
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Get the names of all sinks, in call order
    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    pub fn fatal_grace(&self) -> Duration {
        self.fatal_grace
    }

    /// Metrics of the alert sink, when one was added
    pub fn alert_metrics(&self) -> Option<&AlertMetrics> {
        self.alert_metrics.as_deref()
    }

    async fn broadcast(&self, severity: Severity, message: String) {
        let entry = LogEntry::new(severity, message);

        for sink in &self.sinks {
            if !severity.admitted_by(sink.minimum_level()) {
                continue;
            }

            if let Err(e) = sink.write(&entry).await {
                warn!(sink = sink.name(), severity = %severity, error = %e, "Sink write failed");
            }
        }
    }

    pub async fn debug(&self, message: impl Into<String>) {
        self.broadcast(Severity::Debug, message.into()).await
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.broadcast(Severity::Info, message.into()).await
    }

    pub async fn warning(&self, message: impl Into<String>) {
        self.broadcast(Severity::Warning, message.into()).await
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.broadcast(Severity::Error, message.into()).await
    }

    /// Log at Fatal, give the sinks the grace window, then exit with status 1
    ///
    /// Never returns.
    pub async fn fatal(&self, message: impl Into<String>) {
        self.broadcast(Severity::Fatal, message.into()).await;
        tokio::time::sleep(self.fatal_grace).await;
        std::process::exit(1)
    }

    /// Close every sink in order
    pub async fn close(&self) {
        for sink in &self.sinks {
            debug!(sink = sink.name(), "Closing sink");
            sink.close().await;
        }
    }
}

impl Default for CompositeLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use logrelay_core::config::{AlertSinkConfig, AppConfig};
    use logrelay_core::OutputError;
    use logrelay_output::AlertTransport;
    use parking_lot::Mutex;

    type Journal = Arc<Mutex<Vec<(&'static str, Severity, String)>>>;

    struct RecordingSink {
        name: &'static str,
        level: Severity,
        journal: Journal,
        closed: Arc<Mutex<Vec<&'static str>>>,
    }

    impl RecordingSink {
        fn new(name: &'static str, level: Severity, journal: &Journal) -> Self {
            Self {
                name,
                level,
                journal: Arc::clone(journal),
                closed: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &'static str {
            self.name
        }

        fn minimum_level(&self) -> Severity {
            self.level
        }

        async fn write(&self, entry: &LogEntry) -> Result<(), OutputError> {
            self.journal
                .lock()
                .push((self.name, entry.severity, entry.raw.clone()));
            Ok(())
        }

        async fn close(&self) {
            self.closed.lock().push(self.name);
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn minimum_level(&self) -> Severity {
            Severity::Debug
        }

        async fn write(&self, _entry: &LogEntry) -> Result<(), OutputError> {
            Err(OutputError::Stdout("broken pipe".to_string()))
        }

        async fn close(&self) {}
    }

    #[derive(Default)]
    struct CapturingTransport {
        bodies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl AlertTransport for CapturingTransport {
        fn name(&self) -> &str {
            "capturing"
        }

        async fn send(&self, _destination: &str, body: &str) -> Result<(), OutputError> {
            self.bodies.lock().push(body.to_string());
            Ok(())
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_empty_logger() {
        let logger = CompositeLogger::new();
        assert_eq!(logger.sink_count(), 0);
        assert_eq!(logger.fatal_grace(), DEFAULT_FATAL_GRACE);

        logger.info("nobody listens").await;
        logger.error("still fine").await;
        logger.close().await;
    }

    #[tokio::test]
    async fn test_level_gating() {
        let journal = journal();
        let logger = CompositeLogger::new()
            .with_sink(RecordingSink::new("all", Severity::Debug, &journal))
            .with_sink(RecordingSink::new("warn", Severity::Warning, &journal))
            .with_sink(RecordingSink::new("err", Severity::Error, &journal));

        logger.debug("d").await;
        logger.info("i").await;
        logger.warning("w").await;
        logger.error("e").await;

        let journal = journal.lock();
        let count = |name: &str| journal.iter().filter(|(n, _, _)| *n == name).count();
        assert_eq!(count("all"), 4);
        assert_eq!(count("warn"), 2);
        assert_eq!(count("err"), 1);
        assert!(journal
            .iter()
            .filter(|(n, _, _)| *n == "warn")
            .all(|(_, s, _)| *s >= Severity::Warning));
    }

    #[tokio::test]
    async fn test_sinks_called_in_order() {
        let journal = journal();
        let logger = CompositeLogger::new()
            .with_sink(RecordingSink::new("first", Severity::Debug, &journal))
            .with_sink(RecordingSink::new("second", Severity::Debug, &journal));
        assert_eq!(logger.sink_names(), vec!["first", "second"]);

        logger.info("one").await;
        logger.info("two").await;

        let order: Vec<(&str, String)> = journal
            .lock()
            .iter()
            .map(|(n, _, raw)| (*n, raw.clone()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("first", "one".to_string()),
                ("second", "one".to_string()),
                ("first", "two".to_string()),
                ("second", "two".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_sink_failure_is_contained() {
        let journal = journal();
        let logger = CompositeLogger::new()
            .with_sink(FailingSink)
            .with_sink(RecordingSink::new("after", Severity::Debug, &journal));

        logger.error("disk full").await;

        assert_eq!(journal.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_broadcast_reaches_every_sink() {
        let journal = journal();
        let logger = CompositeLogger::new()
            .with_sink(RecordingSink::new("err", Severity::Error, &journal))
            .with_sink(RecordingSink::new("all", Severity::Debug, &journal));

        // The exiting half of fatal cannot run inside the test process
        logger.broadcast(Severity::Fatal, "going down".to_string()).await;

        let journal = journal.lock();
        assert_eq!(journal.len(), 2);
        assert!(journal.iter().all(|(_, s, _)| *s == Severity::Fatal));
    }

    #[tokio::test]
    async fn test_close_in_order() {
        let journal = journal();
        let first = RecordingSink::new("first", Severity::Debug, &journal);
        let closed = Arc::clone(&first.closed);
        let mut second = RecordingSink::new("second", Severity::Debug, &journal);
        second.closed = Arc::clone(&closed);

        let logger = CompositeLogger::new().with_sink(first).with_sink(second);
        logger.close().await;

        assert_eq!(*closed.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_from_config_defaults() {
        let logger = CompositeLogger::from_config(&Config::default()).await;

        assert_eq!(logger.sink_names(), vec!["file"]);
        assert_eq!(logger.fatal_grace(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_from_config_skips_unusable_sinks() {
        let mut config = Config::default();
        config.logger.file.enabled = false;
        config.logger.structured.enabled = true;
        config.logger.alert.enabled = true;
        config.logger.fatal_grace_ms = 50;

        let logger = CompositeLogger::from_config(&config).await;

        // Alert sink without chat id never reaches the network
        assert_eq!(logger.sink_names(), vec!["structured"]);
        assert_eq!(logger.fatal_grace(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_correlated_error_reaches_alert_channel() {
        let transport = Arc::new(CapturingTransport::default());
        let config = AlertSinkConfig {
            enabled: true,
            chat_id: "-42".to_string(),
            ..Default::default()
        };
        let alert = AlertSink::start(&config, &AppConfig::default(), transport.clone())
            .await
            .unwrap();

        let journal = journal();
        let logger = CompositeLogger::new()
            .with_sink(RecordingSink::new("plain", Severity::Info, &journal))
            .with_alert_sink(alert);

        let key = "a1b2c3d4-0000-0000-0000-000000000000";
        logger.debug(format!("{} hello", key)).await;
        logger.debug(format!("{} world", key)).await;
        logger.error(format!("{} boom", key)).await;

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        logger.close().await;

        // Debug lines were below the plain sink's level
        assert_eq!(journal.lock().len(), 1);

        let bodies = transport.bodies.lock().clone();
        assert_eq!(bodies.len(), 3);
        assert!(bodies[0].starts_with("<b>STARTED</b>"));
        assert!(bodies[2].starts_with("<b>STOPPED</b>"));

        let error = &bodies[1];
        assert!(error.starts_with("<b>ERROR</b>"));
        assert!(error.contains(&format!("<b>RequestID:</b> {}", key)));
        let hello = error.find("DEBUG [hello]</code>").unwrap();
        let world = error.find("DEBUG [world]</code>").unwrap();
        let boom = error.find("ERROR [boom]</code>").unwrap();
        assert!(hello < world && world < boom);

        let metrics = logger.alert_metrics().unwrap();
        assert_eq!(metrics.delivered(), 3);
        assert_eq!(metrics.delivery_failures(), 0);
        let text = metrics.gather().unwrap();
        assert!(text.contains("logrelay_alerts_delivered_total 3"));
        assert!(text.contains("logrelay_alerts_enqueued_total{header=\"ERROR\"} 1"));
    }

    #[tokio::test]
    async fn test_no_alert_metrics_without_alert_sink() {
        let journal = journal();
        let logger =
            CompositeLogger::new().with_sink(RecordingSink::new("plain", Severity::Info, &journal));
        assert!(logger.alert_metrics().is_none());
    }
}
