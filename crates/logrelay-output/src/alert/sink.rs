//! Alert sink: buffers per-request context and escalates errors with it.
//!
//! Per correlation key the sink is either without a bucket or holding one.
//! Debug/Info/Warning lines that carry a key are appended to its bucket; the
//! first append arms a TTL eviction. Error/Fatal lines are appended too and arm
//! a short flush timer; when it fires the bucket is taken whole and sent as one
//! alert, and the eviction timer finds nothing left to do.
//!
//! A bucket holding an error is pinned in the store by the same append that
//! adds the error, so the TTL can never discard it. If the eviction fires
//! after the flush has been armed it sends the alert early. If it fires in the
//! short gap before the flush command reaches the scheduler it leaves the
//! bucket alone and the flush sends it when due.
//!
//! All timers live in one `DelayQueue` owned by a scheduler task, so shutdown
//! cancels them deterministically instead of letting them fire late.

use async_trait::async_trait;
use logrelay_core::config::{AlertSinkConfig, AppConfig};
use logrelay_core::{CorrelationKey, LogEntry, OutputError, Severity, Sink};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, info, warn};

use super::dispatch::DispatchQueue;
use super::message::{AlertHeader, AlertMessage};
use super::store::{CorrelationStore, Generation, Stored};
use super::telegram::{AlertTransport, TelegramTransport};
use crate::metrics::AlertMetrics;

/// Work handed from callers to the scheduler task
#[derive(Debug)]
enum Command {
    ArmEviction {
        key: CorrelationKey,
        generation: Generation,
    },
    ArmFlush {
        key: CorrelationKey,
        generation: Generation,
        header: AlertHeader,
    },
    Shutdown,
}

#[derive(Debug)]
enum Timer {
    Evict {
        key: CorrelationKey,
        generation: Generation,
    },
    Flush {
        key: CorrelationKey,
        generation: Generation,
    },
}

enum Event {
    Command(Option<Command>),
    Expired(Timer),
}

/// Owns every pending timer of one sink
struct Scheduler {
    store: Arc<CorrelationStore>,
    dispatch: Arc<DispatchQueue>,
    metrics: Arc<AlertMetrics>,
    app: AppConfig,
    ttl: Duration,
    flush_delay: Duration,
    timers: DelayQueue<Timer>,
    evictions: HashMap<CorrelationKey, (Generation, delay_queue::Key)>,
    pending_flushes: HashMap<CorrelationKey, (Generation, AlertHeader)>,
}

impl Scheduler {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let event = tokio::select! {
                biased;
                command = commands.recv() => Event::Command(command),
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)) => {
                    Event::Expired(expired.into_inner())
                }
            };

            match event {
                Event::Command(Some(Command::ArmEviction { key, generation })) => {
                    self.arm_eviction(key, generation);
                }
                Event::Command(Some(Command::ArmFlush {
                    key,
                    generation,
                    header,
                })) => {
                    self.arm_flush(key, generation, header);
                }
                Event::Command(Some(Command::Shutdown)) => {
                    self.flush_pending().await;
                    break;
                }
                // Sink dropped without close: nobody is left to alert for
                Event::Command(None) => break,
                Event::Expired(Timer::Evict { key, generation }) => {
                    self.evict(key, generation).await;
                }
                Event::Expired(Timer::Flush { key, generation }) => {
                    self.flush(key, generation).await;
                }
            }
        }

        self.timers.clear();
        self.evictions.clear();
        self.store.clear();
        self.metrics.set_context_buckets(0);
        debug!("Alert scheduler stopped");
    }

    fn arm_eviction(&mut self, key: CorrelationKey, generation: Generation) {
        if let Some((_, stale)) = self.evictions.remove(&key) {
            self.timers.try_remove(&stale);
        }
        let timer = self.timers.insert(Timer::Evict { key, generation }, self.ttl);
        self.evictions.insert(key, (generation, timer));
    }

    fn arm_flush(&mut self, key: CorrelationKey, generation: Generation, header: AlertHeader) {
        let pending = self
            .pending_flushes
            .entry(key)
            .or_insert((generation, header));
        if pending.0 != generation {
            *pending = (generation, header);
        } else if header == AlertHeader::Fatal {
            pending.1 = AlertHeader::Fatal;
        }
        self.timers
            .insert(Timer::Flush { key, generation }, self.flush_delay);
    }

    async fn evict(&mut self, key: CorrelationKey, generation: Generation) {
        if matches!(self.evictions.get(&key), Some((g, _)) if *g == generation) {
            self.evictions.remove(&key);
        }

        // An error is waiting on this bucket: send it now rather than lose it
        if matches!(self.pending_flushes.get(&key), Some((g, _)) if *g == generation) {
            debug!(key = %key, "Context TTL reached before error flush, flushing early");
            self.flush(key, generation).await;
            return;
        }

        if self.store.evict(&key, generation) {
            self.metrics.record_evicted();
            self.metrics.set_context_buckets(self.store.len());
            debug!(key = %key, "Evicted expired context bucket");
        } else if self.store.load(&key).is_some() {
            debug!(key = %key, "Context TTL reached with error flush not yet armed, keeping bucket");
        }
    }

    async fn flush(&mut self, key: CorrelationKey, generation: Generation) {
        let header = match self.pending_flushes.get(&key) {
            Some((g, header)) if *g == generation => *header,
            // Already flushed by an earlier timer for the same bucket
            _ => return,
        };
        self.pending_flushes.remove(&key);

        let Some(lines) = self.store.take(&key, generation) else {
            return;
        };
        self.metrics.set_context_buckets(self.store.len());

        if let Some((g, timer)) = self.evictions.remove(&key) {
            if g == generation {
                self.timers.try_remove(&timer);
            } else {
                self.evictions.insert(key, (g, timer));
            }
        }

        let message = AlertMessage::new(header, &self.app, Some(key), lines);
        if let Err(e) = self.dispatch.enqueue(message).await {
            warn!(key = %key, error = %e, "Failed to enqueue alert");
        }
    }

    async fn flush_pending(&mut self) {
        let pending: Vec<(CorrelationKey, Generation)> = self
            .pending_flushes
            .iter()
            .map(|(key, (generation, _))| (*key, *generation))
            .collect();
        for (key, generation) in pending {
            self.flush(key, generation).await;
        }
    }
}

/// Sink escalating errors, with their preceding context, to an alert channel
pub struct AlertSink {
    level: Severity,
    app: AppConfig,
    store: Arc<CorrelationStore>,
    dispatch: Arc<DispatchQueue>,
    metrics: Arc<AlertMetrics>,
    commands: mpsc::UnboundedSender<Command>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AlertSink {
    /// Connect to Telegram and start the sink
    ///
    /// Fails when the chat id or token is missing or the token is rejected.
    pub async fn connect(config: &AlertSinkConfig, app: &AppConfig) -> Result<Self, OutputError> {
        if config.chat_id.trim().is_empty() {
            return Err(OutputError::Unavailable("chat id is empty".to_string()));
        }

        let transport =
            TelegramTransport::connect(&config.api_url, &config.bot_token, config.request_timeout())
                .await?;

        Self::start(config, app, Arc::new(transport)).await
    }

    /// Start the sink over an arbitrary transport
    ///
    /// Spawns the scheduler and the dispatch consumer on the current runtime
    /// and enqueues the STARTED notice.
    pub async fn start(
        config: &AlertSinkConfig,
        app: &AppConfig,
        transport: Arc<dyn AlertTransport>,
    ) -> Result<Self, OutputError> {
        let metrics = Arc::new(AlertMetrics::new()?);
        let store = Arc::new(CorrelationStore::new());
        let dispatch = Arc::new(DispatchQueue::start(
            config.queue_capacity,
            config.chat_id.clone(),
            transport,
            Arc::clone(&metrics),
        ));

        let (commands, receiver) = mpsc::unbounded_channel();
        let scheduler = Scheduler {
            store: Arc::clone(&store),
            dispatch: Arc::clone(&dispatch),
            metrics: Arc::clone(&metrics),
            app: app.clone(),
            ttl: config.context_ttl(),
            flush_delay: config.flush_delay(),
            timers: DelayQueue::new(),
            evictions: HashMap::new(),
            pending_flushes: HashMap::new(),
        };
        let scheduler = tokio::spawn(scheduler.run(receiver));

        let sink = Self {
            level: config.level,
            app: app.clone(),
            store,
            dispatch,
            metrics,
            commands,
            scheduler: Mutex::new(Some(scheduler)),
            closed: AtomicBool::new(false),
        };

        sink.dispatch
            .enqueue(AlertMessage::lifecycle(AlertHeader::Started, &sink.app))
            .await?;

        info!(
            app = %sink.app.name,
            ttl_secs = config.context_ttl_secs,
            flush_delay_ms = config.flush_delay_ms,
            queue_capacity = sink.dispatch.capacity(),
            "Alert sink started"
        );

        Ok(sink)
    }

    pub fn metrics(&self) -> &AlertMetrics {
        &self.metrics
    }

    /// Handle on the metrics that outlives the sink
    pub fn shared_metrics(&self) -> Arc<AlertMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Number of correlation keys currently holding context
    pub fn pending_contexts(&self) -> usize {
        self.store.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn schedule(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!("Alert scheduler already stopped");
        }
    }

    fn capture(&self, key: CorrelationKey, entry: &LogEntry) -> Stored {
        let stored = if entry.severity.is_escalation() {
            self.store.store_escalation(key, entry.context_line())
        } else {
            self.store.store(key, entry.context_line())
        };
        if stored.created {
            self.metrics.set_context_buckets(self.store.len());
            self.schedule(Command::ArmEviction {
                key,
                generation: stored.generation,
            });
        }
        stored
    }
}

#[async_trait]
impl Sink for AlertSink {
    fn name(&self) -> &'static str {
        "alert"
    }

    fn minimum_level(&self) -> Severity {
        self.level
    }

    async fn write(&self, entry: &LogEntry) -> Result<(), OutputError> {
        if self.is_closed() {
            debug!(severity = %entry.severity, "Ignoring log line after alert sink closed");
            return Ok(());
        }

        match (entry.correlation_key, AlertHeader::for_severity(entry.severity)) {
            (Some(key), None) => {
                self.capture(key, entry);
                Ok(())
            }
            (Some(key), Some(header)) => {
                let stored = self.capture(key, entry);
                self.schedule(Command::ArmFlush {
                    key,
                    generation: stored.generation,
                    header,
                });
                Ok(())
            }
            (None, Some(header)) => {
                let message = AlertMessage::new(header, &self.app, None, vec![entry.context_line()]);
                self.dispatch.enqueue(message).await
            }
            // Context is only worth keeping when it can be correlated
            (None, None) => Ok(()),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.schedule(Command::Shutdown);
        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                warn!(error = %e, "Alert scheduler task failed");
            }
        }

        if let Err(e) = self
            .dispatch
            .enqueue(AlertMessage::lifecycle(AlertHeader::Stopped, &self.app))
            .await
        {
            warn!(error = %e, "Failed to enqueue STOPPED notice");
        }

        self.dispatch.shutdown().await;
        info!(
            delivered = self.metrics.delivered(),
            failed = self.metrics.delivery_failures(),
            "Alert sink closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::dispatch::tests::RecordingTransport;
    use std::time::Duration;
    use tokio::time::sleep;

    const KEY: &str = "a1b2c3d4-0000-0000-0000-000000000000";

    fn config() -> AlertSinkConfig {
        AlertSinkConfig {
            enabled: true,
            level: Severity::Debug,
            chat_id: "-100".to_string(),
            ..Default::default()
        }
    }

    fn app() -> AppConfig {
        AppConfig {
            name: "billing".to_string(),
            ..Default::default()
        }
    }

    async fn start() -> (AlertSink, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let sink = AlertSink::start(&config(), &app(), transport.clone())
            .await
            .unwrap();
        (sink, transport)
    }

    fn alerts(transport: &RecordingTransport, header: AlertHeader) -> Vec<String> {
        let prefix = format!("<b>{}</b>", header);
        transport
            .bodies()
            .into_iter()
            .filter(|body| body.starts_with(&prefix))
            .collect()
    }

    fn code_lines(body: &str) -> Vec<String> {
        body.lines()
            .filter_map(|line| line.strip_prefix("<code>"))
            .filter_map(|line| line.strip_suffix("</code>"))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_notice_on_construction() {
        let (sink, transport) = start().await;
        sleep(Duration::from_millis(10)).await;

        assert_eq!(alerts(&transport, AlertHeader::Started).len(), 1);
        assert_eq!(sink.metrics().delivered(), 1);
        assert_eq!(transport.sent.lock()[0].0, "-100");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_escalates_with_context() {
        let (sink, transport) = start().await;

        sink.debug(&format!("{} hello", KEY)).await.unwrap();
        sink.debug(&format!("{} world", KEY)).await.unwrap();
        sink.error(&format!("{} boom", KEY)).await.unwrap();

        // Nothing before the flush delay
        sleep(Duration::from_millis(900)).await;
        assert!(alerts(&transport, AlertHeader::Error).is_empty());

        sleep(Duration::from_millis(200)).await;
        let errors = alerts(&transport, AlertHeader::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains(&format!("<b>RequestID:</b> {}", KEY)));

        let lines = code_lines(&errors[0]);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("DEBUG [hello]"));
        assert!(lines[1].ends_with("DEBUG [world]"));
        assert!(lines[2].ends_with("ERROR [boom]"));

        assert_eq!(sink.pending_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_evicts_idle_context() {
        let (sink, transport) = start().await;

        sink.info(&format!("{} request received", KEY)).await.unwrap();
        sink.warning(&format!("{} slow upstream", KEY)).await.unwrap();
        assert_eq!(sink.pending_contexts(), 1);

        sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.pending_contexts(), 0);
        assert_eq!(sink.metrics().evicted(), 1);

        // Eviction is silent
        assert_eq!(transport.bodies().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_runs_from_bucket_creation() {
        let (sink, _transport) = start().await;

        sink.debug(&format!("{} first", KEY)).await.unwrap();
        sleep(Duration::from_secs(20)).await;
        sink.debug(&format!("{} second", KEY)).await.unwrap();

        sleep(Duration::from_secs(9)).await;
        assert_eq!(sink.pending_contexts(), 1);

        // Re-entry did not re-arm the eviction
        sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.pending_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_wins_race_exactly_once() {
        let (sink, transport) = start().await;

        sink.error(&format!("{} boom", KEY)).await.unwrap();
        sleep(Duration::from_secs(40)).await;

        let errors = alerts(&transport, AlertHeader::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(code_lines(&errors[0]).len(), 1);
        assert_eq!(sink.pending_contexts(), 0);
        // The flush cancelled the eviction
        assert_eq!(sink.metrics().evicted(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_before_flush_still_alerts_once() {
        let (sink, transport) = start().await;

        sink.info(&format!("{} started work", KEY)).await.unwrap();
        sleep(Duration::from_millis(29_500)).await;
        sink.error(&format!("{} gave up", KEY)).await.unwrap();

        // TTL fires at 30s, half a second before the flush would
        sleep(Duration::from_millis(600)).await;
        let errors = alerts(&transport, AlertHeader::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(code_lines(&errors[0]).len(), 2);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(alerts(&transport, AlertHeader::Error).len(), 1);
        assert_eq!(sink.pending_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_between_error_store_and_flush_arm_keeps_error() {
        let (sink, transport) = start().await;

        sink.info(&format!("{} started work", KEY)).await.unwrap();
        // Store the error without arming its flush, as if the caller were
        // preempted right after the append
        let entry = LogEntry::new(Severity::Error, format!("{} gave up", KEY));
        let key = entry.correlation_key.unwrap();
        let stored = sink.capture(key, &entry);

        sleep(Duration::from_secs(31)).await;
        assert_eq!(sink.pending_contexts(), 1);
        assert_eq!(sink.metrics().evicted(), 0);
        assert!(alerts(&transport, AlertHeader::Error).is_empty());

        sink.schedule(Command::ArmFlush {
            key,
            generation: stored.generation,
            header: AlertHeader::Error,
        });
        sleep(Duration::from_secs(2)).await;

        let errors = alerts(&transport, AlertHeader::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(code_lines(&errors[0]).len(), 2);
        assert_eq!(sink.pending_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uncorrelated_error_is_immediate_single_line() {
        let (sink, transport) = start().await;

        sink.debug("not kept").await.unwrap();
        sink.error("disk on fire").await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let errors = alerts(&transport, AlertHeader::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("<b>RequestID:</b> -"));
        let lines = code_lines(&errors[0]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("ERROR [disk on fire]"));
        assert_eq!(sink.pending_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_header() {
        let (sink, transport) = start().await;

        sink.info(&format!("{} loading", KEY)).await.unwrap();
        sink.fatal(&format!("{} cannot continue", KEY)).await.unwrap();
        sleep(Duration::from_millis(1_100)).await;

        let fatals = alerts(&transport, AlertHeader::Fatal);
        assert_eq!(fatals.len(), 1);
        assert!(code_lines(&fatals[0])[1].ends_with("FATAL [cannot continue]"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_within_flush_delay_share_one_alert() {
        let (sink, transport) = start().await;

        sink.error(&format!("{} first failure", KEY)).await.unwrap();
        sleep(Duration::from_millis(300)).await;
        sink.error(&format!("{} second failure", KEY)).await.unwrap();
        sleep(Duration::from_secs(3)).await;

        let errors = alerts(&transport, AlertHeader::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(code_lines(&errors[0]).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_bucket_after_flush_gets_own_ttl() {
        let (sink, _transport) = start().await;

        sink.error(&format!("{} boom", KEY)).await.unwrap();
        sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.pending_contexts(), 0);

        sink.debug(&format!("{} retrying", KEY)).await.unwrap();
        sleep(Duration::from_millis(29_500)).await;
        assert_eq!(sink.pending_contexts(), 1);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.pending_contexts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_bucket() {
        let (sink, transport) = start().await;
        let sink = Arc::new(sink);

        let handles: Vec<_> = (0..8)
            .map(|caller| {
                let sink = Arc::clone(&sink);
                tokio::spawn(async move {
                    for i in 0..5 {
                        sink.debug(&format!("{} caller {} step {}", KEY, caller, i))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        sink.error(&format!("{} done", KEY)).await.unwrap();
        sleep(Duration::from_millis(1_100)).await;

        let errors = alerts(&transport, AlertHeader::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(code_lines(&errors[0]).len(), 41);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_pending_errors_and_says_goodbye() {
        let (sink, transport) = start().await;

        sink.debug(&format!("{} context", KEY)).await.unwrap();
        sink.error(&format!("{} failed", KEY)).await.unwrap();
        sink.close().await;

        let headers: Vec<String> = transport
            .bodies()
            .iter()
            .filter_map(|body| body.lines().next().map(str::to_string))
            .collect();
        assert_eq!(headers, vec!["<b>STARTED</b>", "<b>ERROR</b>", "<b>STOPPED</b>"]);
        assert_eq!(sink.pending_contexts(), 0);

        // Writes after close are ignored, timers never fire late
        sink.error("too late").await.unwrap();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.bodies().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_pending_context() {
        let (sink, transport) = start().await;

        sink.info(&format!("{} just context", KEY)).await.unwrap();
        sink.close().await;
        sink.close().await;

        assert_eq!(sink.pending_contexts(), 0);
        assert_eq!(transport.bodies().len(), 2);
        assert!(sink.is_closed());
    }
}
