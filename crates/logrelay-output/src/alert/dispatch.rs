//! Bounded alert queue and the consumer task that drains it.

use logrelay_core::OutputError;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::message::AlertMessage;
use super::telegram::AlertTransport;
use crate::metrics::AlertMetrics;

/// Decouples alert producers from (slow) delivery
///
/// Producers wait for a free slot when the queue is full instead of dropping
/// the alert. After [`close`](Self::close) new messages are rejected and the
/// consumer exits once everything admitted earlier has been handed to the
/// transport.
pub struct DispatchQueue {
    sender: RwLock<Option<mpsc::Sender<AlertMessage>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<AlertMetrics>,
    capacity: usize,
}

impl DispatchQueue {
    /// Create the queue and spawn its consumer on the current runtime
    pub fn start(
        capacity: usize,
        destination: String,
        transport: Arc<dyn AlertTransport>,
        metrics: Arc<AlertMetrics>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);

        let consumer = tokio::spawn(run_consumer(
            receiver,
            destination,
            transport,
            Arc::clone(&metrics),
        ));

        Self {
            sender: RwLock::new(Some(sender)),
            consumer: Mutex::new(Some(consumer)),
            metrics,
            capacity,
        }
    }

    /// Admit a message, waiting for space if the queue is full
    pub async fn enqueue(&self, message: AlertMessage) -> Result<(), OutputError> {
        let sender = self.sender.read().clone();
        let Some(sender) = sender else {
            self.metrics.record_rejected();
            debug!(header = %message.header, "Dropping alert offered after close");
            return Err(OutputError::QueueClosed);
        };

        let header = message.header;
        match sender.send(message).await {
            Ok(()) => {
                self.metrics.record_enqueued(header.as_str());
                Ok(())
            }
            Err(_) => {
                self.metrics.record_rejected();
                Err(OutputError::QueueClosed)
            }
        }
    }

    /// Stop admitting messages; already admitted ones are still delivered
    pub fn close(&self) {
        self.sender.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Wait for the consumer to drain the queue and exit
    ///
    /// Only returns once [`close`](Self::close) has been called.
    pub async fn join(&self) {
        let handle = self.consumer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Alert consumer task failed");
            }
        }
    }

    /// Close and wait for the drain
    pub async fn shutdown(&self) {
        self.close();
        self.join().await;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

async fn run_consumer(
    mut receiver: mpsc::Receiver<AlertMessage>,
    destination: String,
    transport: Arc<dyn AlertTransport>,
    metrics: Arc<AlertMetrics>,
) {
    debug!(transport = transport.name(), "Alert consumer started");

    while let Some(message) = receiver.recv().await {
        let body = message.render();
        match transport.send(&destination, &body).await {
            Ok(()) => metrics.record_delivered(),
            Err(e) => {
                // Best effort: observed here, never retried
                metrics.record_delivery_failure();
                warn!(
                    transport = transport.name(),
                    header = %message.header,
                    error = %e,
                    "Alert delivery failed"
                );
            }
        }
    }

    debug!(transport = transport.name(), "Alert consumer drained");
}
