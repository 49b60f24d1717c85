//! Cloud event queue interface.
//!
//! Delivery is at-least-once: a message is deleted only after its action
//! completes, and repository operations are idempotent so redelivery is
//! safe. The cloud SDK implementation is an external collaborator; the
//! in-memory queue here backs local mode, operator injection, and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::error::{LifecycleError, LifecycleResult};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_BATCH: usize = 10;

/// One message as received from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    /// Opaque handle used to delete the message after processing.
    pub receipt: String,
    pub body: String,
}

/// A long-polling, at-least-once message queue.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Block up to the long-poll window; an empty batch means a timeout.
    async fn receive(&self) -> LifecycleResult<Vec<QueueMessage>>;

    /// Acknowledge a message. Deleting an unknown receipt is a no-op.
    async fn delete(&self, receipt: &str) -> LifecycleResult<()>;
}

struct QueueInner {
    tx: mpsc::Sender<QueueMessage>,
    rx: Mutex<mpsc::Receiver<QueueMessage>>,
    in_flight: Mutex<HashMap<String, QueueMessage>>,
    seq: AtomicU64,
    poll: Duration,
}

/// In-process queue with the same receive/delete contract as the cloud one.
///
/// Messages received but not yet deleted are tracked as in-flight so tests
/// can assert acknowledgement; redelivery of abandoned messages is not
/// simulated.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<QueueInner>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_poll_timeout(DEFAULT_POLL_TIMEOUT)
    }

    pub fn with_poll_timeout(poll: Duration) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        Self {
            inner: Arc::new(QueueInner {
                tx,
                rx: Mutex::new(rx),
                in_flight: Mutex::new(HashMap::new()),
                seq: AtomicU64::new(0),
                poll,
            }),
        }
    }

    /// Enqueue a raw message body. Returns the assigned receipt.
    pub async fn push(&self, body: impl Into<String>) -> LifecycleResult<String> {
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let receipt = format!("r-{seq}");
        let message = QueueMessage {
            receipt: receipt.clone(),
            body: body.into(),
        };
        self.inner
            .tx
            .send(message)
            .await
            .map_err(|_| LifecycleError::Queue("queue closed".to_string()))?;
        Ok(receipt)
    }

    /// Messages received but not yet acknowledged.
    pub async fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().await.len()
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventQueue for InMemoryQueue {
    async fn receive(&self) -> LifecycleResult<Vec<QueueMessage>> {
        let mut rx = self.inner.rx.lock().await;

        let first = match tokio::time::timeout(self.inner.poll, rx.recv()).await {
            Ok(Some(message)) => message,
            // Channel closed or long-poll window elapsed.
            Ok(None) | Err(_) => return Ok(Vec::new()),
        };

        let mut batch = vec![first];
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        let mut in_flight = self.inner.in_flight.lock().await;
        for message in &batch {
            in_flight.insert(message.receipt.clone(), message.clone());
        }
        Ok(batch)
    }

    async fn delete(&self, receipt: &str) -> LifecycleResult<()> {
        self.inner.in_flight.lock().await.remove(receipt);
        Ok(())
    }
}
