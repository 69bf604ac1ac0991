//! In-process brokers.
//!
//! [`MemoryQueue`] implements peek-lock semantics with lock expiry, so a message
//! that is never completed is handed out again. [`MemoryStream`] is a partitioned
//! log with per-partition checkpoints. Both are used by embedders that feed the
//! relay from inside the process, and by the test-suite.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{PartitionEvent, QueueClient, QueueMessage, StreamClient};
use crate::{Error, Result};

const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct StoredMessage {
    message_id: String,
    body: Bytes,
    delivery_count: u32,
}

#[derive(Debug)]
struct LockedMessage {
    message: StoredMessage,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    locked: HashMap<String, LockedMessage>,
}

impl QueueState {
    /// Return messages whose lock has expired to the front of the queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                self.ready.push_front(locked.message);
            }
        }
    }

    fn lock_next(&mut self, now: Instant, lock_duration: Duration) -> Option<QueueMessage> {
        let mut message = self.ready.pop_front()?;
        message.delivery_count += 1;

        let lock_token = Uuid::new_v4().to_string();
        let delivered = QueueMessage {
            message_id: message.message_id.clone(),
            lock_token: lock_token.clone(),
            delivery_count: message.delivery_count,
            body: message.body.clone(),
        };
        self.locked.insert(
            lock_token,
            LockedMessage {
                message,
                expires_at: now + lock_duration,
            },
        );
        Some(delivered)
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.locked.values().map(|locked| locked.expires_at).min()
    }
}

/// In-memory peek-lock queue.
pub struct MemoryQueue {
    entity: String,
    lock_duration: Duration,
    receive_timeout: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
    completed: AtomicUsize,
    deliveries: AtomicUsize,
    renewals: AtomicUsize,
    closed: AtomicBool,
}

impl MemoryQueue {
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            lock_duration: DEFAULT_LOCK_DURATION,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            completed: AtomicUsize::new(0),
            deliveries: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// How long a received message stays locked before it is redelivered.
    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    /// Enqueue a message and return its id.
    pub fn send(&self, body: impl Into<Bytes>) -> String {
        let message_id = Uuid::new_v4().to_string();
        self.state.lock().ready.push_back(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            delivery_count: 0,
        });
        self.notify.notify_one();
        message_id
    }

    /// Messages not yet completed, locked or not.
    pub fn pending_count(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.locked.len()
    }

    /// Number of successful `complete` calls.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Number of messages handed out, counting redeliveries.
    pub fn delivery_count(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }

    /// Number of successful lock renewals.
    pub fn renewal_count(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueClient for MemoryQueue {
    fn entity(&self) -> &str {
        &self.entity
    }

    async fn receive(&self) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + self.receive_timeout;

        loop {
            if self.is_closed() {
                return Ok(None);
            }

            let next_expiry = {
                let now = Instant::now();
                let mut state = self.state.lock();
                state.reclaim_expired(now);
                if let Some(message) = state.lock_next(now, self.lock_duration) {
                    self.deliveries.fetch_add(1, Ordering::SeqCst);
                    return Ok(Some(message));
                }
                state.next_expiry()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake_at = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn complete(&self, message: &QueueMessage) -> Result<()> {
        let mut state = self.state.lock();
        match state.locked.remove(&message.lock_token) {
            Some(_) => {
                self.completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::transport(format!(
                "lock for message {} on '{}' has expired or was already settled",
                message.message_id, self.entity
            ))),
        }
    }

    async fn renew_lock(&self, message: &QueueMessage) -> Result<()> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.reclaim_expired(now);
        match state.locked.get_mut(&message.lock_token) {
            Some(locked) => {
                locked.expires_at = now + self.lock_duration;
                self.renewals.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(Error::transport(format!(
                "lock for message {} on '{}' has expired or was already settled",
                message.message_id, self.entity
            ))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// In-memory partitioned stream.
pub struct MemoryStream {
    name: String,
    tx: mpsc::UnboundedSender<PartitionEvent>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<PartitionEvent>>,
    sequences: Mutex<HashMap<String, i64>>,
    checkpoints: Mutex<HashMap<String, i64>>,
    checkpoint_calls: AtomicUsize,
    closed: CancellationToken,
}

impl MemoryStream {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            sequences: Mutex::new(HashMap::new()),
            checkpoints: Mutex::new(HashMap::new()),
            checkpoint_calls: AtomicUsize::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Append an event to a partition and return its sequence number.
    pub fn publish(&self, partition_id: &str, body: impl Into<Bytes>) -> Result<i64> {
        let sequence_number = {
            let mut sequences = self.sequences.lock();
            let next = sequences.entry(partition_id.to_string()).or_insert(0);
            *next += 1;
            *next
        };

        self.tx
            .send(PartitionEvent {
                partition_id: partition_id.to_string(),
                sequence_number,
                body: body.into(),
            })
            .map_err(|_| Error::transport(format!("stream '{}' is closed", self.name)))?;
        Ok(sequence_number)
    }

    /// Last checkpointed sequence number of a partition.
    pub fn checkpoint_of(&self, partition_id: &str) -> Option<i64> {
        self.checkpoints.lock().get(partition_id).copied()
    }

    /// Number of checkpoint calls across all partitions.
    pub fn checkpoint_count(&self) -> usize {
        self.checkpoint_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamClient for MemoryStream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next_event(&self) -> Result<Option<PartitionEvent>> {
        if self.closed.is_cancelled() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            event = rx.recv() => Ok(event),
        }
    }

    async fn checkpoint(&self, event: &PartitionEvent) -> Result<()> {
        self.checkpoints
            .lock()
            .insert(event.partition_id.clone(), event.sequence_number);
        self.checkpoint_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}
