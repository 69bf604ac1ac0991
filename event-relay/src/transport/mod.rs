//! Transport clients.
//!
//! Receivers pull from a [`QueueClient`] (peek-lock queue) or a [`StreamClient`]
//! (partitioned log), and the publish action pushes through an [`EventPublisher`].

mod event_grid;
mod memory;
mod service_bus;

pub use event_grid::{EventGridConfig, EventGridPublisher};
pub use memory::{MemoryQueue, MemoryStream};
pub use service_bus::{ServiceBusConfig, ServiceBusQueueClient};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::Result;
use crate::envelope::Envelope;

/// A message received under a peek-lock.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    /// Opaque token used to settle this delivery.
    pub lock_token: String,
    /// Number of times the broker has handed out this message, including this one.
    pub delivery_count: u32,
    pub body: Bytes,
}

/// Peek-lock queue. A received message stays invisible to other receivers until its
/// lock expires or it is completed.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Queue or subscription path.
    fn entity(&self) -> &str;

    /// Wait for the next message. `None` when nothing arrived within the receive
    /// timeout.
    async fn receive(&self) -> Result<Option<QueueMessage>>;

    /// Settle a delivery, removing the message from the queue.
    async fn complete(&self, message: &QueueMessage) -> Result<()>;

    /// Extend the lock held on `message` by the entity's lock duration.
    async fn renew_lock(&self, message: &QueueMessage) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// An event read from one partition of a stream.
#[derive(Debug, Clone)]
pub struct PartitionEvent {
    pub partition_id: String,
    pub sequence_number: i64,
    pub body: Bytes,
}

/// Partitioned event log with per-partition checkpoints.
#[async_trait]
pub trait StreamClient: Send + Sync {
    fn name(&self) -> &str;

    /// Wait for the next event from any partition. `None` once the stream is closed.
    async fn next_event(&self) -> Result<Option<PartitionEvent>>;

    /// Record `event` as the last processed position of its partition.
    async fn checkpoint(&self, event: &PartitionEvent) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Event sent by the publish action, in Event Grid schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEvent {
    pub id: String,
    pub subject: String,
    pub event_type: String,
    pub data_version: String,
    pub data: Value,
    pub event_time: DateTime<Utc>,
}

impl OutboundEvent {
    /// Copy subject, event type, data version and data from `envelope` under a new id
    /// and the current time.
    pub fn derived_from(envelope: &Envelope) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject: envelope.subject().to_string(),
            event_type: envelope.event_type().to_string(),
            data_version: envelope.data_version().to_string(),
            data: envelope.data().clone(),
            event_time: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &OutboundEvent) -> Result<()>;
}
