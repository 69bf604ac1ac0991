//! Transport receivers.
//!
//! A receiver takes raw notifications from one source, turns them into envelopes and
//! hands them to its action chain. Receivers are configured by tagged JSON entries
//! and resolved once into `Arc<dyn Receiver>`.

mod filesystem;
mod queue;
mod stream;

pub use filesystem::{FileSystemReceiver, FileSystemReceiverConfig};
pub use queue::{QueueReceiver, QueueReceiverConfig, QueueTransportConfig};
pub use stream::{StreamReceiver, StreamReceiverConfig};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::actions::ActionDeps;
use crate::pipeline::ActionChain;
use crate::transport::{QueueClient, ServiceBusQueueClient, StreamClient};
use crate::{Error, Result};

/// Receiver lifecycle. Receivers are not restartable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ReceiverState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReceiverKind {
    Queue,
    Stream,
    FileSystem,
}

#[async_trait]
pub trait Receiver: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> ReceiverKind;

    fn state(&self) -> ReceiverState;

    /// Begin receiving. Fails when the transport cannot be established or the
    /// receiver was already started.
    async fn start(&self) -> Result<()>;

    /// Stop receiving and wait for in-flight work. Stopping a receiver that never
    /// started only marks it stopped.
    async fn stop(&self) -> Result<()>;
}

/// State machine shared by the receiver implementations.
pub(crate) struct Lifecycle {
    state: Mutex<ReceiverState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ReceiverState::Created),
        }
    }

    pub(crate) fn state(&self) -> ReceiverState {
        *self.state.lock()
    }

    /// `Created -> Running`.
    pub(crate) fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ReceiverState::Created => {
                *state = ReceiverState::Running;
                Ok(())
            }
            other => Err(Error::invalid_transition(other, ReceiverState::Running)),
        }
    }

    /// Move to `Stopped`, returning whether the receiver was running.
    pub(crate) fn stop(&self) -> bool {
        let mut state = self.state.lock();
        let was_running = *state == ReceiverState::Running;
        *state = ReceiverState::Stopped;
        was_running
    }
}

/// One receiver entry of the configuration file, tagged by `type`.
///
/// Serializing omits the actions and masks secrets, for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReceiverConfig {
    Queue(QueueReceiverConfig),
    Stream(StreamReceiverConfig),
    FileSystem(FileSystemReceiverConfig),
}

impl ReceiverConfig {
    pub fn parse(raw: &Value) -> Result<Self> {
        serde_json::from_value(raw.clone())
            .map_err(|e| Error::config(format!("invalid receiver: {e}")))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Queue(c) => &c.name,
            Self::Stream(c) => &c.name,
            Self::FileSystem(c) => &c.name,
        }
    }

    pub fn kind(&self) -> ReceiverKind {
        match self {
            Self::Queue(_) => ReceiverKind::Queue,
            Self::Stream(_) => ReceiverKind::Stream,
            Self::FileSystem(_) => ReceiverKind::FileSystem,
        }
    }

    fn chain_parts(&self) -> (&[String], &[Value]) {
        match self {
            Self::Queue(c) => (&c.allowed_event_types, &c.actions),
            Self::Stream(c) => (&c.allowed_event_types, &c.actions),
            Self::FileSystem(c) => (&c.allowed_event_types, &c.actions),
        }
    }
}

/// Everything a receiver needs from the host.
#[derive(Clone, Default)]
pub struct ReceiverContext {
    pub deps: ActionDeps,
    /// Queue clients registered by name, referenced by `connector` transports.
    pub queues: HashMap<String, Arc<dyn QueueClient>>,
    /// Stream clients registered by name.
    pub streams: HashMap<String, Arc<dyn StreamClient>>,
    /// Cancels in-flight actions. Only fired when a graceful stop times out.
    pub action_cancel: CancellationToken,
}

/// Build a receiver and its action chain.
pub fn build_receiver(config: ReceiverConfig, ctx: &ReceiverContext) -> Result<Arc<dyn Receiver>> {
    info!(
        receiver = config.name(),
        kind = %config.kind(),
        config = %serde_json::to_string(&config).unwrap_or_default(),
        "Registering receiver"
    );
    let (allowed, actions) = config.chain_parts();
    let chain = Arc::new(ActionChain::register(config.name(), allowed, actions, &ctx.deps));

    Ok(match config {
        ReceiverConfig::Queue(c) => {
            let client: Arc<dyn QueueClient> = match &c.transport {
                QueueTransportConfig::ServiceBus(sb) => Arc::new(ServiceBusQueueClient::new(sb.clone())?),
                QueueTransportConfig::Connector { connector } => ctx
                    .queues
                    .get(connector)
                    .cloned()
                    .ok_or_else(|| Error::config(format!("unknown queue connector '{connector}'")))?,
            };
            Arc::new(QueueReceiver::new(c, client, chain, ctx.action_cancel.clone()))
        }
        ReceiverConfig::Stream(c) => {
            let client = ctx
                .streams
                .get(&c.connector)
                .cloned()
                .ok_or_else(|| Error::config(format!("unknown stream connector '{}'", c.connector)))?;
            Arc::new(StreamReceiver::new(c, client, chain, ctx.action_cancel.clone()))
        }
        ReceiverConfig::FileSystem(c) => {
            Arc::new(FileSystemReceiver::new(c, chain, ctx.action_cancel.clone())?)
        }
    })
}
