//! Partitioned stream receiver.
//!
//! Events of one partition are handled in order by a dedicated worker; partitions run
//! concurrently. Every event is checkpointed once its envelopes have been processed,
//! whether or not they succeeded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{Lifecycle, Receiver, ReceiverKind, ReceiverState};
use crate::Result;
use crate::envelope::Envelope;
use crate::pipeline::ActionChain;
use crate::transport::{PartitionEvent, StreamClient};

const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamReceiverConfig {
    pub name: String,
    #[serde(default)]
    pub allowed_event_types: Vec<String>,
    #[serde(default, skip_serializing)]
    pub actions: Vec<Value>,
    /// Name of a stream client registered on the service.
    pub connector: String,
}

pub struct StreamReceiver {
    config: StreamReceiverConfig,
    client: Arc<dyn StreamClient>,
    chain: Arc<ActionChain>,
    action_cancel: CancellationToken,
    lifecycle: Lifecycle,
    stop_token: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl StreamReceiver {
    pub fn new(
        config: StreamReceiverConfig,
        client: Arc<dyn StreamClient>,
        chain: Arc<ActionChain>,
        action_cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            chain,
            action_cancel,
            lifecycle: Lifecycle::new(),
            stop_token: CancellationToken::new(),
            pump: Mutex::new(None),
        }
    }
}

async fn run_pump(
    client: Arc<dyn StreamClient>,
    chain: Arc<ActionChain>,
    action_cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut partitions: HashMap<String, mpsc::UnboundedSender<PartitionEvent>> = HashMap::new();
    let mut workers = JoinSet::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = client.next_event() => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!(receiver = chain.receiver(), stream = client.name(), "Stream closed");
                break;
            }
            Err(e) => {
                error!(
                    receiver = chain.receiver(),
                    stream = client.name(),
                    error = %e,
                    "Failed to read from stream"
                );
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                }
            }
        };

        let sender = partitions.entry(event.partition_id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let span = info_span!(
                "partition",
                receiver = %chain.receiver(),
                partition_id = %event.partition_id,
            );
            workers.spawn(
                run_partition(
                    client.clone(),
                    chain.clone(),
                    rx,
                    action_cancel.clone(),
                    stop.clone(),
                )
                .instrument(span),
            );
            tx
        });
        if sender.send(event).is_err() {
            warn!(receiver = chain.receiver(), "Partition worker exited, event dropped");
        }
    }

    drop(partitions);
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            error!(receiver = chain.receiver(), error = %e, "Partition worker panicked");
        }
    }

    if let Err(e) = client.close().await {
        warn!(receiver = chain.receiver(), error = %e, "Failed to close stream client");
    }
}

/// Process one partition in arrival order. Events still queued when `stop` fires are
/// left unprocessed and not checkpointed.
async fn run_partition(
    client: Arc<dyn StreamClient>,
    chain: Arc<ActionChain>,
    mut rx: mpsc::UnboundedReceiver<PartitionEvent>,
    action_cancel: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(client.as_ref(), &chain, &event, &action_cancel).await;
    }
}

async fn handle_event(
    client: &dyn StreamClient,
    chain: &ActionChain,
    event: &PartitionEvent,
    cancel: &CancellationToken,
) {
    match Envelope::parse_batch(&event.body) {
        Ok(envelopes) => {
            for envelope in &envelopes {
                if let Err(e) = chain.run(envelope, cancel).await {
                    error!(
                        correlation_id = %envelope.correlation_id(),
                        sequence_number = event.sequence_number,
                        error = %e,
                        "Action chain failed"
                    );
                }
            }
        }
        Err(e) => {
            error!(
                sequence_number = event.sequence_number,
                error = %e,
                "Failed to parse stream event"
            );
        }
    }

    if let Err(e) = client.checkpoint(event).await {
        error!(
            sequence_number = event.sequence_number,
            error = %e,
            "Failed to checkpoint stream event"
        );
    }
}

#[async_trait]
impl Receiver for StreamReceiver {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ReceiverKind {
        ReceiverKind::Stream
    }

    fn state(&self) -> ReceiverState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.start()?;

        *self.pump.lock() = Some(tokio::spawn(run_pump(
            self.client.clone(),
            self.chain.clone(),
            self.action_cancel.clone(),
            self.stop_token.clone(),
        )));

        info!(
            receiver = %self.config.name,
            stream = self.client.name(),
            "Stream receiver started"
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if !self.lifecycle.stop() {
            return Ok(());
        }

        self.stop_token.cancel();
        let pump = self.pump.lock().take();
        if let Some(handle) = pump
            && let Err(e) = handle.await
        {
            error!(receiver = %self.config.name, error = %e, "Stream pump panicked");
        }

        info!(receiver = %self.config.name, "Stream receiver stopped");
        Ok(())
    }
}
