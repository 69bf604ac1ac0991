//! Peek-lock queue receiver.
//!
//! A pump task receives messages and spawns one handler per message, bounded by a
//! semaphore. A message is completed only after every envelope it carries was either
//! processed or filtered out; otherwise its lock is left to expire and the broker
//! redelivers it. While the chain runs, the handler keeps renewing the lock so a slow
//! chain is not handed to a second receiver.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::{Lifecycle, Receiver, ReceiverKind, ReceiverState};
use crate::Result;
use crate::envelope::Envelope;
use crate::pipeline::ActionChain;
use crate::transport::{QueueClient, QueueMessage, ServiceBusConfig};

fn default_max_concurrent_calls() -> usize {
    5
}

fn default_receive_error_backoff_ms() -> u64 {
    1000
}

fn default_lock_renewal_interval_ms() -> u64 {
    10_000
}

fn default_max_auto_lock_renewal_secs() -> u64 {
    300
}

/// Where a queue receiver pulls from, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueTransportConfig {
    ServiceBus(ServiceBusConfig),
    /// A client registered on the service under this name.
    Connector { connector: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueReceiverConfig {
    pub name: String,
    #[serde(default)]
    pub allowed_event_types: Vec<String>,
    #[serde(default, skip_serializing)]
    pub actions: Vec<Value>,
    pub transport: QueueTransportConfig,
    /// Messages handled concurrently.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_receive_error_backoff_ms")]
    pub receive_error_backoff_ms: u64,
    /// How often the lock of an in-flight message is renewed.
    #[serde(default = "default_lock_renewal_interval_ms")]
    pub lock_renewal_interval_ms: u64,
    /// Stop renewing a message lock after this long. Zero disables renewal.
    #[serde(default = "default_max_auto_lock_renewal_secs")]
    pub max_auto_lock_renewal_secs: u64,
}

impl QueueReceiverConfig {
    fn lock_renewal(&self) -> LockRenewal {
        LockRenewal {
            interval: Duration::from_millis(self.lock_renewal_interval_ms),
            max: Duration::from_secs(self.max_auto_lock_renewal_secs),
        }
    }
}

/// Renewal schedule for the lock of an in-flight message.
#[derive(Debug, Clone, Copy)]
struct LockRenewal {
    interval: Duration,
    max: Duration,
}

pub struct QueueReceiver {
    config: QueueReceiverConfig,
    client: Arc<dyn QueueClient>,
    chain: Arc<ActionChain>,
    action_cancel: CancellationToken,
    lifecycle: Lifecycle,
    stop_token: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl QueueReceiver {
    pub fn new(
        config: QueueReceiverConfig,
        client: Arc<dyn QueueClient>,
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

/// State moved into the pump task.
struct Pump {
    client: Arc<dyn QueueClient>,
    chain: Arc<ActionChain>,
    action_cancel: CancellationToken,
    stop: CancellationToken,
    permits: Arc<Semaphore>,
    backoff: Duration,
    renewal: LockRenewal,
}

impl Pump {
    async fn run(self) {
        let mut handlers = JoinSet::new();

        loop {
            while let Some(result) = handlers.try_join_next() {
                if let Err(e) = result {
                    error!(receiver = self.chain.receiver(), error = %e, "Message handler panicked");
                }
            }

            let permit = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                received = self.client.receive() => received,
            };

            match received {
                Ok(Some(message)) => {
                    let client = self.client.clone();
                    let chain = self.chain.clone();
                    let cancel = self.action_cancel.clone();
                    let renewal = self.renewal;
                    let span = info_span!(
                        "queue_message",
                        receiver = %self.chain.receiver(),
                        message_id = %message.message_id,
                        delivery_count = message.delivery_count,
                    );
                    handlers.spawn(
                        async move {
                            handle_message(client.as_ref(), &chain, &message, &cancel, renewal).await;
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    error!(
                        receiver = self.chain.receiver(),
                        entity = self.client.entity(),
                        error = %e,
                        "Failed to receive from queue"
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(self.backoff) => {}
                    }
                }
            }
        }

        let in_flight = handlers.len();
        if in_flight > 0 {
            debug!(
                receiver = self.chain.receiver(),
                in_flight, "Waiting for message handlers"
            );
        }
        while let Some(result) = handlers.join_next().await {
            if let Err(e) = result {
                error!(receiver = self.chain.receiver(), error = %e, "Message handler panicked");
            }
        }

        if let Err(e) = self.client.close().await {
            warn!(receiver = self.chain.receiver(), error = %e, "Failed to close queue client");
        }
    }
}

/// Renew the lock on `message` every `renewal.interval` until `settled` fires or
/// `renewal.max` has elapsed.
async fn keep_lock(
    client: &dyn QueueClient,
    message: &QueueMessage,
    renewal: LockRenewal,
    settled: &CancellationToken,
) {
    if renewal.interval.is_zero() || renewal.max.is_zero() {
        return;
    }
    let deadline = tokio::time::Instant::now() + renewal.max;

    loop {
        tokio::select! {
            biased;
            _ = settled.cancelled() => return,
            _ = tokio::time::sleep(renewal.interval) => {}
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                max_secs = renewal.max.as_secs(),
                "Message still in progress, lock renewal stopped"
            );
            return;
        }
        if let Err(e) = client.renew_lock(message).await {
            warn!(error = %e, "Failed to renew message lock");
        }
    }
}

/// Run the chain for every envelope and return how many failed.
async fn run_envelopes(chain: &ActionChain, envelopes: &[Envelope], cancel: &CancellationToken) -> usize {
    let mut failed = 0;
    for envelope in envelopes {
        if let Err(e) = chain.run(envelope, cancel).await {
            failed += 1;
            error!(
                correlation_id = %envelope.correlation_id(),
                error = %e,
                "Action chain failed"
            );
        }
    }
    failed
}

/// Run the chain for every envelope of `message` and complete it when none failed.
/// Returns whether the message was completed.
async fn handle_message(
    client: &dyn QueueClient,
    chain: &ActionChain,
    message: &QueueMessage,
    cancel: &CancellationToken,
    renewal: LockRenewal,
) -> bool {
    let envelopes = match Envelope::parse_batch(&message.body) {
        Ok(envelopes) => envelopes,
        Err(e) => {
            error!(error = %e, "Failed to parse message body, leaving it for redelivery");
            return false;
        }
    };

    let settled = CancellationToken::new();
    let (failed, ()) = tokio::join!(
        async {
            let failed = run_envelopes(chain, &envelopes, cancel).await;
            settled.cancel();
            failed
        },
        keep_lock(client, message, renewal, &settled),
    );

    if failed > 0 {
        warn!(
            envelopes = envelopes.len(),
            failed, "Message not completed, it will be redelivered"
        );
        return false;
    }

    match client.complete(message).await {
        Ok(()) => {
            debug!(envelopes = envelopes.len(), "Message completed");
            true
        }
        Err(e) => {
            error!(error = %e, "Failed to complete message");
            false
        }
    }
}

#[async_trait]
impl Receiver for QueueReceiver {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ReceiverKind {
        ReceiverKind::Queue
    }

    fn state(&self) -> ReceiverState {
        self.lifecycle.state()
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.start()?;

        let pump = Pump {
            client: self.client.clone(),
            chain: self.chain.clone(),
            action_cancel: self.action_cancel.clone(),
            stop: self.stop_token.clone(),
            permits: Arc::new(Semaphore::new(self.config.max_concurrent_calls.max(1))),
            backoff: Duration::from_millis(self.config.receive_error_backoff_ms),
            renewal: self.config.lock_renewal(),
        };
        *self.pump.lock() = Some(tokio::spawn(pump.run()));

        info!(
            receiver = %self.config.name,
            entity = self.client.entity(),
            max_concurrent_calls = self.config.max_concurrent_calls,
            "Queue receiver started"
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
            error!(receiver = %self.config.name, error = %e, "Queue pump panicked");
        }

        info!(receiver = %self.config.name, "Queue receiver stopped");
        Ok(())
    }
}
