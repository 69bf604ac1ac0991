//! In-memory hand-off between a filesystem watcher and its action chain.
//!
//! The watcher callback only enqueues; a single worker task drains the queue and
//! runs the chain one envelope at a time, so the callback never waits on actions.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ActionChain;
use crate::envelope::Envelope;

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeliveryState {
    /// Waiting for an envelope.
    Idle,
    /// Running the chain on an envelope.
    Draining,
    /// Shutdown requested; no new envelopes are accepted.
    ShuttingDown,
}

/// Cloneable enqueue side, safe to use from any thread.
#[derive(Clone)]
pub struct DeliverySender {
    tx: mpsc::UnboundedSender<Envelope>,
    shutdown: CancellationToken,
}

impl DeliverySender {
    /// Queue an envelope without blocking. Returns `false` once the queue is shutting
    /// down.
    pub fn enqueue(&self, envelope: Envelope) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.tx.send(envelope).is_ok()
    }
}

pub struct DeliveryQueue {
    sender: DeliverySender,
    state: Arc<Mutex<DeliveryState>>,
    worker: Mutex<Option<JoinHandle<usize>>>,
}

impl DeliveryQueue {
    /// Spawn the worker. `action_cancel` is passed to every action run.
    pub fn start(chain: Arc<ActionChain>, action_cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let state = Arc::new(Mutex::new(DeliveryState::Idle));

        let worker = tokio::spawn(Self::run_worker(
            chain,
            rx,
            shutdown.clone(),
            state.clone(),
            action_cancel,
        ));

        Self {
            sender: DeliverySender { tx, shutdown },
            state,
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run_worker(
        chain: Arc<ActionChain>,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        shutdown: CancellationToken,
        state: Arc<Mutex<DeliveryState>>,
        action_cancel: CancellationToken,
    ) -> usize {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = rx.recv() => match item {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            *state.lock() = DeliveryState::Draining;
            if let Err(e) = chain.run(&envelope, &action_cancel).await {
                error!(
                    receiver = chain.receiver(),
                    correlation_id = %envelope.correlation_id(),
                    error = %e,
                    "Action chain failed"
                );
            }

            let mut current = state.lock();
            if *current == DeliveryState::Draining {
                *current = DeliveryState::Idle;
            }
        }

        rx.close();
        let mut abandoned = 0;
        while rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            warn!(
                receiver = chain.receiver(),
                abandoned, "Delivery queue stopped with pending notifications"
            );
        } else {
            debug!(receiver = chain.receiver(), "Delivery queue stopped");
        }
        abandoned
    }

    pub fn sender(&self) -> DeliverySender {
        self.sender.clone()
    }

    pub fn enqueue(&self, envelope: Envelope) -> bool {
        self.sender.enqueue(envelope)
    }

    pub fn state(&self) -> DeliveryState {
        *self.state.lock()
    }

    /// Stop accepting envelopes, let the worker finish its current one and return
    /// the number of queued envelopes that were dropped.
    pub async fn shutdown(&self) -> usize {
        *self.state.lock() = DeliveryState::ShuttingDown;
        self.sender.shutdown.cancel();

        let worker = self.worker.lock().take();
        match worker {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                error!(error = %e, "Delivery worker panicked");
                0
            }),
            None => 0,
        }
    }
}
