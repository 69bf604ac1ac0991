//! Relay host.
//!
//! Owns the receivers built from the configuration and drives their lifecycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use blob_store::BlobStore;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RelayConfig;
use crate::receivers::{Receiver, ReceiverConfig, ReceiverContext, ReceiverState, build_receiver};
use crate::transport::{QueueClient, StreamClient};
use crate::{Error, Result};

/// Builds and runs every configured receiver.
pub struct RelayService {
    config: RelayConfig,
    context: ReceiverContext,
    receivers: Mutex<Vec<Arc<dyn Receiver>>>,
    started: Mutex<bool>,
}

impl RelayService {
    pub fn from_config(config: RelayConfig) -> Self {
        Self {
            config,
            context: ReceiverContext::default(),
            receivers: Mutex::new(Vec::new()),
            started: Mutex::new(false),
        }
    }

    /// Register a queue client that `connector` transports can refer to by name.
    pub fn with_queue_connector(mut self, name: impl Into<String>, client: Arc<dyn QueueClient>) -> Self {
        self.context.queues.insert(name.into(), client);
        self
    }

    /// Register a stream client that stream receivers can refer to by name.
    pub fn with_stream_connector(mut self, name: impl Into<String>, client: Arc<dyn StreamClient>) -> Self {
        self.context.streams.insert(name.into(), client);
        self
    }

    /// Use `store` for every action whose store configuration describes it.
    pub fn with_blob_store(self, store: Arc<dyn BlobStore>) -> Self {
        self.context.deps.insert_store(store);
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Token passed to every action. Cancelled when a graceful stop times out.
    pub fn action_cancellation_token(&self) -> CancellationToken {
        self.context.action_cancel.clone()
    }

    pub fn receivers(&self) -> Vec<Arc<dyn Receiver>> {
        self.receivers.lock().clone()
    }

    /// Names of configured stream receivers whose connector has not been registered.
    /// The binary registers no stream clients, so every stream receiver it loads is listed.
    pub fn unresolved_stream_receivers(&self) -> Vec<String> {
        self.config
            .receivers
            .iter()
            .filter_map(|raw| match ReceiverConfig::parse(raw) {
                Ok(ReceiverConfig::Stream(c)) if !self.context.streams.contains_key(&c.connector) => {
                    Some(c.name)
                }
                _ => None,
            })
            .collect()
    }

    /// Build receivers from the configuration. Invalid entries and duplicate names are
    /// logged and skipped.
    fn build_receivers(&self) -> Vec<Arc<dyn Receiver>> {
        let mut names = HashSet::new();
        let mut receivers = Vec::with_capacity(self.config.receivers.len());

        for (index, raw) in self.config.receivers.iter().enumerate() {
            let config = match ReceiverConfig::parse(raw) {
                Ok(config) => config,
                Err(e) => {
                    error!(index, error = %e, "Skipping invalid receiver configuration");
                    continue;
                }
            };
            if !names.insert(config.name().to_string()) {
                error!(index, receiver = config.name(), "Skipping receiver with duplicate name");
                continue;
            }

            let name = config.name().to_string();
            match build_receiver(config, &self.context) {
                Ok(receiver) => receivers.push(receiver),
                Err(e) => error!(index, receiver = %name, error = %e, "Failed to build receiver"),
            }
        }
        receivers
    }

    /// Build and start every receiver. A receiver that fails to start is logged and
    /// left stopped; the others keep running. Returns the number of running receivers.
    pub async fn start(&self) -> Result<usize> {
        {
            let mut started = self.started.lock();
            if *started {
                return Err(Error::invalid_transition("Running", "Running"));
            }
            *started = true;
        }

        info!(
            environment = %self.config.environment_name,
            receivers = self.config.receivers.len(),
            "Starting relay"
        );
        let unresolved = self.unresolved_stream_receivers();
        if !unresolved.is_empty() {
            warn!(
                receivers = ?unresolved,
                stream_connectors = self.context.streams.len(),
                "Stream receivers need a stream client registered with with_stream_connector, they will not start"
            );
        }

        let receivers = self.build_receivers();
        let mut running = 0;
        for receiver in &receivers {
            match receiver.start().await {
                Ok(()) => running += 1,
                Err(e) => error!(
                    receiver = receiver.name(),
                    kind = %receiver.kind(),
                    error = %e,
                    "Failed to start receiver"
                ),
            }
        }
        *self.receivers.lock() = receivers;

        info!(running, "Relay started");
        Ok(running)
    }

    /// Stop every receiver, waiting up to `shutdown_timeout_secs` for in-flight work.
    /// When the timeout elapses, running actions are cancelled and the stop completes
    /// once they have unwound.
    pub async fn stop(&self) -> Result<()> {
        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let receivers = self.receivers();
        info!(
            receivers = receivers.len(),
            timeout_secs = timeout.as_secs(),
            "Stopping relay"
        );

        let stop_all = futures::future::join_all(receivers.iter().map(|r| r.stop()));
        tokio::pin!(stop_all);

        let results = match tokio::time::timeout(timeout, &mut stop_all).await {
            Ok(results) => results,
            Err(_) => {
                warn!("Shutdown timeout reached, cancelling running actions");
                self.context.action_cancel.cancel();
                stop_all.await
            }
        };

        for (receiver, result) in receivers.iter().zip(results) {
            if let Err(e) = result {
                error!(receiver = receiver.name(), error = %e, "Failed to stop receiver");
            }
        }

        info!("Relay stopped");
        Ok(())
    }

    /// Number of receivers currently running.
    pub fn running_count(&self) -> usize {
        self.receivers
            .lock()
            .iter()
            .filter(|r| r.state() == ReceiverState::Running)
            .count()
    }
}
