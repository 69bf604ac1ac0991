//! Ordered action chain bound to one receiver.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::Result;
use crate::actions::{Action, ActionConfig, ActionDeps, build_action, run_action};
use crate::envelope::Envelope;

/// Result of running a chain on one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// The event type is not on the allow-list, no action ran.
    Skipped,
    /// Every action succeeded.
    Completed { actions: usize },
}

/// The allow-list and actions of a receiver.
pub struct ActionChain {
    receiver: String,
    allowed_event_types: HashSet<String>,
    actions: Vec<Arc<dyn Action>>,
}

impl ActionChain {
    pub fn new(
        receiver: impl Into<String>,
        allowed_event_types: impl IntoIterator<Item = String>,
        actions: Vec<Arc<dyn Action>>,
    ) -> Self {
        Self {
            receiver: receiver.into(),
            allowed_event_types: allowed_event_types.into_iter().collect(),
            actions,
        }
    }

    /// Parse and build each raw action config in order.
    ///
    /// A config that fails to parse or build is logged and left out; the remaining
    /// actions keep their relative order.
    pub fn register(
        receiver: &str,
        allowed_event_types: &[String],
        configs: &[Value],
        deps: &ActionDeps,
    ) -> Self {
        if allowed_event_types.is_empty() {
            warn!(
                receiver,
                "Receiver has no allowed event types, every notification will be skipped"
            );
        }

        let mut actions = Vec::with_capacity(configs.len());
        for (index, raw) in configs.iter().enumerate() {
            match Self::build_one(raw, deps) {
                Ok((config, action)) => {
                    info!(
                        receiver,
                        index,
                        action = action.name(),
                        kind = %action.kind(),
                        config = %serde_json::to_string(&config).unwrap_or_default(),
                        "Registered action"
                    );
                    actions.push(action);
                }
                Err(e) => {
                    error!(receiver, index, error = %e, "Skipping invalid action configuration");
                }
            }
        }

        Self::new(receiver, allowed_event_types.iter().cloned(), actions)
    }

    fn build_one(raw: &Value, deps: &ActionDeps) -> Result<(ActionConfig, Arc<dyn Action>)> {
        let config: ActionConfig = serde_json::from_value(raw.clone())
            .map_err(|e| crate::Error::config(format!("invalid action: {e}")))?;
        let action = build_action(config.clone(), deps)?;
        Ok((config, action))
    }

    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        self.allowed_event_types.contains(event_type)
    }

    /// Run the actions in order, stopping at the first failure.
    pub async fn run(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<ChainOutcome> {
        let span = info_span!(
            "envelope",
            receiver = %self.receiver,
            correlation_id = %envelope.correlation_id(),
        );
        self.run_inner(envelope, cancel).instrument(span).await
    }

    async fn run_inner(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<ChainOutcome> {
        if !self.accepts(envelope.event_type()) {
            debug!(
                event = "skipped",
                event_type = envelope.event_type(),
                subject = envelope.subject(),
                "Event type not allowed, skipping"
            );
            return Ok(ChainOutcome::Skipped);
        }

        info!(
            event = "received",
            event_type = envelope.event_type(),
            subject = envelope.subject(),
            actions = self.actions.len(),
            "Processing notification"
        );

        for action in &self.actions {
            run_action(action.as_ref(), envelope, cancel).await?;
        }

        Ok(ChainOutcome::Completed {
            actions: self.actions.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{ActionError, ActionKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Action for Recorder {
        fn kind(&self) -> ActionKind {
            ActionKind::ExternalProcess
        }

        fn name(&self) -> &str {
            &self.name
        }

        async fn process(
            &self,
            _envelope: &Envelope,
            _cancel: &CancellationToken,
        ) -> std::result::Result<(), ActionError> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                return Err(ActionError::new(self.kind(), &self.name, "boom"));
            }
            Ok(())
        }
    }

    fn recorder(name: &str, log: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<dyn Action> {
        Arc::new(Recorder {
            name: name.to_string(),
            log: log.clone(),
            fail,
        })
    }

    fn envelope(event_type: &str) -> Envelope {
        Envelope::new("/containers/raw/blobs/a", event_type, "1.0", json!({}))
    }

    #[tokio::test]
    async fn test_runs_actions_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ActionChain::new(
            "r",
            ["Created".to_string()],
            vec![recorder("a", &log, false), recorder("b", &log, false)],
        );

        let outcome = chain
            .run(&envelope("Created"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ChainOutcome::Completed { actions: 2 });
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_skips_disallowed_event_type() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ActionChain::new("r", ["Created".to_string()], vec![recorder("a", &log, false)]);

        let outcome = chain
            .run(&envelope("Deleted"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ChainOutcome::Skipped);
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_allow_list_accepts_nothing() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ActionChain::new("r", Vec::new(), vec![recorder("a", &log, false)]);

        assert!(!chain.accepts("Created"));
        let outcome = chain
            .run(&envelope("Created"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, ChainOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_first_failure_stops_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ActionChain::new(
            "r",
            ["Created".to_string()],
            vec![
                recorder("a", &log, false),
                recorder("b", &log, true),
                recorder("c", &log, false),
            ],
        );

        let err = chain
            .run(&envelope("Created"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, crate::Error::Action(ActionError { ref action, .. }) if action == "b"));
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_register_skips_invalid_configs() {
        let configs = vec![
            json!({ "type": "external_process", "name": "first", "filename": "/bin/true" }),
            json!({ "type": "teleport" }),
            json!({ "type": "object_upload", "container_name": "x" }),
            json!({ "type": "external_process", "name": "second", "filename": "/bin/true" }),
        ];

        let chain = ActionChain::register(
            "inbox",
            &["Local.FileSystem.Created".to_string()],
            &configs,
            &ActionDeps::new(),
        );

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.actions[0].name(), "first");
        assert_eq!(chain.actions[1].name(), "second");
        assert!(chain.accepts("Local.FileSystem.Created"));
        assert_eq!(chain.receiver(), "inbox");
    }
}
