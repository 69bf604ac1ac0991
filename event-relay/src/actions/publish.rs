//! Republish an envelope to an event topic.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

use super::{Action, ActionError, ActionKind};
use crate::config::Secret;
use crate::envelope::Envelope;
use crate::transport::{EventGridConfig, EventGridPublisher, EventPublisher, OutboundEvent};

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPublishConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub topic_endpoint: Url,
    pub key: Secret,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

pub struct NotificationPublishAction {
    name: String,
    publisher: Arc<dyn EventPublisher>,
}

impl NotificationPublishAction {
    pub fn new(name: impl Into<String>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            name: name.into(),
            publisher,
        }
    }

    pub fn from_config(config: NotificationPublishConfig) -> crate::Result<Self> {
        let publisher = EventGridPublisher::new(EventGridConfig {
            topic_endpoint: config.topic_endpoint,
            key: config.key,
            timeout_secs: config.timeout_secs,
        })?;
        Ok(Self::new(
            config
                .name
                .unwrap_or_else(|| ActionKind::NotificationPublish.to_string()),
            Arc::new(publisher),
        ))
    }
}

#[async_trait]
impl Action for NotificationPublishAction {
    fn kind(&self) -> ActionKind {
        ActionKind::NotificationPublish
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, envelope: &Envelope, cancel: &CancellationToken) -> Result<(), ActionError> {
        let event = OutboundEvent::derived_from(envelope);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(crate::Error::Cancelled),
            result = self.publisher.publish(&event) => result,
        };
        result.map_err(|e| {
            ActionError::wrap(ActionKind::NotificationPublish, &self.name, "publishing event", e)
        })?;

        info!(event_id = %event.id, event_type = %event.event_type, "Published notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<OutboundEvent>>,
        fail: bool,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: &OutboundEvent) -> crate::Result<()> {
            if self.fail {
                return Err(crate::Error::transport("topic unavailable"));
            }
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_publish_copies_envelope_fields() {
        let publisher = Arc::new(RecordingPublisher::default());
        let action = NotificationPublishAction::new("notify", publisher.clone());
        let envelope = Envelope::new(
            "/containers/raw/blobs/a.png",
            "Microsoft.Storage.BlobCreated",
            "1.0",
            json!({ "size": 3 }),
        );

        action.process(&envelope, &CancellationToken::new()).await.unwrap();

        let events = publisher.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].subject, envelope.subject());
        assert_eq!(events[0].event_type, envelope.event_type());
        assert_eq!(events[0].data, json!({ "size": 3 }));
        assert_ne!(events[0].id, envelope.id());
    }

    #[tokio::test]
    async fn test_publish_failure_fails_action() {
        let publisher = Arc::new(RecordingPublisher {
            fail: true,
            ..Default::default()
        });
        let action = NotificationPublishAction::new("notify", publisher);
        let envelope = Envelope::new("s", "t", "1.0", json!(null));

        let err = action
            .process(&envelope, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ActionKind::NotificationPublish);
        assert!(err.message.contains("topic unavailable"));
    }
}
