//! Event Grid topic publisher.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{EventPublisher, OutboundEvent};
use crate::config::Secret;
use crate::{Error, Result};

const SAS_KEY_HEADER: &str = "aeg-sas-key";

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventGridConfig {
    /// Topic endpoint, e.g. `https://topic.region.eventgrid.azure.net/api/events`.
    pub topic_endpoint: Url,
    /// Topic access key.
    pub key: Secret,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Publishes events to an Event Grid topic, one event per request.
pub struct EventGridPublisher {
    config: EventGridConfig,
    client: Client,
}

impl EventGridPublisher {
    pub fn new(config: EventGridConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { config, client })
    }

    pub fn topic_endpoint(&self) -> &Url {
        &self.config.topic_endpoint
    }
}

#[async_trait]
impl EventPublisher for EventGridPublisher {
    async fn publish(&self, event: &OutboundEvent) -> Result<()> {
        let response = self
            .client
            .post(self.config.topic_endpoint.clone())
            .header(SAS_KEY_HEADER, self.config.key.expose())
            .json(&[event])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "publish to {} failed with status {}: {}",
                self.config.topic_endpoint, status, body
            )));
        }

        debug!(
            topic = %self.config.topic_endpoint,
            event_id = %event.id,
            event_type = %event.event_type,
            "Published event"
        );
        Ok(())
    }
}
