//! Service Bus queue client over the REST peek-lock protocol.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{QueueClient, QueueMessage};
use crate::config::Secret;
use crate::{Error, Result};

const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";

fn default_receive_timeout() -> u64 {
    60
}

/// Connection settings of a Service Bus queue or subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceBusConfig {
    /// Namespace endpoint, e.g. `https://ns.servicebus.windows.net`.
    pub endpoint: Url,
    /// Queue name or `{topic}/subscriptions/{subscription}`.
    pub entity_path: String,
    /// Shared access signature sent as the `Authorization` header.
    pub sas_token: Secret,
    /// Long-poll timeout of a single receive in seconds.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    lock_token: String,
    message_id: String,
    #[serde(default)]
    delivery_count: u32,
}

pub struct ServiceBusQueueClient {
    config: ServiceBusConfig,
    client: Client,
}

impl ServiceBusQueueClient {
    pub fn new(config: ServiceBusConfig) -> Result<Self> {
        if config.entity_path.trim_matches('/').is_empty() {
            return Err(Error::config("service bus entity_path is empty"));
        }
        let client = Client::builder()
            // Long polls hold the request open for up to receive_timeout_secs.
            .timeout(Duration::from_secs(config.receive_timeout_secs + 10))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, tail: &[&str]) -> Result<Url> {
        let mut url = self.config.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                Error::config(format!(
                    "service bus endpoint '{}' cannot be a base url",
                    self.config.endpoint
                ))
            })?;
            segments.pop_if_empty();
            segments.extend(self.config.entity_path.split('/').filter(|s| !s.is_empty()));
            segments.extend(tail);
        }
        Ok(url)
    }
}

#[async_trait]
impl QueueClient for ServiceBusQueueClient {
    fn entity(&self) -> &str {
        &self.config.entity_path
    }

    async fn receive(&self) -> Result<Option<QueueMessage>> {
        let mut url = self.url(&["messages", "head"])?;
        url.query_pairs_mut()
            .append_pair("timeout", &self.config.receive_timeout_secs.to_string());

        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.config.sas_token.expose())
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CREATED | StatusCode::OK => {
                let properties = response
                    .headers()
                    .get(BROKER_PROPERTIES_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| Error::transport("receive response has no BrokerProperties header"))?;
                let properties: BrokerProperties = serde_json::from_str(properties)?;
                let body = response.bytes().await?;

                debug!(
                    entity = %self.config.entity_path,
                    message_id = %properties.message_id,
                    delivery_count = properties.delivery_count,
                    "Received message"
                );
                Ok(Some(QueueMessage {
                    message_id: properties.message_id,
                    lock_token: properties.lock_token,
                    delivery_count: properties.delivery_count,
                    body,
                }))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::transport(format!(
                    "receive from '{}' failed with status {}: {}",
                    self.config.entity_path, status, body
                )))
            }
        }
    }

    async fn complete(&self, message: &QueueMessage) -> Result<()> {
        let url = self.url(&["messages", &message.message_id, &message.lock_token])?;
        let response = self
            .client
            .delete(url)
            .header(reqwest::header::AUTHORIZATION, self.config.sas_token.expose())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "complete of message {} on '{}' failed with status {}: {}",
                message.message_id, self.config.entity_path, status, body
            )));
        }
        Ok(())
    }

    async fn renew_lock(&self, message: &QueueMessage) -> Result<()> {
        let url = self.url(&["messages", &message.message_id, &message.lock_token])?;
        let response = self
            .client
            .post(url)
            .header(reqwest::header::AUTHORIZATION, self.config.sas_token.expose())
            .header(reqwest::header::CONTENT_LENGTH, 0)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "lock renewal of message {} on '{}' failed with status {}: {}",
                message.message_id, self.config.entity_path, status, body
            )));
        }
        debug!(entity = %self.config.entity_path, message_id = %message.message_id, "Renewed message lock");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!(entity = %self.config.entity_path, "Closed service bus client");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(endpoint: &str) -> ServiceBusQueueClient {
        ServiceBusQueueClient::new(ServiceBusConfig {
            endpoint: Url::parse(endpoint).unwrap(),
            entity_path: "orders/subscriptions/relay".to_string(),
            sas_token: Secret::new("SharedAccessSignature sr=x&sig=y"),
            receive_timeout_secs: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_url() {
        let client = client_for("https://ns.servicebus.windows.net/");
        assert_eq!(
            client.url(&["messages", "head"]).unwrap().as_str(),
            "https://ns.servicebus.windows.net/orders/subscriptions/relay/messages/head"
        );
    }

    #[test]
    fn test_empty_entity_rejected() {
        let result = ServiceBusQueueClient::new(ServiceBusConfig {
            endpoint: Url::parse("https://ns.servicebus.windows.net").unwrap(),
            entity_path: "/".to_string(),
            sas_token: Secret::default(),
            receive_timeout_secs: 1,
        });
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_receive_renew_and_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/subscriptions/relay/messages/head"))
            .and(query_param("timeout", "1"))
            .and(header("authorization", "SharedAccessSignature sr=x&sig=y"))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header(
                        "BrokerProperties",
                        r#"{"LockToken":"lock-1","MessageId":"msg-1","DeliveryCount":2}"#,
                    )
                    .set_body_string(r#"{"subject":"s"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/orders/subscriptions/relay/messages/msg-1/lock-1"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/orders/subscriptions/relay/messages/msg-1/lock-1"))
            .and(header("authorization", "SharedAccessSignature sr=x&sig=y"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        let message = client.receive().await.unwrap().unwrap();
        assert_eq!(message.message_id, "msg-1");
        assert_eq!(message.lock_token, "lock-1");
        assert_eq!(message.delivery_count, 2);
        assert_eq!(&message.body[..], br#"{"subject":"s"}"#);

        client.renew_lock(&message).await.unwrap();
        client.complete(&message).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_lock_lost() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/subscriptions/relay/messages/msg-1/lock-1"))
            .respond_with(ResponseTemplate::new(410).set_body_string("lock lost"))
            .mount(&server)
            .await;

        let message = QueueMessage {
            message_id: "msg-1".to_string(),
            lock_token: "lock-1".to_string(),
            delivery_count: 1,
            body: Default::default(),
        };
        let err = client_for(&server.uri()).renew_lock(&message).await.unwrap_err();
        assert!(err.to_string().contains("410"));
    }

    #[tokio::test]
    async fn test_receive_empty_and_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/subscriptions/relay/messages/head"))
            .respond_with(ResponseTemplate::new(204))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/orders/subscriptions/relay/messages/head"))
            .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
            .mount(&server)
            .await;

        let client = client_for(&server.uri());
        assert!(client.receive().await.unwrap().is_none());

        let err = client.receive().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
        assert!(err.to_string().contains("401"));
    }
}
