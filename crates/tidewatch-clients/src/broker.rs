//! Message-broker collaborator.
//!
//! The reconciliation loop only needs queue metadata: pending message
//! counts and consumer counts. [`RabbitMqBroker`] reads them from the
//! RabbitMQ management HTTP API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info, warn};

use tidewatch_core::{BrokerConfig, QueueObservation};

use crate::error::{BrokerError, HttpError};
use crate::http::{self, HttpRequest, HttpResponse};

/// Queue metadata source polled once per cycle.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Observe every queue visible to this client.
    async fn list_queues(&self) -> Result<Vec<QueueObservation>, BrokerError>;

    /// Current consumer count for a single queue.
    async fn consumer_count(&self, queue: &str) -> Result<u32, BrokerError>;

    /// Whether the last interaction with the broker succeeded.
    fn is_connected(&self) -> bool;

    /// Re-establish connectivity after a failure.
    async fn reconnect(&self) -> Result<(), BrokerError>;
}

#[derive(Debug, Deserialize)]
struct QueueInfo {
    name: String,
    #[serde(default)]
    messages: u32,
    #[serde(default)]
    consumers: u32,
}

impl QueueInfo {
    fn into_observation(self, observed_at: SystemTime) -> QueueObservation {
        QueueObservation {
            name: self.name,
            pending_count: self.messages,
            consumer_count: self.consumers,
            observed_at,
        }
    }
}

/// Broker client backed by the RabbitMQ management API.
pub struct RabbitMqBroker {
    config: BrokerConfig,
    authorization: String,
    connected: AtomicBool,
}

impl RabbitMqBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let credentials = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", config.username, config.password));
        Self {
            config,
            authorization: format!("Basic {credentials}"),
            connected: AtomicBool::new(false),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url, path)
    }

    async fn get(&self, path: &str) -> Result<HttpResponse, BrokerError> {
        let url = self.url(path);
        let req = HttpRequest::get(&url).header("authorization", self.authorization.clone());

        match http::send(req, self.config.request_timeout).await {
            Ok(resp) => {
                self.connected.store(true, Ordering::Release);
                Ok(resp)
            }
            Err(e) => {
                if matches!(e, HttpError::Connect { .. } | HttpError::Timeout(_))
                    && self.connected.swap(false, Ordering::AcqRel)
                {
                    warn!(url = %self.config.url, error = %e, "lost connection to broker");
                }
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn list_queues(&self) -> Result<Vec<QueueObservation>, BrokerError> {
        let path = format!(
            "/api/queues/{}?columns=name,messages,consumers",
            http::encode_segment(&self.config.vhost)
        );
        let resp = self.get(&path).await?;
        if !resp.is_success() {
            return Err(BrokerError::Status {
                status: resp.status,
                path,
            });
        }

        let queues = parse_queues(&resp.body)?;
        debug!(count = queues.len(), "listed broker queues");
        Ok(queues)
    }

    async fn consumer_count(&self, queue: &str) -> Result<u32, BrokerError> {
        let path = format!(
            "/api/queues/{}/{}",
            http::encode_segment(&self.config.vhost),
            http::encode_segment(queue)
        );
        let resp = self.get(&path).await?;
        match resp.status {
            404 => Err(BrokerError::QueueNotFound(queue.to_string())),
            s if !(200..300).contains(&s) => Err(BrokerError::Status { status: s, path }),
            _ => {
                let info: QueueInfo = serde_json::from_slice(&resp.body)
                    .map_err(|e| BrokerError::Decode(e.to_string()))?;
                Ok(info.consumers)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let resp = self.get("/api/overview").await?;
        if !resp.is_success() {
            self.connected.store(false, Ordering::Release);
            return Err(BrokerError::Status {
                status: resp.status,
                path: "/api/overview".to_string(),
            });
        }
        info!(url = %self.config.url, "connected to broker");
        Ok(())
    }
}

/// Decode a `/api/queues` listing into observations stamped with now.
fn parse_queues(body: &[u8]) -> Result<Vec<QueueObservation>, BrokerError> {
    let infos: Vec<QueueInfo> =
        serde_json::from_slice(body).map_err(|e| BrokerError::Decode(e.to_string()))?;
    let now = SystemTime::now();
    Ok(infos
        .into_iter()
        .map(|info| info.into_observation(now))
        .collect())
}
