use crate::error::ServiceError;
use crate::http::{ClassifyResponse, ServiceConfig, TrainQuery};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// The two per-example operations a batch is made of.
#[async_trait]
pub trait ClassificationService: Send + Sync + 'static {
    async fn train_one(&self, label: &str, pixels: Bytes) -> Result<(), ServiceError>;

    async fn classify_one(&self, pixels: Bytes) -> Result<String, ServiceError>;
}

/// HTTP client for the classification service. Holds connection settings
/// only; all model state lives on the server.
#[derive(Debug, Clone)]
pub struct ServiceClient {
    base_url: String,
    client: reqwest::Client,
}

impl ServiceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(request: RequestBuilder) -> Result<Response, ServiceError> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn body(response: Response) -> Result<Bytes, ServiceError> {
        Ok(response.bytes().await?)
    }

    /// Resets the remote model with new hyperparameters (`POST /new`).
    pub async fn configure(&self, config: &ServiceConfig) -> Result<(), ServiceError> {
        Self::send(self.client.post(self.url("/new")).json(config)).await?;
        info!(
            hashtables = config.hashtables,
            addresses = config.addresses,
            bleach = config.bleach,
            "service configured"
        );
        Ok(())
    }

    /// Current hyperparameters, including the resolved mapping (`GET /info`).
    pub async fn fetch_info(&self) -> Result<ServiceConfig, ServiceError> {
        let response = Self::send(self.client.get(self.url("/info"))).await?;
        let body = Self::body(response).await?;
        serde_json::from_slice(&body).map_err(|e| ServiceError::Decode(e.to_string()))
    }

    /// Downloads the gzip-compressed model blob (`GET /model`).
    pub async fn save_model(&self) -> Result<Bytes, ServiceError> {
        let response = Self::send(self.client.get(self.url("/model"))).await?;
        Self::body(response).await
    }

    /// Restores a blob previously returned by [`save_model`](Self::save_model).
    pub async fn load_model(&self, blob: Bytes) -> Result<(), ServiceError> {
        let request = self
            .client
            .post(self.url("/model"))
            .header(CONTENT_ENCODING, "gzip")
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(blob);
        Self::send(request).await?;
        Ok(())
    }

    /// Erases all learned state and restores default hyperparameters.
    pub async fn erase_model(&self) -> Result<(), ServiceError> {
        Self::send(self.client.delete(self.url("/model"))).await?;
        Ok(())
    }

    /// Polls `/info` until the service answers or `timeout` elapses. No single
    /// probe outlives the remaining budget.
    pub async fn wait_until_ready(&self, timeout: Duration, poll_interval: Duration) -> Result<(), ServiceError> {
        let start = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(start.elapsed());
            let probe = match tokio::time::timeout(remaining, self.fetch_info()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout),
            };
            match probe {
                Ok(_) => return Ok(()),
                Err(err) if start.elapsed() + poll_interval < timeout => {
                    debug!(error = %err, "service not ready yet");
                    tokio::time::sleep(poll_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ClassificationService for ServiceClient {
    async fn train_one(&self, label: &str, pixels: Bytes) -> Result<(), ServiceError> {
        let request = self
            .client
            .post(self.url("/train"))
            .query(&TrainQuery {
                label: label.to_string(),
            })
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(pixels);
        Self::send(request).await?;
        Ok(())
    }

    async fn classify_one(&self, pixels: Bytes) -> Result<String, ServiceError> {
        let request = self
            .client
            .post(self.url("/classify"))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(pixels);
        let response = Self::send(request).await?;
        let body = Self::body(response).await?;
        let ClassifyResponse { label } =
            serde_json::from_slice(&body).map_err(|e| ServiceError::Decode(e.to_string()))?;
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = ServiceClient::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://localhost:8080");
        assert_eq!(client.url("/info"), "http://localhost:8080/info");
    }

    #[tokio::test]
    async fn unreachable_service_is_a_network_error() {
        // Port 9 (discard) is closed on loopback in practice.
        let client = ServiceClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.classify_one(Bytes::from_static(&[0, 1])).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err:?}");
    }

    #[tokio::test]
    async fn readiness_wait_is_bounded_by_its_own_budget() {
        // accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = ServiceClient::new(format!("http://{addr}"), Duration::from_secs(30)).unwrap();
        let started = Instant::now();
        let err = client
            .wait_until_ready(Duration::from_millis(300), Duration::from_millis(50))
            .await
            .unwrap_err();

        assert_eq!(err, ServiceError::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }
}
