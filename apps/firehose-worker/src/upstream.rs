use crate::error::StreamError;
use crate::model::Tenant;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use std::time::Duration;

pub type ChunkStream = BoxStream<'static, Result<Bytes, StreamError>>;

/// Opens one tenant's long-lived firehose connection.
#[async_trait::async_trait]
pub trait UpstreamConnector: Send + Sync + 'static {
    async fn connect(&self, tenant: &Tenant) -> Result<ChunkStream, StreamError>;
}

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub url: String,
    pub api_key_header: String,
    pub connect_timeout: Duration,
}

pub struct HttpConnector {
    client: reqwest::Client,
    settings: UpstreamSettings,
}

impl HttpConnector {
    pub fn new(settings: UpstreamSettings) -> Result<Self> {
        // No overall request timeout: the body is an unbounded stream.
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self { client, settings })
    }
}

#[async_trait::async_trait]
impl UpstreamConnector for HttpConnector {
    async fn connect(&self, tenant: &Tenant) -> Result<ChunkStream, StreamError> {
        if !tenant.has_credential() {
            return Err(StreamError::MissingCredential);
        }

        let response = self
            .client
            .get(&self.settings.url)
            .header(self.settings.api_key_header.as_str(), tenant.api_key.trim())
            .header(ACCEPT, "application/x-ndjson, text/event-stream, application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Rejected(status.as_u16()));
        }

        tracing::debug!(tenant = %tenant.id, status = status.as_u16(), "upstream connection accepted");
        Ok(response.bytes_stream().map_err(StreamError::from).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tenant_without_credential_fails_before_dialing() {
        let connector = HttpConnector::new(UpstreamSettings {
            url: "http://127.0.0.1:9/never-dialed".to_string(),
            api_key_header: "X-API-Key".to_string(),
            connect_timeout: Duration::from_secs(1),
        })
        .expect("client");
        let tenant = Tenant {
            id: "t1".to_string(),
            display_name: "Acme".to_string(),
            api_key: "   ".to_string(),
            is_active: true,
            last_seen: 0,
        };

        let result = connector.connect(&tenant).await;
        assert!(matches!(result, Err(StreamError::MissingCredential)));
    }
}
