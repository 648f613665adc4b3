//! HTTP output
//!
//! POSTs each batch as newline-delimited JSON. The response status decides
//! whether a failed batch is worth retrying.

use super::Sink;
use crate::error::SendError;
use crate::models::Batch;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;
use url::Url;

const CONTENT_TYPE: &str = "application/x-ndjson";

/// Map an HTTP status to a send result
///
/// 2xx succeeds. 408, 429 and 5xx are retried. Any other status means the
/// endpoint rejects the payload and will keep rejecting it.
pub fn classify_status(status: StatusCode) -> Result<(), SendError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("endpoint responded with {}", status);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(SendError::Transient(message))
    } else {
        Err(SendError::Fatal(message))
    }
}

pub struct HttpSink {
    client: reqwest::Client,
    url: Url,
}

impl HttpSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, SendError> {
        let url = Url::parse(url)
            .map_err(|e| SendError::Fatal(format!("invalid output url `{}`: {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SendError::Fatal(format!(
                "unsupported output url scheme `{}`",
                url.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SendError::Fatal(format!("failed to build http client: {}", e)))?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "http"
    }

    async fn send(&self, batch: &Batch) -> Result<(), SendError> {
        let payload = batch
            .to_ndjson()
            .map_err(|e| SendError::Fatal(format!("failed to encode batch: {}", e)))?;

        let response = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(payload)
            .send()
            .await
            .map_err(|e| SendError::Transient(format!("request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        debug!(
            sequence = batch.sequence(),
            status = status.as_u16(),
            "Batch POST completed"
        );
        classify_status(status)
    }
}
