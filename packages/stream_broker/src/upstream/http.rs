//! HTTP connector: `POST`s the turn to the agent endpoint and streams the body.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::header::ACCEPT;
use std::time::Duration;
use tracing::debug;

use super::{ByteStream, StartRequest, UpstreamConnector};
use crate::error::UpstreamError;

/// Error bodies are only logged and echoed to subscribers; keep them short.
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    url: String,
}

impl HttpUpstream {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl UpstreamConnector for HttpUpstream {
    fn open(&self, request: StartRequest) -> BoxFuture<'static, Result<ByteStream, UpstreamError>> {
        let client = self.client.clone();
        let url = self.url.clone();

        async move {
            debug!(session_id = %request.session_id, "opening upstream stream at {}", url);
            let response = client
                .post(&url)
                .header(ACCEPT, "text/event-stream")
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamError::Status {
                    status: status.as_u16(),
                    body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                });
            }

            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(UpstreamError::from));
            Ok(stream.boxed())
        }
        .boxed()
    }
}
