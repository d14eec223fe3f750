// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Third pipeline stage: delivers records to the HTTP event collector one at a time.
//!
//! Each record is wrapped in a delivery envelope and posted on its own. A delivery is
//! retried with the shared backoff; a record that still cannot be delivered stops the
//! pipeline and everything queued behind it stays in queue B.

use crate::config::Config;
use crate::errors::{PipelineError, ShipError};
use crate::http::get_client;
use crate::retry::{retry, RetryError, RetryPolicy};
use crate::Record;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Wraps `record` as `{"source": "<tag>", "event": <record>}`.
///
/// The record is embedded byte for byte. The tag is JSON escaped.
#[must_use]
pub fn envelope(tag: &str, record: &[u8]) -> Bytes {
    let tag = serde_json::Value::from(tag).to_string();
    let mut body = BytesMut::with_capacity(tag.len() + record.len() + 24);
    body.extend_from_slice(br#"{"source": "#);
    body.extend_from_slice(tag.as_bytes());
    body.extend_from_slice(br#", "event": "#);
    body.extend_from_slice(record);
    body.extend_from_slice(b"}");
    body.freeze()
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Posts one envelope. Any non-2xx answer is an error.
    async fn send(&self, body: Bytes) -> Result<(), ShipError>;
}

/// Error body returned by the event collector.
#[derive(Debug, Deserialize)]
struct HecResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    code: i64,
}

pub struct HecSink {
    client: reqwest::Client,
    url: String,
    auth_scheme: String,
    api_key: String,
    headers: OnceCell<HeaderMap>,
}

impl fmt::Debug for HecSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HecSink")
            .field("url", &self.url)
            .field("auth_scheme", &self.auth_scheme)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl HecSink {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self::with_client(
            get_client(config.https_proxy.as_deref(), config.http_timeout()),
            &config.sink_url,
            &config.sink_auth_scheme,
            &config.sink_key,
        )
    }

    #[must_use]
    pub fn with_client(
        client: reqwest::Client,
        url: &str,
        auth_scheme: &str,
        api_key: &str,
    ) -> Self {
        Self {
            client,
            url: url.to_string(),
            auth_scheme: auth_scheme.to_string(),
            api_key: api_key.trim().to_string(),
            headers: OnceCell::new(),
        }
    }

    async fn get_headers(&self) -> Result<&HeaderMap, ShipError> {
        self.headers
            .get_or_try_init(|| async {
                if self.api_key.is_empty() {
                    error!("SHIPPER | No sink key configured");
                    return Err(ShipError::MissingKey);
                }
                let mut headers = HeaderMap::new();
                let mut authorization =
                    HeaderValue::from_str(&format!("{} {}", self.auth_scheme, self.api_key))?;
                authorization.set_sensitive(true);
                headers.insert(AUTHORIZATION, authorization);
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                Ok::<_, ShipError>(headers)
            })
            .await
    }
}

#[async_trait]
impl Sink for HecSink {
    async fn send(&self, body: Bytes) -> Result<(), ShipError> {
        let headers = self.get_headers().await?;
        let response = self
            .client
            .post(&self.url)
            .headers(headers.clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                error!("SHIPPER | Could not read sink response body: {e}");
                String::new()
            }
        };
        match serde_json::from_str::<HecResponse>(&body) {
            Ok(HecResponse { text, code }) => {
                debug!("SHIPPER | Sink rejected event with {status}: {text} (code {code})");
            }
            Err(_) => debug!("SHIPPER | Sink rejected event with {status}: {body:?}"),
        }
        Err(ShipError::Status { status, body })
    }
}

pub struct Shipper {
    sink: Arc<dyn Sink>,
    source: Receiver<Record>,
    policy: RetryPolicy,
    source_tag: String,
}

impl Shipper {
    #[must_use]
    pub fn new(sink: Arc<dyn Sink>, source: Receiver<Record>, config: &Config) -> Self {
        Self {
            sink,
            source,
            policy: config.retry.clone(),
            source_tag: config.source_tag.clone(),
        }
    }

    /// Delivers one record, retrying with backoff. The envelope is built once and
    /// resent unchanged on every attempt.
    pub async fn deliver(
        &self,
        record: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), RetryError<ShipError>> {
        let body = envelope(&self.source_tag, record);
        retry(&self.policy, cancel, "SHIPPER", || self.sink.send(body.clone())).await
    }

    /// Delivers records from queue B until cancelled, queue B is closed, or a record
    /// exhausts its retries.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        info!("SHIPPER | Start");
        loop {
            let record = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                record = self.source.recv() => match record {
                    Some(record) => record,
                    None => {
                        debug!("SHIPPER | Queue B closed");
                        break;
                    }
                },
            };

            match self.deliver(&record, cancel).await {
                Ok(()) => info!("SHIPPER | Shipped a log"),
                Err(RetryError::Cancelled { .. }) => break,
                Err(RetryError::Exhausted { attempts, last }) => {
                    error!("SHIPPER | Fatal error encountered after {attempts} attempts: {last}");
                    return Err(PipelineError::ShipperExhausted {
                        attempts,
                        source: last,
                    });
                }
            }
        }
        info!("SHIPPER | Stopping");
        Ok(())
    }
}
