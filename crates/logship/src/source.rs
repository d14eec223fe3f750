// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Paginated access to the search-indexed log store.
//!
//! [`ElasticsearchSource`] drives the scroll API: one request opens a scroll and
//! returns the first page, each following request advances the cursor, and a page
//! without hits means the result set is exhausted.

use crate::config::Config;
use crate::errors::SourceError;
use crate::http::{get_client, AuthorizedClient};
use crate::Record;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::value::RawValue;
use tracing::debug;

/// Scroll id issued by the source. Only valid within one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(String);

impl Cursor {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One batch of hits.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Handle for the next page, absent when the source did not issue one.
    pub cursor: Option<Cursor>,
    /// Total number of matches reported by the source for the whole query.
    pub total_hits: u64,
    pub hits: Vec<Record>,
}

impl Page {
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.hits.is_empty()
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Runs `query` and returns the first page of at most `page_size` hits.
    async fn open_scroll(&self, query: &str, page_size: usize) -> Result<Page, SourceError>;

    async fn next_page(&self, cursor: &Cursor) -> Result<Page, SourceError>;

    /// Releases the server side scroll context. Best effort.
    async fn clear_scroll(&self, cursor: &Cursor);
}

#[derive(Deserialize)]
struct ScrollResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    hits: HitsEnvelope,
}

#[derive(Deserialize)]
struct HitsEnvelope {
    #[serde(default)]
    total: Option<TotalHits>,
    #[serde(default)]
    hits: Vec<Hit>,
}

// Elasticsearch 7+ reports an object, older versions a bare number.
#[derive(Deserialize)]
#[serde(untagged)]
enum TotalHits {
    Count(u64),
    Object { value: u64 },
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: Box<RawValue>,
}

impl From<ScrollResponse> for Page {
    fn from(response: ScrollResponse) -> Self {
        let total_hits = match response.hits.total {
            Some(TotalHits::Count(n) | TotalHits::Object { value: n }) => n,
            None => response.hits.hits.len() as u64,
        };
        Page {
            cursor: response.scroll_id.map(Cursor),
            total_hits,
            hits: response
                .hits
                .hits
                .into_iter()
                .map(|hit| Bytes::copy_from_slice(hit.source.get().as_bytes()))
                .collect(),
        }
    }
}

/// Decodes one scroll response body into a [`Page`].
pub fn parse_page(body: &[u8]) -> Result<Page, SourceError> {
    let response: ScrollResponse = serde_json::from_slice(body)?;
    Ok(response.into())
}

#[derive(Debug, Clone)]
pub struct ElasticsearchSource {
    client: AuthorizedClient,
    base_url: String,
    keep_alive: String,
}

impl ElasticsearchSource {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let client = get_client(config.https_proxy.as_deref(), config.http_timeout());
        Self::with_client(
            AuthorizedClient::new(client, config.source_auth.clone()),
            &config.source_url,
            &config.scroll_keep_alive,
        )
    }

    #[must_use]
    pub fn with_client(client: AuthorizedClient, base_url: &str, keep_alive: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            keep_alive: keep_alive.to_string(),
        }
    }

    async fn read_page(response: reqwest::Response) -> Result<Page, SourceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(SourceError::Status { status, body });
        }
        let body = response.bytes().await?;
        parse_page(&body)
    }
}

#[async_trait]
impl Source for ElasticsearchSource {
    async fn open_scroll(&self, query: &str, page_size: usize) -> Result<Page, SourceError> {
        let url = format!("{}/_search", self.base_url);
        // The query is embedded verbatim; it was validated as JSON at startup.
        let body = format!(r#"{{"query": {query}}}"#);
        let size = page_size.to_string();
        let response = self
            .client
            .post(&url)
            .query(&[
                ("scroll", self.keep_alive.as_str()),
                ("size", size.as_str()),
            ])
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;
        Self::read_page(response).await
    }

    async fn next_page(&self, cursor: &Cursor) -> Result<Page, SourceError> {
        let url = format!("{}/_search/scroll", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "scroll": self.keep_alive,
                "scroll_id": cursor.as_str(),
            }))
            .send()
            .await?;
        Self::read_page(response).await
    }

    async fn clear_scroll(&self, cursor: &Cursor) {
        let url = format!("{}/_search/scroll", self.base_url);
        let result = self
            .client
            .delete(&url)
            .json(&serde_json::json!({ "scroll_id": [cursor.as_str()] }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => debug!("SOURCE | Clearing scroll returned {}", response.status()),
            Err(e) => debug!("SOURCE | Could not clear scroll: {e}"),
        }
    }
}
