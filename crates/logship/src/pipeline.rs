// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Supervisor for the three workers.
//!
//! Workers never terminate the process themselves. Each one reports how it stopped
//! through its task result; the first worker to stop cancels the others, and the first
//! error observed is returned to the caller.

use crate::collector::Collector;
use crate::config::Config;
use crate::deduplicator::Deduplicator;
use crate::errors::{ConfigError, PipelineError};
use crate::shipper::{HecSink, Shipper, Sink};
use crate::source::{ElasticsearchSource, Source};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct Pipeline {
    config: Arc<Config>,
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
}

impl Pipeline {
    /// Validates `config` and builds the HTTP source and sink from it.
    pub fn new(config: Arc<Config>) -> Result<Self, ConfigError> {
        config.validate()?;
        let source = Arc::new(ElasticsearchSource::new(&config));
        let sink = Arc::new(HecSink::new(&config));
        Ok(Self::with_components(config, source, sink))
    }

    #[must_use]
    pub fn with_components(config: Arc<Config>, source: Arc<dyn Source>, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            source,
            sink,
        }
    }

    /// Runs until `cancel` fires or a worker stops.
    ///
    /// Returns `Ok(())` after a cooperative shutdown and the first fatal error
    /// otherwise. `cancel` itself is never cancelled by the pipeline.
    pub async fn run(self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let cancel = cancel.child_token();
        let (queue_a, collected) = mpsc::channel(self.config.queue_capacity);
        let (queue_b, deduplicated) = mpsc::channel(self.config.queue_capacity);

        let collector = Collector::new(self.source, queue_a, Arc::clone(&self.config));
        let deduplicator = Deduplicator::new(
            collected,
            queue_b,
            self.config.dedup_capacity,
            self.config.dedup_false_positive_rate,
        );
        let shipper = Shipper::new(self.sink, deduplicated, &self.config);

        info!(
            "PIPELINE | Polling every {}s, queue capacity {}",
            self.config.search_cadence_secs, self.config.queue_capacity
        );

        let mut workers = JoinSet::new();
        let token = cancel.clone();
        workers.spawn(async move { ("collector", collector.run(&token).await) });
        let token = cancel.clone();
        workers.spawn(async move { ("deduplicator", deduplicator.run(&token).await) });
        let token = cancel.clone();
        workers.spawn(async move { ("shipper", shipper.run(&token).await) });

        let mut outcome = Ok(());
        while let Some(joined) = workers.join_next().await {
            if !cancel.is_cancelled() {
                debug!("PIPELINE | First worker stopped, cancelling the others");
                cancel.cancel();
            }
            let result = match joined {
                Ok((worker, result)) => {
                    debug!("PIPELINE | {worker} stopped");
                    result
                }
                Err(e) => Err(PipelineError::Join(e.to_string())),
            };
            if let Err(e) = result {
                if outcome.is_ok() {
                    error!("PIPELINE | Stopping after fatal error: {e}");
                    outcome = Err(e);
                }
            }
        }

        if outcome.is_ok() {
            info!("PIPELINE | Shut down");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ShipError, SourceError};
    use crate::http::SourceAuth;
    use crate::retry::RetryPolicy;
    use crate::source::{Cursor, Page};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    struct UnreachableSource {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Source for UnreachableSource {
        async fn open_scroll(&self, _query: &str, _page_size: usize) -> Result<Page, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Status {
                status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                body: String::new(),
            })
        }

        async fn next_page(&self, _cursor: &Cursor) -> Result<Page, SourceError> {
            Ok(Page::default())
        }

        async fn clear_scroll(&self, _cursor: &Cursor) {}
    }

    /// Returns the same single hit on every cycle.
    struct RepeatingSource;

    #[async_trait]
    impl Source for RepeatingSource {
        async fn open_scroll(&self, _query: &str, _page_size: usize) -> Result<Page, SourceError> {
            Ok(Page {
                cursor: Some(Cursor::new("c")),
                total_hits: 1,
                hits: vec![Bytes::from_static(br#"{"msg":"same"}"#)],
            })
        }

        async fn next_page(&self, _cursor: &Cursor) -> Result<Page, SourceError> {
            Ok(Page::default())
        }

        async fn clear_scroll(&self, _cursor: &Cursor) {}
    }

    #[derive(Default)]
    struct RecordingSink {
        bodies: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn send(&self, body: Bytes) -> Result<(), ShipError> {
            self.bodies.lock().unwrap().push(body);
            Ok(())
        }
    }

    fn config() -> Arc<Config> {
        Arc::new(Config {
            source_url: "http://127.0.0.1:9200".to_string(),
            source_auth: SourceAuth::ApiKey("key".to_string()),
            sink_url: "http://127.0.0.1:8088/services/collector/event".to_string(),
            sink_key: "token".to_string(),
            search_json: r#"{"match_all":{}}"#.to_string(),
            search_cadence_secs: 1,
            retry: RetryPolicy::exponential(Duration::from_millis(10), 10),
            ..Default::default()
        })
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = Arc::new(Config {
            search_json: "not json".to_string(),
            ..(*config()).clone()
        });
        assert!(matches!(
            Pipeline::new(config),
            Err(ConfigError::Invalid { name: "SEARCH_JSON", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_source_is_fatal() {
        let source = Arc::new(UnreachableSource {
            calls: AtomicU32::new(0),
        });
        let pipeline = Pipeline::with_components(
            config(),
            source.clone(),
            Arc::new(RecordingSink::default()),
        );

        let result = pipeline.run(&CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(PipelineError::CollectorExhausted { attempts: 11, .. })
        ));
        assert_eq!(source.calls.load(Ordering::SeqCst), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_record_is_shipped_once_then_cancelled() {
        let sink = Arc::new(RecordingSink::default());
        let pipeline =
            Pipeline::with_components(config(), Arc::new(RepeatingSource), sink.clone());
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { pipeline.run(&cancel).await }
        });
        // three ticks at a one second cadence
        tokio::time::sleep(Duration::from_millis(3500)).await;
        cancel.cancel();

        assert!(handle.await.unwrap().is_ok());
        let bodies = sink.bodies.lock().unwrap();
        assert_eq!(bodies.len(), 1);
        assert_eq!(
            bodies[0],
            Bytes::from_static(br#"{"source": "logit-to-splunk", "event": {"msg":"same"}}"#)
        );
    }
}
