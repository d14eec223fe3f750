// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! First pipeline stage: drains the source into queue A on a fixed cadence.
//!
//! Every tick runs one cycle, which re-runs the configured query from scratch and
//! pages through the whole result set. A cycle is retried as a unit; a cycle that
//! keeps failing through the retry policy stops the pipeline. A scroll left open by a
//! cycle interrupted by cancellation is cleared before the collector returns.

use crate::config::Config;
use crate::errors::{PipelineError, SourceError};
use crate::retry::{retry, RetryError};
use crate::source::{Cursor, Page, Source};
use crate::Record;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::Sender;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Hits requested per page.
pub const PAGE_SIZE: usize = 32;

pub struct Collector {
    source: Arc<dyn Source>,
    destination: Sender<Record>,
    config: Arc<Config>,
    /// Cursor of the scroll the current cycle holds open, if any.
    open_scroll: Mutex<Option<Cursor>>,
}

impl Collector {
    #[must_use]
    pub fn new(source: Arc<dyn Source>, destination: Sender<Record>, config: Arc<Config>) -> Self {
        Self {
            source,
            destination,
            config,
            open_scroll: Mutex::new(None),
        }
    }

    /// Runs one cycle per tick until cancelled or a cycle exhausts its retries.
    ///
    /// The first cycle starts one full cadence after startup.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        info!("COLLECTOR | Start");

        let mut ticker = interval(self.config.search_cadence());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // discard first tick, which is instantaneous

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("COLLECTOR | Stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            info!("COLLECTOR | Tick");
            match retry(&self.config.retry, cancel, "COLLECTOR", || self.run_cycle()).await {
                Ok(emitted) => info!("COLLECTOR | Cycle complete, emitted {emitted} records"),
                Err(RetryError::Cancelled { .. }) => {
                    self.release_scroll().await;
                    info!("COLLECTOR | Stopping");
                    return Ok(());
                }
                Err(RetryError::Exhausted { attempts, last }) => {
                    error!("COLLECTOR | Fatal error encountered after {attempts} attempts: {last}");
                    return Err(PipelineError::CollectorExhausted {
                        attempts,
                        source: last,
                    });
                }
            }
        }
    }

    /// Pages through the full result set of the configured query, sending every hit
    /// to queue A in page order. Returns the number of records emitted.
    ///
    /// Stops at the first error without fetching further pages.
    pub async fn run_cycle(&self) -> Result<usize, SourceError> {
        let mut scroll = Scroll::new(
            self.source.as_ref(),
            &self.config.search_json,
            &self.open_scroll,
        );
        let mut emitted = 0;

        loop {
            let page = match scroll.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => return Ok(emitted),
                Err(e) => {
                    debug!("COLLECTOR | Could not search: {e}");
                    return Err(e);
                }
            };

            debug!(
                "COLLECTOR | Found {} results, {} in this page",
                page.total_hits,
                page.hits.len()
            );

            for record in page.hits {
                if self.destination.send(record).await.is_err() {
                    scroll.close().await;
                    return Err(SourceError::QueueClosed);
                }
                emitted += 1;
            }
        }
    }

    /// Clears the scroll of a cycle that was dropped mid-flight.
    async fn release_scroll(&self) {
        let cursor = lock(&self.open_scroll).take();
        if let Some(cursor) = cursor {
            debug!("COLLECTOR | Clearing scroll left open by an interrupted cycle");
            self.source.clear_scroll(&cursor).await;
        }
    }
}

fn lock(slot: &Mutex<Option<Cursor>>) -> MutexGuard<'_, Option<Cursor>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pagination session for a single cycle.
///
/// The cursor lives in a slot owned by the collector, so it can still be cleared when
/// the session itself is dropped before reaching `close`.
struct Scroll<'a> {
    source: &'a dyn Source,
    query: &'a str,
    cursor: &'a Mutex<Option<Cursor>>,
    state: ScrollState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScrollState {
    NotStarted,
    Open,
    Done,
}

impl<'a> Scroll<'a> {
    fn new(source: &'a dyn Source, query: &'a str, cursor: &'a Mutex<Option<Cursor>>) -> Self {
        Self {
            source,
            query,
            cursor,
            state: ScrollState::NotStarted,
        }
    }

    /// Next non-empty page, or `None` once the source signals exhaustion.
    async fn next_page(&mut self) -> Result<Option<Page>, SourceError> {
        let cursor = lock(self.cursor).clone();
        let result = match (self.state, cursor) {
            (ScrollState::NotStarted, _) => self.source.open_scroll(self.query, PAGE_SIZE).await,
            (ScrollState::Open, Some(cursor)) => self.source.next_page(&cursor).await,
            (ScrollState::Open, None) | (ScrollState::Done, _) => return Ok(None),
        };

        match result {
            Ok(page) => {
                self.state = ScrollState::Open;
                if let Some(cursor) = page.cursor.clone() {
                    *lock(self.cursor) = Some(cursor);
                }
                if page.is_exhausted() {
                    self.close().await;
                    return Ok(None);
                }
                Ok(Some(page))
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        self.state = ScrollState::Done;
        let cursor = lock(self.cursor).take();
        if let Some(cursor) = cursor {
            self.source.clear_scroll(&cursor).await;
        }
    }
}
