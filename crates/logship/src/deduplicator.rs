// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Second pipeline stage: forwards each distinct record once.

use crate::errors::PipelineError;
use crate::filter::{BloomFilter, Fingerprint};
use crate::Record;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Deduplicator {
    filter: BloomFilter,
    source: Receiver<Record>,
    destination: Sender<Record>,
    capacity: usize,
    warned: bool,
}

impl Deduplicator {
    /// `capacity` and `false_positive_rate` size the filter. Both are fixed for the
    /// lifetime of the deduplicator.
    #[must_use]
    pub fn new(
        source: Receiver<Record>,
        destination: Sender<Record>,
        capacity: usize,
        false_positive_rate: f64,
    ) -> Self {
        let filter = BloomFilter::with_rate(capacity, false_positive_rate);
        debug!(
            "DEDUPLICATOR | Filter sized for {capacity} records: {} bits, {} hashes, {} bytes",
            filter.num_bits(),
            filter.num_hashes(),
            filter.memory_usage()
        );
        Self {
            filter,
            source,
            destination,
            capacity,
            warned: false,
        }
    }

    /// Forwards `record` to queue B unless it was seen before. Returns whether it was
    /// forwarded.
    ///
    /// The fingerprint is only recorded once the record is in queue B, so a record
    /// whose send never completed is not considered seen.
    pub async fn process(&mut self, record: Record) -> Result<bool, PipelineError> {
        let fingerprint = Fingerprint::of(&record);
        if self.filter.contains(&fingerprint) {
            info!("DEDUPLICATOR | Deduplicated a log");
            return Ok(false);
        }

        self.destination
            .send(record)
            .await
            .map_err(|_| PipelineError::QueueClosed("B"))?;
        self.filter.insert(&fingerprint);

        if !self.warned && self.filter.len() > self.capacity {
            self.warned = true;
            warn!(
                "DEDUPLICATOR | Seen more than {} distinct records, estimated false positive rate is now {:.4}",
                self.capacity,
                self.filter.estimated_false_positive_rate()
            );
        }
        Ok(true)
    }

    /// Processes records from queue A until cancelled or queue A is closed.
    pub async fn run(mut self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        info!("DEDUPLICATOR | Start");
        loop {
            let record = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                record = self.source.recv() => match record {
                    Some(record) => record,
                    None => {
                        debug!("DEDUPLICATOR | Queue A closed");
                        break;
                    }
                },
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.process(record) => {
                    result?;
                }
            }
        }
        info!("DEDUPLICATOR | Stopping");
        Ok(())
    }

    #[must_use]
    pub fn filter(&self) -> &BloomFilter {
        &self.filter
    }
}
