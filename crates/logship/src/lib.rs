// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logship
//!
//! Continuously copies log records from an Elasticsearch compatible search API into a
//! Splunk style HTTP event collector.
//!
//! ## Architecture
//!
//! Three workers run concurrently, connected by two bounded queues:
//! - [`collector`]: polls the source on a fixed cadence and pages through every hit
//! - [`deduplicator`]: drops records whose exact bytes were already forwarded
//! - [`shipper`]: wraps each record in a delivery envelope and posts it to the sink
//!
//! [`pipeline::Pipeline`] wires the workers together and stops all of them as soon as
//! one exits. Network operations share the backoff in [`retry`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod collector;
pub mod config;
pub mod deduplicator;
pub mod errors;
pub mod filter;
pub mod http;
pub mod pipeline;
pub mod retry;
pub mod shipper;
pub mod source;

/// One log document, exactly as the source returned it.
pub type Record = bytes::Bytes;
