// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the pipeline.
//!
//! Per-cycle and per-record failures ([`SourceError`], [`ShipError`]) stay inside their
//! retry wrapper. Only exhaustion escalates into a [`PipelineError`], which is fatal for
//! the whole process.

use reqwest::StatusCode;

/// Missing or contradictory settings detected before any worker starts.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("you must supply {key} or {username}")]
    MissingSourceCredentials {
        key: &'static str,
        username: &'static str,
    },

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Failures while polling the search source. Every variant is retried.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request to source failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("source returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("could not decode source response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("queue A closed while collecting")]
    QueueClosed,
}

/// Failures while delivering a record to the sink. Every variant is retried.
#[derive(Debug, thiserror::Error)]
pub enum ShipError {
    #[error("request to sink failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("sink returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("sink key could not be resolved")]
    MissingKey,

    #[error("sink credentials are not a valid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
}

/// Fatal conditions reported by a worker to the supervising [`crate::pipeline::Pipeline`].
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("collector gave up after {attempts} attempts: {source}")]
    CollectorExhausted {
        attempts: u32,
        #[source]
        source: SourceError,
    },

    #[error("shipper gave up after {attempts} attempts: {source}")]
    ShipperExhausted {
        attempts: u32,
        #[source]
        source: ShipError,
    },

    #[error("{0} queue closed unexpectedly")]
    QueueClosed(&'static str),

    #[error("worker task failed: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::MissingSourceCredentials {
            key: "LOGIT_ES_KEY",
            username: "LOGIT_ES_USERNAME",
        };
        assert_eq!(
            error.to_string(),
            "you must supply LOGIT_ES_KEY or LOGIT_ES_USERNAME"
        );
    }

    #[test]
    fn test_pipeline_error_keeps_cause() {
        let error = PipelineError::ShipperExhausted {
            attempts: 11,
            source: ShipError::Status {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".to_string(),
            },
        };
        let text = error.to_string();
        assert!(text.contains("11 attempts"));
        assert!(text.contains("500"));
        assert!(std::error::Error::source(&error).is_some());
    }
}
