// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Immutable pipeline configuration, built once at startup and shared as `Arc<Config>`.

use crate::errors::ConfigError;
use crate::filter;
use crate::http::SourceAuth;
use crate::retry::RetryPolicy;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const SOURCE_URL: &str = "LOGIT_ES_URL";
pub const SOURCE_KEY: &str = "LOGIT_ES_KEY";
pub const SOURCE_USERNAME: &str = "LOGIT_ES_USERNAME";
pub const SOURCE_PASSWORD: &str = "LOGIT_ES_PASSWORD";
pub const SINK_URL: &str = "SPLUNK_URL";
pub const SINK_KEY: &str = "SPLUNK_KEY";
pub const SINK_AUTH_SCHEME: &str = "SPLUNK_AUTH_SCHEME";
pub const SEARCH_JSON: &str = "SEARCH_JSON";
pub const SEARCH_CADENCE: &str = "SEARCH_CADENCE";
pub const SOURCE_TAG: &str = "LOGSHIP_SOURCE_TAG";
pub const SCROLL_KEEP_ALIVE: &str = "LOGSHIP_SCROLL_KEEP_ALIVE";
pub const QUEUE_CAPACITY: &str = "LOGSHIP_QUEUE_CAPACITY";
pub const DEDUP_CAPACITY: &str = "LOGSHIP_DEDUP_CAPACITY";
pub const DEDUP_FALSE_POSITIVE_RATE: &str = "LOGSHIP_DEDUP_FALSE_POSITIVE_RATE";
pub const HTTP_TIMEOUT: &str = "LOGSHIP_HTTP_TIMEOUT";
pub const PROXY_HTTPS: &str = "LOGSHIP_PROXY_HTTPS";

const DEFAULT_SINK_AUTH_SCHEME: &str = "Splunk";
const DEFAULT_SOURCE_TAG: &str = "logit-to-splunk";
const DEFAULT_SEARCH_CADENCE_SECS: u64 = 15;
const DEFAULT_SCROLL_KEEP_ALIVE: &str = "5m";
const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_DEDUP_CAPACITY: usize = 100_000;
const DEFAULT_DEDUP_FALSE_POSITIVE_RATE: f64 = 0.001;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, PartialEq)]
pub struct Config {
    /// Base URL of the Elasticsearch compatible search API.
    pub source_url: String,
    pub source_auth: SourceAuth,
    /// Full URL of the HTTP event collector endpoint.
    pub sink_url: String,
    pub sink_key: String,
    /// Scheme placed before the key in the `Authorization` header.
    pub sink_auth_scheme: String,
    /// Value of the `source` field of every delivery envelope.
    pub source_tag: String,
    /// Raw query clause sent on every cycle.
    pub search_json: String,
    /// How often to poll the source, in seconds
    pub search_cadence_secs: u64,
    pub scroll_keep_alive: String,
    /// Capacity of each of the two queues between the workers.
    pub queue_capacity: usize,
    /// Number of distinct records the dedup filter is sized for.
    pub dedup_capacity: usize,
    pub dedup_false_positive_rate: f64,
    pub http_timeout_secs: u64,
    pub https_proxy: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            source_auth: SourceAuth::ApiKey(String::new()),
            sink_url: String::new(),
            sink_key: String::new(),
            sink_auth_scheme: DEFAULT_SINK_AUTH_SCHEME.to_string(),
            source_tag: DEFAULT_SOURCE_TAG.to_string(),
            search_json: String::new(),
            search_cadence_secs: DEFAULT_SEARCH_CADENCE_SECS,
            scroll_keep_alive: DEFAULT_SCROLL_KEEP_ALIVE.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            dedup_false_positive_rate: DEFAULT_DEDUP_FALSE_POSITIVE_RATE,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            https_proxy: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("source_url", &self.source_url)
            .field("source_auth", &self.source_auth)
            .field("sink_url", &self.sink_url)
            .field("sink_key", &"<redacted>")
            .field("sink_auth_scheme", &self.sink_auth_scheme)
            .field("source_tag", &self.source_tag)
            .field("search_json", &self.search_json)
            .field("search_cadence_secs", &self.search_cadence_secs)
            .field("scroll_keep_alive", &self.scroll_keep_alive)
            .field("queue_capacity", &self.queue_capacity)
            .field("dedup_capacity", &self.dedup_capacity)
            .field("dedup_false_positive_rate", &self.dedup_false_positive_rate)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("https_proxy", &self.https_proxy)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let required = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let source_url = required(SOURCE_URL)?;
        let sink_url = required(SINK_URL)?;
        let sink_key = required(SINK_KEY)?;
        let search_json = required(SEARCH_JSON)?;

        // The API key wins when both credential kinds are configured.
        let source_auth = match (get(SOURCE_KEY), get(SOURCE_USERNAME)) {
            (Some(key), _) => SourceAuth::ApiKey(key),
            (None, Some(username)) => SourceAuth::Basic {
                username,
                password: lookup(SOURCE_PASSWORD).unwrap_or_default(),
            },
            (None, None) => {
                return Err(ConfigError::MissingSourceCredentials {
                    key: SOURCE_KEY,
                    username: SOURCE_USERNAME,
                })
            }
        };

        let config = Config {
            source_url,
            source_auth,
            sink_url,
            sink_key,
            sink_auth_scheme: get(SINK_AUTH_SCHEME)
                .unwrap_or_else(|| DEFAULT_SINK_AUTH_SCHEME.to_string()),
            source_tag: get(SOURCE_TAG).unwrap_or_else(|| DEFAULT_SOURCE_TAG.to_string()),
            search_json,
            search_cadence_secs: parse_or(&get, SEARCH_CADENCE, DEFAULT_SEARCH_CADENCE_SECS)?,
            scroll_keep_alive: get(SCROLL_KEEP_ALIVE)
                .unwrap_or_else(|| DEFAULT_SCROLL_KEEP_ALIVE.to_string()),
            queue_capacity: parse_or(&get, QUEUE_CAPACITY, DEFAULT_QUEUE_CAPACITY)?,
            dedup_capacity: parse_or(&get, DEDUP_CAPACITY, DEFAULT_DEDUP_CAPACITY)?,
            dedup_false_positive_rate: parse_or(
                &get,
                DEDUP_FALSE_POSITIVE_RATE,
                DEFAULT_DEDUP_FALSE_POSITIVE_RATE,
            )?,
            http_timeout_secs: parse_or(&get, HTTP_TIMEOUT, DEFAULT_HTTP_TIMEOUT_SECS)?,
            https_proxy: get(PROXY_HTTPS).or_else(|| get("HTTPS_PROXY")),
            retry: RetryPolicy::default(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks every rule a worker relies on. Called by [`Config::from_lookup`] and
    /// again by the pipeline for configurations built by hand.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(SOURCE_URL, &self.source_url)?;
        validate_url(SINK_URL, &self.sink_url)?;

        if self.sink_key.trim().is_empty() {
            return Err(ConfigError::Missing(SINK_KEY));
        }

        let has_credentials = match &self.source_auth {
            SourceAuth::ApiKey(key) => !key.trim().is_empty(),
            SourceAuth::Basic { username, .. } => !username.trim().is_empty(),
        };
        if !has_credentials {
            return Err(ConfigError::MissingSourceCredentials {
                key: SOURCE_KEY,
                username: SOURCE_USERNAME,
            });
        }

        if self.search_json.trim().is_empty() {
            return Err(ConfigError::Missing(SEARCH_JSON));
        }
        serde_json::from_str::<serde::de::IgnoredAny>(&self.search_json).map_err(|e| {
            ConfigError::Invalid {
                name: SEARCH_JSON,
                reason: e.to_string(),
            }
        })?;

        if self.search_cadence_secs == 0 {
            return Err(invalid(SEARCH_CADENCE, "must be a positive number of seconds"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid(QUEUE_CAPACITY, "must be greater than zero"));
        }
        if self.dedup_capacity == 0 {
            return Err(invalid(DEDUP_CAPACITY, "must be greater than zero"));
        }
        let rate = self.dedup_false_positive_rate;
        if !(rate > 0.0 && rate < 1.0) {
            return Err(invalid(
                DEDUP_FALSE_POSITIVE_RATE,
                "must be strictly between 0 and 1",
            ));
        }
        if filter::optimal_num_bits(self.dedup_capacity, rate).is_none() {
            return Err(invalid(
                DEDUP_CAPACITY,
                "needs a filter larger than 1 GiB at the configured false positive rate",
            ));
        }
        if self.http_timeout_secs == 0 {
            return Err(invalid(HTTP_TIMEOUT, "must be greater than zero"));
        }
        Ok(())
    }

    #[must_use]
    pub fn search_cadence(&self) -> Duration {
        Duration::from_secs(self.search_cadence_secs)
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            name,
            reason: format!("{raw:?}: {e}"),
        }),
    }
}

fn validate_url(name: &'static str, url: &str) -> Result<(), ConfigError> {
    if url.trim().is_empty() {
        return Err(ConfigError::Missing(name));
    }
    reqwest::Url::parse(url).map_err(|e| ConfigError::Invalid {
        name,
        reason: e.to_string(),
    })?;
    Ok(())
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}
