// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction and source credential injection.
//!
//! Credentials for the search source are applied by [`AuthorizedClient`], which wraps
//! every outgoing request with the configured [`SourceAuth`]. The source client never
//! touches headers itself.

use core::time::Duration;
use reqwest::{Client, Method, RequestBuilder};
use std::fmt;
use tracing::error;

/// Header carrying the source API key.
pub const API_KEY_HEADER: &str = "Apikey";

/// Credentials sent with every request to the search source.
#[derive(Clone, PartialEq, Eq)]
pub enum SourceAuth {
    ApiKey(String),
    Basic { username: String, password: String },
}

impl fmt::Debug for SourceAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "ApiKey(<redacted>)"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
        }
    }
}

/// Request interceptor applying [`SourceAuth`].
pub trait Authorize {
    #[must_use]
    fn authorize(self, auth: &SourceAuth) -> Self;
}

impl Authorize for RequestBuilder {
    fn authorize(self, auth: &SourceAuth) -> Self {
        match auth {
            SourceAuth::ApiKey(key) => self.header(API_KEY_HEADER, key),
            SourceAuth::Basic { username, password } => self.basic_auth(username, Some(password)),
        }
    }
}

/// A `reqwest::Client` that authorizes every request it builds.
#[derive(Debug, Clone)]
pub struct AuthorizedClient {
    client: Client,
    auth: SourceAuth,
}

impl AuthorizedClient {
    #[must_use]
    pub fn new(client: Client, auth: SourceAuth) -> Self {
        Self { client, auth }
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).authorize(&self.auth)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }
}

/// Builds the shared HTTP client.
///
/// An unparseable proxy is logged and ignored rather than failing startup, so the
/// pipeline falls back to a direct connection.
#[must_use]
pub fn get_client(https_proxy: Option<&str>, timeout: Duration) -> Client {
    match build_client(https_proxy, timeout) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(None, timeout) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    Client::new()
                }
            }
        }
    }
}

pub fn build_client(
    https_proxy: Option<&str>,
    timeout: Duration,
) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if let Some(proxy) = https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_header_only() {
        let client = AuthorizedClient::new(Client::new(), SourceAuth::ApiKey("secret".into()));

        let request = client.post("https://logs.example.com/_search").build().unwrap();

        assert_eq!(request.headers().get(API_KEY_HEADER).unwrap(), "secret");
        assert!(request.headers().get("authorization").is_none());
    }

    #[test]
    fn test_basic_auth_header_only() {
        let client = AuthorizedClient::new(
            Client::new(),
            SourceAuth::Basic {
                username: "user".into(),
                password: "pass".into(),
            },
        );

        let request = client.delete("https://logs.example.com/_search/scroll").build().unwrap();

        // base64("user:pass")
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Basic dXNlcjpwYXNz"
        );
        assert!(request.headers().get(API_KEY_HEADER).is_none());
    }

    #[test]
    fn test_debug_hides_credentials() {
        let printed = format!(
            "{:?} {:?}",
            SourceAuth::ApiKey("k3y".into()),
            SourceAuth::Basic {
                username: "user".into(),
                password: "p4ss".into(),
            }
        );

        assert!(!printed.contains("k3y"));
        assert!(!printed.contains("p4ss"));
        assert!(printed.contains("user"));
    }

    #[test]
    fn test_client_builds_with_and_without_proxy() {
        assert!(build_client(None, Duration::from_secs(1)).is_ok());
        assert!(build_client(Some("http://proxy.example.com:3128"), Duration::from_secs(1)).is_ok());
        let _client = get_client(Some("::not a url::"), Duration::from_secs(1));
    }
}
