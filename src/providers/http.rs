//! Shared HTTP plumbing for provider stage machines
//!
//! Providers build their own requests (auth scheme, query, body) and hand
//! them to [`ProviderClient::send`], which classifies the response status
//! into the pipeline's error taxonomy. Only 2xx responses come back as
//! [`ProviderResponse`]; a 202 is returned as-is so the caller can decide it
//! means "not ready".

use std::time::Duration;

use reqwest::header::{HeaderMap, LINK, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use super::Provider;
use crate::config::ProvidersConfig;
use crate::error::ScrapeError;

#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
}

impl ProviderClient {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn from_config(config: &ProvidersConfig) -> Result<Self, reqwest::Error> {
        Self::new(
            &config.http_user_agent,
            Duration::from_secs(config.http_timeout_seconds),
        )
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.request(Method::POST, url)
    }

    /// Send the request and map non-success statuses onto [`ScrapeError`].
    pub async fn send(
        &self,
        provider: Provider,
        request: RequestBuilder,
    ) -> Result<ProviderResponse, ScrapeError> {
        let response = request
            .send()
            .await
            .map_err(|source| ScrapeError::Network { provider, source })?;

        let status = response.status();
        let path = response.url().path().to_string();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|source| ScrapeError::Network { provider, source })?;

        if status.is_success() {
            return Ok(ProviderResponse {
                provider,
                status,
                headers,
                body,
            });
        }

        Err(classify_failure(provider, status, &headers, path, body))
    }
}

fn classify_failure(
    provider: Provider,
    status: StatusCode,
    headers: &HeaderMap,
    path: String,
    body: String,
) -> ScrapeError {
    let retry_after_secs = header_str(headers, RETRY_AFTER.as_str()).and_then(|v| v.parse().ok());
    let quota_exhausted =
        header_str(headers, "x-ratelimit-remaining").is_some_and(|remaining| remaining == "0");

    match status {
        StatusCode::TOO_MANY_REQUESTS => ScrapeError::RateLimited {
            provider,
            retry_after_secs,
        },
        StatusCode::FORBIDDEN if quota_exhausted => ScrapeError::RateLimited {
            provider,
            retry_after_secs,
        },
        StatusCode::NOT_FOUND => ScrapeError::NotFound {
            provider,
            resource: path,
        },
        _ => ScrapeError::upstream(provider, status.as_u16(), Some(body)),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// A successful (2xx) provider response with its body read into memory.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    provider: Provider,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl ProviderResponse {
    pub fn is_accepted(&self) -> bool {
        self.status == StatusCode::ACCEPTED
    }

    pub fn is_empty(&self) -> bool {
        self.status == StatusCode::NO_CONTENT || self.body.trim().is_empty()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ScrapeError> {
        serde_json::from_str(&self.body).map_err(|err| {
            ScrapeError::malformed(self.provider, format!("unexpected body shape: {err}"))
        })
    }

    /// `rel="next"` target of the `Link` header, if any.
    pub fn next_link(&self) -> Option<String> {
        header_str(&self.headers, LINK.as_str()).and_then(parse_link_header)
    }
}

/// Extract the `rel="next"` URL from an RFC 8288 `Link` header.
pub fn parse_link_header(link_header: &str) -> Option<String> {
    for link in link_header.split(',') {
        let mut parts = link.split(';');
        let Some(url_part) = parts.next().map(str::trim) else {
            continue;
        };
        let is_next = parts.any(|param| {
            let param = param.trim().replace(' ', "");
            param == "rel=\"next\"" || param == "rel=next"
        });
        if is_next
            && let Some(start) = url_part.find('<')
            && let Some(end) = url_part.find('>')
            && start < end
        {
            return Some(url_part[start + 1..end].to_string());
        }
    }
    None
}
