//! # Error Handling
//!
//! Error taxonomy for a single pipeline step and the policy that decides what
//! a failure means for the connection that produced it.

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::job_state::StoreError;
use crate::providers::{Provider, UnknownProvider};
use crate::queue::QueueError;

/// Maximum number of characters kept from an upstream error body.
const BODY_SNIPPET_CHARS: usize = 200;

/// Errors raised while executing one stage step.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("job state store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("{provider} rate limited the request{}", retry_hint(*.retry_after_secs))]
    RateLimited {
        provider: Provider,
        retry_after_secs: Option<u64>,
    },

    #[error("{provider} returned HTTP {status}")]
    Upstream {
        provider: Provider,
        status: u16,
        body_snippet: Option<String>,
    },

    #[error("{provider} resource not found: {resource}")]
    NotFound { provider: Provider, resource: String },

    #[error("{provider} account no longer exists")]
    AccountGone { provider: Provider },

    #[error("malformed {provider} response: {details}")]
    Malformed { provider: Provider, details: String },

    #[error("network error talking to {provider}: {source}")]
    Network {
        provider: Provider,
        #[source]
        source: reqwest::Error,
    },

    #[error("connection {connection_id} has no access token")]
    MissingCredentials { connection_id: Uuid },

    #[error("unknown stage '{stage}' for {provider}")]
    UnknownStage { provider: Provider, stage: String },

    #[error("stage '{stage}' is terminal for {provider} and cannot advance")]
    AdvancePastTerminal { provider: Provider, stage: String },

    #[error("no pipeline registered for {0}")]
    UnregisteredProvider(Provider),

    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),
}

fn retry_hint(retry_after_secs: Option<u64>) -> String {
    retry_after_secs
        .map(|secs| format!(" (retry after {secs}s)"))
        .unwrap_or_default()
}

/// What a failed step means for the connection it ran for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The run failed; bump the connection's consecutive error count.
    CountAgainstConnection,
    /// The upstream account is gone; remove the local connection.
    DeleteConnection,
    /// Infrastructure or internal failure; stop without touching the connection.
    Abort,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::CountAgainstConnection => "count_against_connection",
            Disposition::DeleteConnection => "delete_connection",
            Disposition::Abort => "abort",
        }
    }
}

impl ScrapeError {
    /// Build an upstream HTTP error, keeping a bounded snippet of the body.
    pub fn upstream(provider: Provider, status: u16, body: Option<String>) -> Self {
        ScrapeError::Upstream {
            provider,
            status,
            body_snippet: body.filter(|b| !b.is_empty()).map(truncate_body),
        }
    }

    pub fn malformed(provider: Provider, details: impl Into<String>) -> Self {
        ScrapeError::Malformed {
            provider,
            details: details.into(),
        }
    }

    /// Re-tag a 404 on an account-level resource as a deleted account.
    pub fn account_gone_if_missing(self) -> Self {
        match self {
            ScrapeError::NotFound { provider, .. } => ScrapeError::AccountGone { provider },
            other => other,
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            ScrapeError::AccountGone { .. } => Disposition::DeleteConnection,
            ScrapeError::RateLimited { .. }
            | ScrapeError::Upstream { .. }
            | ScrapeError::NotFound { .. }
            | ScrapeError::Malformed { .. }
            | ScrapeError::Network { .. }
            | ScrapeError::MissingCredentials { .. } => Disposition::CountAgainstConnection,
            ScrapeError::Store(_)
            | ScrapeError::Database(_)
            | ScrapeError::Queue(_)
            | ScrapeError::UnknownStage { .. }
            | ScrapeError::AdvancePastTerminal { .. }
            | ScrapeError::UnregisteredProvider(_)
            | ScrapeError::UnknownProvider(_) => Disposition::Abort,
        }
    }
}

/// Truncate on a character boundary so multi-byte bodies never split.
pub fn truncate_body(body: String) -> String {
    if body.chars().count() > BODY_SNIPPET_CHARS {
        let truncated: String = body.chars().take(BODY_SNIPPET_CHARS).collect();
        format!("{truncated}...")
    } else {
        body
    }
}
