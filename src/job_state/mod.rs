//! Job-scoped state store
//!
//! Scalar and list state keyed by `(job id, StoreKey)`. Every key carries a
//! TTL that is refreshed on write and on [`JobStateStore::bump`], so a job
//! that stops making progress cleans itself up.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod memory;
pub mod redis;

pub use memory::InMemoryJobStore;
pub use self::redis::RedisJobStore;

/// Errors surfaced by the state store and the lock backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("key {key} holds a {found}, expected a {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("stored value for {key} is not valid JSON: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Opaque identifier of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Namespace holding per-connection pointers rather than run state.
    pub fn connection_anchor(connection_id: Uuid) -> Self {
        Self(format!("connection:{connection_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured local key: a namespace (normally the stage name) plus an
/// optional sub-identifier. Serialized as a JSON pair so no combination of
/// names can collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    pub stage: String,
    pub sub_id: Option<String>,
}

impl StoreKey {
    pub fn new(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            sub_id: None,
        }
    }

    pub fn sub(stage: impl Into<String>, sub_id: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            sub_id: Some(sub_id.into()),
        }
    }

    /// Current stage name of a job.
    pub fn stage_pointer() -> Self {
        Self::new("$stage")
    }

    /// List of every key a job has written.
    pub fn manifest() -> Self {
        Self::new("$manifest")
    }

    /// How a job ended; written after its state is cleared and left to expire.
    pub fn finished() -> Self {
        Self::new("$finished")
    }

    /// Job id currently in flight for a connection (stored under its anchor).
    pub fn active_job() -> Self {
        Self::new("$active_job")
    }

    pub fn encode(&self) -> String {
        match &self.sub_id {
            Some(sub) => serde_json::json!([self.stage, sub]).to_string(),
            None => serde_json::json!([self.stage]).to_string(),
        }
    }

    pub fn decode(encoded: &str) -> Option<Self> {
        let parts: Vec<String> = serde_json::from_str(encoded).ok()?;
        match parts.as_slice() {
            [stage] => Some(Self::new(stage.clone())),
            [stage, sub] => Some(Self::sub(stage.clone(), sub.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sub_id {
            Some(sub) => write!(f, "{}/{}", self.stage, sub),
            None => f.write_str(&self.stage),
        }
    }
}

/// Physical key used by backends.
pub(crate) fn physical_key(prefix: &str, job: &JobId, key: &StoreKey) -> String {
    format!("{prefix}:{}:{}", job.as_str(), key.encode())
}

#[async_trait]
pub trait JobStateStore: Send + Sync {
    async fn get(&self, job: &JobId, key: &StoreKey) -> Result<Option<String>, StoreError>;

    async fn set(&self, job: &JobId, key: &StoreKey, value: &str) -> Result<(), StoreError>;

    /// Refresh the key's expiry without touching its value.
    async fn bump(&self, job: &JobId, key: &StoreKey) -> Result<(), StoreError>;

    /// Refresh the expiry of several keys at once.
    async fn bump_many(&self, job: &JobId, keys: &[StoreKey]) -> Result<(), StoreError> {
        for key in keys {
            self.bump(job, key).await?;
        }
        Ok(())
    }

    async fn rpush(&self, job: &JobId, key: &StoreKey, values: &[String])
    -> Result<(), StoreError>;

    async fn lpop(&self, job: &JobId, key: &StoreKey) -> Result<Option<String>, StoreError>;

    async fn lvalues(&self, job: &JobId, key: &StoreKey) -> Result<Vec<String>, StoreError>;

    async fn del(&self, job: &JobId, key: &StoreKey) -> Result<(), StoreError>;
}

/// A store handle bound to one job.
///
/// Writes go through a manifest: the key is recorded before its data is
/// written, so a crash between the two never leaves untracked state. The
/// driver uses the manifest to bump and finally delete everything the run
/// touched.
pub struct JobScope<'a> {
    store: &'a dyn JobStateStore,
    job_id: &'a JobId,
    known: Mutex<Option<BTreeSet<StoreKey>>>,
}

impl<'a> JobScope<'a> {
    pub fn new(store: &'a dyn JobStateStore, job_id: &'a JobId) -> Self {
        Self {
            store,
            job_id,
            known: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &JobId {
        self.job_id
    }

    pub async fn get(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        self.store.get(self.job_id, key).await
    }

    pub async fn set(&self, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        self.track(key).await?;
        self.store.set(self.job_id, key, value).await
    }

    pub async fn rpush(&self, key: &StoreKey, values: &[String]) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        self.track(key).await?;
        self.store.rpush(self.job_id, key, values).await
    }

    pub async fn lpop(&self, key: &StoreKey) -> Result<Option<String>, StoreError> {
        self.store.lpop(self.job_id, key).await
    }

    pub async fn lvalues(&self, key: &StoreKey) -> Result<Vec<String>, StoreError> {
        self.store.lvalues(self.job_id, key).await
    }

    pub async fn del(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.store.del(self.job_id, key).await
    }

    /// Append JSON records to a list.
    pub async fn push_json<T: Serialize>(
        &self,
        key: &StoreKey,
        items: &[T],
    ) -> Result<(), StoreError> {
        let encoded = items
            .iter()
            .map(|item| {
                serde_json::to_string(item).map_err(|source| StoreError::Encode {
                    key: key.to_string(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.rpush(key, &encoded).await
    }

    /// Read a whole list back as JSON records.
    pub async fn list_json<T: DeserializeOwned>(&self, key: &StoreKey) -> Result<Vec<T>, StoreError> {
        self.lvalues(key)
            .await?
            .iter()
            .map(|raw| {
                serde_json::from_str(raw).map_err(|source| StoreError::Decode {
                    key: key.to_string(),
                    source,
                })
            })
            .collect()
    }

    /// Keys recorded in this job's manifest, in first-write order, without duplicates.
    pub async fn keys(&self) -> Result<Vec<StoreKey>, StoreError> {
        let mut seen = BTreeSet::new();
        Ok(self
            .store
            .lvalues(self.job_id, &StoreKey::manifest())
            .await?
            .iter()
            .filter_map(|raw| StoreKey::decode(raw))
            .filter(|key| seen.insert(key.clone()))
            .collect())
    }

    /// Refresh the TTL of every key the job has written.
    pub async fn bump_all(&self) -> Result<(), StoreError> {
        let mut keys = self.keys().await?;
        keys.push(StoreKey::manifest());
        self.store.bump_many(self.job_id, &keys).await
    }

    /// Delete every key the job has written, then the manifest itself.
    pub async fn clear(&self) -> Result<(), StoreError> {
        for key in self.keys().await? {
            self.store.del(self.job_id, &key).await?;
        }
        self.store.del(self.job_id, &StoreKey::manifest()).await?;
        *self.known.lock().await = Some(BTreeSet::new());
        Ok(())
    }

    /// Clear the job and leave a marker recording how it ended.
    ///
    /// The marker is not in the manifest, so it outlives [`JobScope::clear`]
    /// and expires with the store TTL. A redelivered task for the same job
    /// sees it and is dropped instead of starting the run over.
    pub async fn finish(&self, outcome: &str) -> Result<(), StoreError> {
        self.clear().await?;
        self.store
            .set(self.job_id, &StoreKey::finished(), outcome)
            .await
    }

    /// How the job ended, if it already did.
    pub async fn finished(&self) -> Result<Option<String>, StoreError> {
        self.store.get(self.job_id, &StoreKey::finished()).await
    }

    async fn track(&self, key: &StoreKey) -> Result<(), StoreError> {
        let mut guard = self.known.lock().await;
        let mut known = match guard.take() {
            Some(known) => known,
            None => self.keys().await?.into_iter().collect(),
        };
        if !known.contains(key) {
            self.store
                .rpush(self.job_id, &StoreKey::manifest(), &[key.encode()])
                .await?;
            known.insert(key.clone());
        }
        *guard = Some(known);
        Ok(())
    }
}
