//! In-process state store for tests and single-process local runs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{JobId, JobStateStore, StoreError, StoreKey, physical_key};

const PREFIX: &str = "job";

#[derive(Debug)]
enum Slot {
    Scalar(String),
    List(VecDeque<String>),
}

impl Slot {
    fn kind(&self) -> &'static str {
        match self {
            Slot::Scalar(_) => "scalar",
            Slot::List(_) => "list",
        }
    }
}

#[derive(Debug)]
struct Entry {
    slot: Slot,
    expires_at: Instant,
}

/// Expiring map with the same semantics as the Redis-backed store.
#[derive(Debug)]
pub struct InMemoryJobStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live physical keys, across all jobs.
    pub async fn live_keys(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }
}

fn evict_expired(entries: &mut HashMap<String, Entry>, key: &str) {
    if entries
        .get(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now())
    {
        entries.remove(key);
    }
}

#[async_trait]
impl JobStateStore for InMemoryJobStore {
    async fn get(&self, job: &JobId, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let physical = physical_key(PREFIX, job, key);
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries, &physical);
        match entries.get(&physical) {
            None => Ok(None),
            Some(Entry {
                slot: Slot::Scalar(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(entry) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "scalar",
                found: entry.slot.kind(),
            }),
        }
    }

    async fn set(&self, job: &JobId, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        let physical = physical_key(PREFIX, job, key);
        self.entries.lock().await.insert(
            physical,
            Entry {
                slot: Slot::Scalar(value.to_string()),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn bump(&self, job: &JobId, key: &StoreKey) -> Result<(), StoreError> {
        let physical = physical_key(PREFIX, job, key);
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries, &physical);
        if let Some(entry) = entries.get_mut(&physical) {
            entry.expires_at = Instant::now() + self.ttl;
        }
        Ok(())
    }

    async fn rpush(
        &self,
        job: &JobId,
        key: &StoreKey,
        values: &[String],
    ) -> Result<(), StoreError> {
        if values.is_empty() {
            return Ok(());
        }
        let physical = physical_key(PREFIX, job, key);
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries, &physical);
        let expires_at = Instant::now() + self.ttl;
        let entry = entries.entry(physical).or_insert_with(|| Entry {
            slot: Slot::List(VecDeque::new()),
            expires_at,
        });
        match &mut entry.slot {
            Slot::List(list) => {
                list.extend(values.iter().cloned());
                entry.expires_at = expires_at;
                Ok(())
            }
            other => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "list",
                found: other.kind(),
            }),
        }
    }

    async fn lpop(&self, job: &JobId, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let physical = physical_key(PREFIX, job, key);
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries, &physical);
        let Some(entry) = entries.get_mut(&physical) else {
            return Ok(None);
        };
        let popped = match &mut entry.slot {
            Slot::List(list) => list.pop_front(),
            other => {
                return Err(StoreError::WrongType {
                    key: key.to_string(),
                    expected: "list",
                    found: other.kind(),
                });
            }
        };
        if matches!(&entry.slot, Slot::List(list) if list.is_empty()) {
            entries.remove(&physical);
        }
        Ok(popped)
    }

    async fn lvalues(&self, job: &JobId, key: &StoreKey) -> Result<Vec<String>, StoreError> {
        let physical = physical_key(PREFIX, job, key);
        let mut entries = self.entries.lock().await;
        evict_expired(&mut entries, &physical);
        match entries.get(&physical) {
            None => Ok(Vec::new()),
            Some(Entry {
                slot: Slot::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(entry) => Err(StoreError::WrongType {
                key: key.to_string(),
                expected: "list",
                found: entry.slot.kind(),
            }),
        }
    }

    async fn del(&self, job: &JobId, key: &StoreKey) -> Result<(), StoreError> {
        let physical = physical_key(PREFIX, job, key);
        self.entries.lock().await.remove(&physical);
        Ok(())
    }
}
