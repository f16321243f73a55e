//! Per-connection distributed lock
//!
//! A named, TTL-bound mutex. `acquire` never waits: it either returns a
//! token or `None` when someone else holds the name. `release` only deletes
//! the lock if the caller still owns it, so a holder whose TTL lapsed cannot
//! free a lock that has since been taken over.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::job_state::StoreError;

pub mod memory;
pub mod redis;

pub use memory::InMemoryLock;
pub use self::redis::RedisLock;

/// Proof of ownership returned by a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lock name scoping every pipeline step of one connection.
pub fn connection_lock_name(connection_id: Uuid) -> String {
    format!("scrape-lock:{connection_id}")
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError>;

    /// Returns whether the lock was actually released by this call.
    async fn release(&self, name: &str, token: &LockToken) -> Result<bool, StoreError>;
}
