use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{DistributedLock, LockToken};
use crate::job_state::StoreError;

const PREFIX: &str = "ingest:lock";

/// Deletes the key only when it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `SET NX PX` lock with a compare-and-delete release.
#[derive(Clone)]
pub struct RedisLock {
    con: ConnectionManager,
}

impl RedisLock {
    pub fn new(con: ConnectionManager) -> Self {
        Self { con }
    }

    fn key(name: &str) -> String {
        format!("{PREFIX}:{name}")
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
        let mut con = self.con.clone();
        let token = LockToken::generate();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::key(name))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut con)
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<bool, StoreError> {
        let mut con = self.con.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::key(name))
            .arg(token.as_str())
            .invoke_async(&mut con)
            .await?;
        Ok(deleted == 1)
    }
}
