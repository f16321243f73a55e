//! Redis-backed state store shared by every worker process.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{JobId, JobStateStore, StoreError, StoreKey, physical_key};

const PREFIX: &str = "ingest:job";

/// Holds one managed connection; every operation multiplexes over a clone
/// of it, and the manager reconnects on its own after a drop.
#[derive(Clone)]
pub struct RedisJobStore {
    con: ConnectionManager,
    ttl_seconds: u64,
}

impl RedisJobStore {
    pub fn new(con: ConnectionManager, ttl: Duration) -> Self {
        Self {
            con,
            ttl_seconds: ttl.as_secs().max(1),
        }
    }

    fn connection(&self) -> ConnectionManager {
        self.con.clone()
    }

    fn ttl_i64(&self) -> i64 {
        i64::try_from(self.ttl_seconds).unwrap_or(i64::MAX)
    }
}

/// One `EXPIRE` per key, sent as a single round trip.
fn expire_pipeline(job: &JobId, keys: &[StoreKey], ttl_seconds: i64) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    for key in keys {
        pipe.expire(physical_key(PREFIX, job, key), ttl_seconds).ignore();
    }
    pipe
}

#[async_trait]
impl JobStateStore for RedisJobStore {
    async fn get(&self, job: &JobId, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let mut con = self.connection();
        let value: Option<String> = con.get(physical_key(PREFIX, job, key)).await?;
        Ok(value)
    }

    async fn set(&self, job: &JobId, key: &StoreKey, value: &str) -> Result<(), StoreError> {
        let mut con = self.connection();
        con.set_ex::<_, _, ()>(physical_key(PREFIX, job, key), value, self.ttl_seconds)
            .await?;
        Ok(())
    }

    async fn bump(&self, job: &JobId, key: &StoreKey) -> Result<(), StoreError> {
        let mut con = self.connection();
        con.expire::<_, ()>(physical_key(PREFIX, job, key), self.ttl_i64())
            .await?;
        Ok(())
    }

    async fn bump_many(&self, job: &JobId, keys: &[StoreKey]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut con = self.connection();
        expire_pipeline(job, keys, self.ttl_i64())
            .query_async::<()>(&mut con)
            .await?;
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
        let mut con = self.connection();
        redis::pipe()
            .atomic()
            .rpush(&physical, values)
            .ignore()
            .expire(&physical, self.ttl_i64())
            .ignore()
            .query_async::<()>(&mut con)
            .await?;
        Ok(())
    }

    async fn lpop(&self, job: &JobId, key: &StoreKey) -> Result<Option<String>, StoreError> {
        let mut con = self.connection();
        let value: Option<String> = con.lpop(physical_key(PREFIX, job, key), None).await?;
        Ok(value)
    }

    async fn lvalues(&self, job: &JobId, key: &StoreKey) -> Result<Vec<String>, StoreError> {
        let mut con = self.connection();
        let values: Vec<String> = con.lrange(physical_key(PREFIX, job, key), 0, -1).await?;
        Ok(values)
    }

    async fn del(&self, job: &JobId, key: &StoreKey) -> Result<(), StoreError> {
        let mut con = self.connection();
        con.del::<_, ()>(physical_key(PREFIX, job, key)).await?;
        Ok(())
    }
}
