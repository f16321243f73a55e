use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{DistributedLock, LockToken};
use crate::job_state::StoreError;

/// Single-process lock with TTL expiry.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    held: Mutex<HashMap<String, (LockToken, Instant)>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .await
            .get(name)
            .is_some_and(|(_, expires_at)| *expires_at > Instant::now())
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, name: &str, ttl: Duration) -> Result<Option<LockToken>, StoreError> {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = held.get(name)
            && *expires_at > now
        {
            return Ok(None);
        }
        let token = LockToken::generate();
        held.insert(name.to_string(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, name: &str, token: &LockToken) -> Result<bool, StoreError> {
        let mut held = self.held.lock().await;
        match held.get(name) {
            Some((current, _)) if current == token => {
                held.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_acquire_yields_exactly_one_winner() {
        let lock = Arc::new(InMemoryLock::new());
        let ttl = Duration::from_secs(600);

        let (a, b) = tokio::join!(
            {
                let lock = lock.clone();
                async move { lock.acquire("scrape-lock:1", ttl).await.unwrap() }
            },
            {
                let lock = lock.clone();
                async move { lock.acquire("scrape-lock:1", ttl).await.unwrap() }
            }
        );

        assert_eq!([a.is_some(), b.is_some()].iter().filter(|won| **won).count(), 1);
    }

    #[tokio::test]
    async fn release_with_stale_token_is_a_noop() {
        let lock = InMemoryLock::new();
        let ttl = Duration::from_secs(600);
        let token = lock.acquire("name", ttl).await.unwrap().unwrap();

        assert!(!lock.release("name", &LockToken::generate()).await.unwrap());
        assert!(lock.is_held("name").await);

        assert!(lock.release("name", &token).await.unwrap());
        assert!(!lock.is_held("name").await);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_can_be_taken_over() {
        let lock = InMemoryLock::new();
        let first = lock
            .acquire("name", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let second = lock
            .acquire("name", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();

        // The crashed holder's late release must not free the new holder's lock.
        assert!(!lock.release("name", &first).await.unwrap());
        assert!(lock.is_held("name").await);
        assert!(lock.release("name", &second).await.unwrap());
    }
}
