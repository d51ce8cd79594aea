//! Ephemeral state cache
//!
//! Read-through cache of derived peer/interface state. Never authoritative:
//! every error path degrades to a miss and the caller falls back to the
//! config store. Callers invalidate affected keys synchronously after a
//! successful store commit.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Cache key for an interface's active peer list.
pub fn peer_list_key(interface_id: Uuid) -> String {
    format!("iface:{}:peers", interface_id)
}

/// Cache key for a single peer record.
pub fn peer_key(peer_id: Uuid) -> String {
    format!("peer:{}", peer_id)
}

/// Key/value cache with TTL semantics.
#[async_trait]
pub trait StateCache: Send + Sync {
    /// Fetch a value; `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with a time-to-live.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Drop a key. Absent keys are not an error.
    async fn invalidate(&self, key: &str) -> Result<()>;
}

// ============================================================================
// Redis implementation
// ============================================================================

/// Cache backed by an external Redis endpoint.
pub struct RedisCache {
    manager: redis::aio::ConnectionManager,
}

impl RedisCache {
    /// Connect to the cache endpoint, e.g. `redis://127.0.0.1:6379`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl StateCache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// In-process cache used in tests and when no cache endpoint is configured.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        // Drop the shard guard before removing an expired entry
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1 > Instant::now() => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}
