//! Redis KV backend.
//!
//! Counter decisions run as server-side Lua scripts so that a
//! multi-window check-and-increment is one atomic step on the server.
//! Client-side read-modify-write is never used for counters: under
//! concurrency it admits overshoot between the read and the write.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::ConnectionManager};

use crate::{
    error::{KvError, Result},
    kv::{CounterOutcome, CounterSpec, KvStore},
};

/// Checks every KEYS[i] against its limit; only when all pass, increments
/// them all and stamps the TTL on newly created counters. Returns -1 when
/// allowed, else the zero-based index of the first failing window.
static CHECK_AND_INCREMENT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local amount = tonumber(ARGV[1])
        for i = 1, #KEYS do
            local current = tonumber(redis.call('GET', KEYS[i]) or '0')
            local limit = tonumber(ARGV[2 * i])
            if current + amount > limit then
                return i - 1
            end
        end
        for i = 1, #KEYS do
            local value = redis.call('INCRBY', KEYS[i], amount)
            if value == amount then
                redis.call('EXPIRE', KEYS[i], tonumber(ARGV[2 * i + 1]))
            end
        end
        return -1
        ",
    )
});

/// INCRBY that stamps the TTL only when the counter is created.
static INCREMENT_EX: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local value = redis.call('INCRBY', KEYS[1], tonumber(ARGV[1]))
        if value == tonumber(ARGV[1]) then
            redis.call('EXPIRE', KEYS[1], tonumber(ARGV[2]))
        end
        return value
        ",
    )
});

/// DEL only when the key still holds the caller's value (fenced release).
static DELETE_IF_EQUALS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('GET', KEYS[1]) == ARGV[1] then
            return redis.call('DEL', KEYS[1])
        end
        return 0
        ",
    )
});

/// A [`KvStore`] backed by a Redis server or cluster endpoint.
///
/// The connection manager multiplexes one connection; cloning it per
/// operation is the intended usage and keeps this type `Sync`.
pub struct RedisKv {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKv").finish_non_exhaustive()
    }
}

impl RedisKv {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// The connection manager reconnects automatically; individual command
    /// failures during an outage surface as [`KvError::Connection`].
    ///
    /// # Errors
    ///
    /// Returns an error when the URL is invalid or the initial connection
    /// cannot be established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(KvError::from)?;
        let connection = ConnectionManager::new(client).await.map_err(KvError::from)?;
        Ok(Self { connection })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn ttl_secs(ttl: Duration) -> u64 {
        // Redis EXPIRE takes whole seconds; never round down to zero.
        ttl.as_secs().max(1)
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        conn.get(key).await.map_err(KvError::from)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.set_ex::<_, _, ()>(key, value, Self::ttl_secs(ttl))
            .await
            .map_err(KvError::from)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(Self::ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(KvError::from)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.del::<_, ()>(key).await.map_err(KvError::from)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = DELETE_IF_EQUALS
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(KvError::from)?;
        Ok(removed > 0)
    }

    async fn check_and_increment(
        &self,
        counters: &[CounterSpec],
        amount: u64,
    ) -> Result<CounterOutcome> {
        if counters.is_empty() {
            return Ok(CounterOutcome::Allowed);
        }

        let mut invocation = CHECK_AND_INCREMENT.prepare_invoke();
        for spec in counters {
            invocation.key(spec.key.as_str());
        }
        invocation.arg(amount);
        for spec in counters {
            invocation.arg(spec.limit).arg(Self::ttl_secs(spec.ttl));
        }

        let mut conn = self.connection.clone();
        let result: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(KvError::from)?;

        if result < 0 {
            Ok(CounterOutcome::Allowed)
        } else {
            #[allow(clippy::cast_sign_loss)]
            Ok(CounterOutcome::Denied {
                index: result as usize,
            })
        }
    }

    async fn increment_ex(&self, key: &str, amount: u64, ttl: Duration) -> Result<u64> {
        let mut conn = self.connection.clone();
        let value: i64 = INCREMENT_EX
            .key(key)
            .arg(amount)
            .arg(Self::ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(KvError::from)?;
        #[allow(clippy::cast_sign_loss)]
        Ok(value.max(0) as u64)
    }

    async fn counter_value(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection.clone();
        let value: Option<u64> = conn.get(key).await.map_err(KvError::from)?;
        Ok(value.unwrap_or(0))
    }

    async fn scan_prefix(&self, prefix: &str, batch_hint: usize) -> Result<Vec<String>> {
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        let mut conn = self.connection.clone();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(batch_hint)
                .query_async(&mut conn)
                .await
                .map_err(KvError::from)?;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn delete_batch(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(KvError::from)?;
        Ok(removed)
    }
}
