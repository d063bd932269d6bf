//! Redis-backed event log.
//!
//! Each key is a Redis sorted set whose members are request ids scored by
//! request time in epoch milliseconds. A check runs as one `MULTI`/`EXEC`
//! transaction:
//!
//! ```text
//! ZREMRANGEBYSCORE key -inf (cutoff
//! ZCARD key
//! ZADD key now member
//! PEXPIRE key window
//! ```
//!
//! so no other client can interleave between the trim and the insert.

use std::fmt;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::info;

use super::distributed::{EventLog, LogEntry};
use crate::error::Result;

/// An [`EventLog`] stored in Redis sorted sets.
///
/// Holds a `ConnectionManager`, which multiplexes one connection across
/// callers and reconnects after failures. Cloning is cheap and shares the
/// connection.
#[derive(Clone)]
pub struct RedisEventLog {
    connection: ConnectionManager,
}

impl fmt::Debug for RedisEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisEventLog").finish_non_exhaustive()
    }
}

impl RedisEventLog {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., "redis://127.0.0.1/")
    ///
    /// # Errors
    /// Returns [`FloodgateError::Backend`](crate::error::FloodgateError::Backend)
    /// if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!("Rate limit event log connected to Redis");
        Ok(Self { connection })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl EventLog for RedisEventLog {
    async fn record(&self, key: &str, entry: LogEntry) -> Result<u64> {
        let mut conn = self.connection.clone();
        let cutoff = format!("({}", entry.cutoff_ms());

        let (count,): (u64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZCARD")
            .arg(key)
            .cmd("ZADD")
            .arg(key)
            .arg(entry.now_ms)
            .arg(&entry.member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(entry.window_ms)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(count)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
