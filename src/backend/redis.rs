//! Redis backend.
//!
//! Thin command mapping over a multiplexed connection. Batches become
//! MULTI/EXEC pipelines so entry writes and group membership land
//! together. The connection is cloned per call, which shares the one
//! underlying socket.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use crate::error::CacheError;

use super::{Backend, Batch, BatchOp, KeyTtl};

const SOURCE: &str = "backend::redis";

// PTTL sentinel replies.
const TTL_KEY_MISSING: i64 = -2;
const TTL_NOT_SET: i64 = -1;

pub struct RedisBackend {
    connection: MultiplexedConnection,
}

impl RedisBackend {
    /// Open a connection from a `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        debug!(source = SOURCE, "connected to redis backend");
        Ok(Self { connection })
    }

    /// Wrap an already established connection.
    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    fn conn(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl Backend for RedisBackend {
    fn kind(&self) -> &'static str {
        "redis"
    }

    async fn set_if_absent_ms(
        &self,
        key: &str,
        value: &str,
        ttl_ms: u64,
    ) -> Result<bool, CacheError> {
        let reply = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<Option<String>>(&mut self.conn())
            .await?;
        Ok(reply.is_some())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(redis::cmd("GET")
            .arg(key)
            .query_async::<Option<String>>(&mut self.conn())
            .await?)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, CacheError> {
        Ok(redis::cmd("HGETALL")
            .arg(key)
            .query_async::<HashMap<String, Vec<u8>>>(&mut self.conn())
            .await?)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async::<Option<Vec<u8>>>(&mut self.conn())
            .await?)
    }

    async fn expire_ms(&self, key: &str, ttl_ms: u64) -> Result<bool, CacheError> {
        let set = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .query_async::<i64>(&mut self.conn())
            .await?;
        Ok(set == 1)
    }

    async fn ttl_ms(&self, key: &str) -> Result<KeyTtl, CacheError> {
        let remaining = redis::cmd("PTTL")
            .arg(key)
            .query_async::<i64>(&mut self.conn())
            .await?;
        Ok(match remaining {
            TTL_KEY_MISSING => KeyTtl::Missing,
            TTL_NOT_SET => KeyTtl::Unbounded,
            value => KeyTtl::Remaining(value.max(0) as u64),
        })
    }

    async fn append(&self, key: &str, chunk: &[u8]) -> Result<u64, CacheError> {
        Ok(redis::cmd("APPEND")
            .arg(key)
            .arg(chunk)
            .query_async::<u64>(&mut self.conn())
            .await?)
    }

    async fn range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, CacheError> {
        let bytes = redis::cmd("GETRANGE")
            .arg(key)
            .arg(start)
            .arg(end)
            .query_async::<Vec<u8>>(&mut self.conn())
            .await?;
        Ok(Bytes::from(bytes))
    }

    async fn strlen(&self, key: &str) -> Result<u64, CacheError> {
        Ok(redis::cmd("STRLEN")
            .arg(key)
            .query_async::<u64>(&mut self.conn())
            .await?)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, CacheError> {
        Ok(redis::cmd("SMEMBERS")
            .arg(key)
            .query_async::<Vec<String>>(&mut self.conn())
            .await?)
    }

    async fn set_len(&self, key: &str) -> Result<u64, CacheError> {
        Ok(redis::cmd("SCARD")
            .arg(key)
            .query_async::<u64>(&mut self.conn())
            .await?)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, CacheError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        Ok(cmd.query_async::<u64>(&mut self.conn()).await?)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: u64,
    ) -> Result<(u64, Vec<String>), CacheError> {
        Ok(redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(page_size)
            .query_async::<(u64, Vec<String>)>(&mut self.conn())
            .await?)
    }

    async fn apply(&self, batch: Batch) -> Result<(), CacheError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                BatchOp::HashSet { key, fields } => {
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                    cmd.ignore();
                }
                BatchOp::ExpireMs { key, ttl_ms } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(*ttl_ms).ignore();
                }
                BatchOp::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                BatchOp::SetRemove { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                BatchOp::Delete { keys } => {
                    let cmd = pipe.cmd("DEL");
                    for key in keys {
                        cmd.arg(key);
                    }
                    cmd.ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut self.conn()).await?;
        Ok(())
    }

    async fn key_count(&self) -> Result<u64, CacheError> {
        Ok(redis::cmd("DBSIZE")
            .query_async::<u64>(&mut self.conn())
            .await?)
    }

    async fn flush_all(&self) -> Result<(), CacheError> {
        redis::cmd("FLUSHDB")
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }
}
