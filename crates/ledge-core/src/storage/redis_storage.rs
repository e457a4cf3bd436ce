//! Redis-backed body storage.
//!
//! Entities are plain string keys under their own namespace with a
//! per-entity TTL, so purge can shrink a body's lifetime in lockstep with
//! its metadata chain.

use async_trait::async_trait;
use bytes::Bytes;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::trace;

use super::{BodyStorage, StorageError};

const ENTITY_PREFIX: &str = "ledge:entity:";

/// Blob storage over a shared Redis instance.
#[derive(Clone)]
pub struct RedisBodyStorage {
    manager: ConnectionManager,
}

impl RedisBodyStorage {
    /// Connects to the store at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] when the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }

    fn key(id: &str) -> String {
        format!("{ENTITY_PREFIX}{id}")
    }
}

#[async_trait]
impl BodyStorage for RedisBodyStorage {
    async fn put(&self, id: &str, body: Bytes, ttl: u64) -> Result<(), StorageError> {
        let mut con = self.manager.clone();
        let _: () = con.set_ex(Self::key(id), body.as_ref(), ttl).await?;
        trace!(entity = id, bytes = body.len(), ttl = ttl, "entity written");
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Bytes>, StorageError> {
        let mut con = self.manager.clone();
        let body: Option<Vec<u8>> = con.get(Self::key(id)).await?;
        Ok(body.map(Bytes::from))
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        let mut con = self.manager.clone();
        let _: () = con.del(Self::key(id)).await?;
        Ok(())
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        let mut con = self.manager.clone();
        let present: bool = con.exists(Self::key(id)).await?;
        Ok(present)
    }

    async fn set_ttl(&self, id: &str, ttl: u64) -> Result<(), StorageError> {
        let mut con = self.manager.clone();
        let _: bool = con.expire(Self::key(id), i64::try_from(ttl).unwrap_or(i64::MAX)).await?;
        Ok(())
    }
}
