//! Redis implementation of the metadata store.
//!
//! Transactions use `MULTI`/`EXEC` pipelines; the collapse lock uses a
//! conditional `SET .. NX EX`; collapse notification uses pub/sub; wildcard
//! purge uses cursor-driven `SCAN`.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, trace};

use super::{MetadataStore, StoreError};
use crate::{
    keys::{KeyChain, EXPIRES_QUEUE_KEY},
    types::{CacheEntry, HeaderBag},
};

const FIELD_STATUS: &str = "status";
const FIELD_URI: &str = "uri";
const FIELD_EXPIRES: &str = "expires";
const FIELD_ENTITY: &str = "entity";
const HEADER_FIELD_PREFIX: &str = "h:";
const REVAL_HEADER_FIELD_PREFIX: &str = "rh:";

/// Metadata store over a shared Redis instance.
///
/// Holds a multiplexed [`ConnectionManager`] for commands and the
/// [`Client`] for creating per-wait pub/sub connections.
#[derive(Clone)]
pub struct RedisMetadataStore {
    client: Client,
    manager: ConnectionManager,
}

impl RedisMetadataStore {
    /// Connects to the store at `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] when the URL is invalid or the
    /// initial connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        debug!(url = url, "connected to metadata store");
        Ok(Self { client, manager })
    }
}

/// Serializes an entry into the `main` field map.
fn to_field_pairs(entry: &CacheEntry) -> Vec<(String, String)> {
    let mut pairs = vec![
        (FIELD_STATUS.to_string(), entry.status.to_string()),
        (FIELD_URI.to_string(), entry.uri.clone()),
        (FIELD_EXPIRES.to_string(), entry.expires.to_string()),
        (FIELD_ENTITY.to_string(), entry.entity.clone()),
    ];
    for (name, value) in entry.headers.iter() {
        pairs.push((format!("{HEADER_FIELD_PREFIX}{name}"), value.to_string()));
    }
    for (name, value) in entry.reval_headers.iter() {
        pairs.push((format!("{REVAL_HEADER_FIELD_PREFIX}{name}"), value.to_string()));
    }
    pairs
}

/// Rebuilds an entry from a `HGETALL` reply. Header order inside the store
/// is undefined, so fields are sorted by name for a deterministic bag.
fn from_field_map(key: &str, map: HashMap<String, String>) -> Result<CacheEntry, StoreError> {
    let shape = |detail: &str| StoreError::UnexpectedShape {
        key: key.to_string(),
        detail: detail.to_string(),
    };

    let status = map
        .get(FIELD_STATUS)
        .ok_or_else(|| shape("missing status field"))?
        .parse::<u16>()
        .map_err(|_| shape("status is not a u16"))?;
    let expires = map
        .get(FIELD_EXPIRES)
        .ok_or_else(|| shape("missing expires field"))?
        .parse::<u64>()
        .map_err(|_| shape("expires is not a u64"))?;
    let uri = map.get(FIELD_URI).ok_or_else(|| shape("missing uri field"))?.clone();
    let entity = map.get(FIELD_ENTITY).cloned().unwrap_or_default();

    let mut header_fields: Vec<(&String, &String)> = map
        .iter()
        .filter(|(name, _)| name.starts_with(HEADER_FIELD_PREFIX))
        .collect();
    header_fields.sort_by(|a, b| a.0.cmp(b.0));
    let headers: HeaderBag = header_fields
        .into_iter()
        .map(|(name, value)| (name[HEADER_FIELD_PREFIX.len()..].to_string(), value.clone()))
        .collect();

    let mut reval_fields: Vec<(&String, &String)> = map
        .iter()
        .filter(|(name, _)| name.starts_with(REVAL_HEADER_FIELD_PREFIX))
        .collect();
    reval_fields.sort_by(|a, b| a.0.cmp(b.0));
    let reval_headers: HeaderBag = reval_fields
        .into_iter()
        .map(|(name, value)| (name[REVAL_HEADER_FIELD_PREFIX.len()..].to_string(), value.clone()))
        .collect();

    Ok(CacheEntry { status, uri, expires, entity, headers, reval_headers })
}

#[async_trait]
impl MetadataStore for RedisMetadataStore {
    async fn read_entry(&self, chain: &KeyChain) -> Result<Option<CacheEntry>, StoreError> {
        let mut con = self.manager.clone();
        let map: HashMap<String, String> = con.hgetall(chain.main()).await?;
        if map.is_empty() {
            return Ok(None);
        }
        from_field_map(&chain.main(), map).map(Some)
    }

    async fn commit_entry(
        &self,
        chain: &KeyChain,
        entry: &CacheEntry,
        ttl: u64,
    ) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let main = chain.main();
        let pairs = to_field_pairs(entry);
        let ttl = i64::try_from(ttl).unwrap_or(i64::MAX);

        let mut pipe = redis::pipe();
        pipe.atomic();
        // DEL before HSET so fields from a previous entity do not linger.
        pipe.del(&main).ignore();
        pipe.hset_multiple(&main, &pairs).ignore();
        pipe.sadd(chain.entities(), &entry.entity).ignore();
        for key in chain.ttl_bound_keys() {
            pipe.expire(key, ttl).ignore();
        }
        pipe.zadd(EXPIRES_QUEUE_KEY, &entry.uri, entry.expires).ignore();
        let _: () = pipe.query_async(&mut con).await?;

        trace!(key = %main, entity = %entry.entity, ttl = ttl, "entry committed");
        Ok(())
    }

    async fn chain_ttl(&self, chain: &KeyChain) -> Result<Option<u64>, StoreError> {
        let mut con = self.manager.clone();
        let ttl: i64 = con.ttl(chain.main()).await?;
        Ok(u64::try_from(ttl).ok())
    }

    async fn expire_chain(&self, chain: &KeyChain, now: u64) -> Result<Option<u64>, StoreError> {
        let mut con = self.manager.clone();
        let main = chain.main();

        let expires: Option<String> = con.hget(&main, FIELD_EXPIRES).await?;
        let Some(expires) = expires else {
            return Ok(None);
        };
        let expires = expires.parse::<u64>().map_err(|_| StoreError::UnexpectedShape {
            key: main.clone(),
            detail: "expires is not a u64".to_string(),
        })?;
        if expires <= now {
            return Ok(None);
        }

        let ttl: i64 = con.ttl(&main).await?;
        let delta = expires - now;
        let new_ttl = u64::try_from(ttl).unwrap_or(0).saturating_sub(delta);

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.hset(&main, FIELD_EXPIRES, now.saturating_sub(1)).ignore();
        for key in chain.ttl_bound_keys() {
            pipe.expire(key, i64::try_from(new_ttl).unwrap_or(i64::MAX)).ignore();
        }
        let _: () = pipe.query_async(&mut con).await?;

        trace!(key = %main, new_ttl = new_ttl, "chain expired");
        Ok(Some(new_ttl))
    }

    async fn delete_chain(&self, chain: &KeyChain) -> Result<bool, StoreError> {
        let mut con = self.manager.clone();
        let removed: i64 = con.del(&chain.all_keys()[..]).await?;
        Ok(removed > 0)
    }

    async fn entity_set(&self, chain: &KeyChain) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        let members: Vec<String> = con.smembers(chain.entities()).await?;
        Ok(members)
    }

    async fn remove_entities(&self, chain: &KeyChain, ids: &[String]) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut con = self.manager.clone();
        let _: () = con.srem(chain.entities(), ids).await?;
        Ok(())
    }

    async fn try_acquire_lock(&self, chain: &KeyChain, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut con = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(chain.fetching_lock())
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut con)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, chain: &KeyChain) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.del(chain.fetching_lock()).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: () = con.publish(channel, message).await?;
        Ok(())
    }

    async fn await_message(
        &self,
        channel: &str,
        timeout: Duration,
    ) -> Result<Option<String>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let mut stream = pubsub.on_message();

        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(StoreError::SubscriptionLost(channel.to_string())),
            Ok(Some(msg)) => {
                let payload: String = msg.get_payload()?;
                Ok(Some(payload))
            }
        }
    }

    async fn scan_main_keys(
        &self,
        pattern: &str,
        batch: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut con = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, page): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(batch)
                .query_async(&mut con)
                .await?;
            keys.extend(page);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = pattern, matched = keys.len(), "keyspace scan complete");
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}
