/*
[INPUT]:  Redis URL or nothing (in-process)
[OUTPUT]: String and hash access to the shared key-value store
[POS]:    Storage layer - external run-state, settings and position cache
[UPDATE]: When engines need new store commands
*/

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::info;

/// Subset of Redis the engine relies on
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn exists(&self, key: &str) -> Result<bool>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()>;
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;
}

/// Redis-backed store over one multiplexed connection
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("open redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("connect to redis")?;
        info!(redis_url, "redis connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, entries).await?;
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hdel(key, field).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Value(String),
    Hash(HashMap<String, String>),
}

/// In-process store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_hash<T>(
        &self,
        key: &str,
        apply: impl FnOnce(&mut HashMap<String, String>) -> T,
    ) -> Result<T> {
        let mut entries = self.entries();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(HashMap::new()));
        let Entry::Hash(hash) = entry else {
            bail!("WRONGTYPE key {key} holds a string value");
        };
        let out = apply(hash);
        if hash.is_empty() {
            entries.remove(key);
        }
        Ok(out)
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entries().get(key) {
            Some(Entry::Value(value)) => Ok(Some(value.clone())),
            Some(Entry::Hash(_)) => bail!("WRONGTYPE key {key} holds a hash"),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()
            .insert(key.to_string(), Entry::Value(value.to_string()));
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries().contains_key(key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        match self.entries().get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(Entry::Value(_)) => bail!("WRONGTYPE key {key} holds a string value"),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        match self.entries().get(key) {
            Some(Entry::Hash(hash)) => Ok(hash.clone()),
            Some(Entry::Value(_)) => bail!("WRONGTYPE key {key} holds a string value"),
            None => Ok(HashMap::new()),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_hash(key, |hash| {
            hash.insert(field.to_string(), value.to_string());
        })
    }

    async fn hset_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_hash(key, |hash| {
            for (field, value) in entries {
                hash.insert(field.clone(), value.clone());
            }
        })
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        if !self.entries().contains_key(key) {
            return Ok(());
        }
        self.with_hash(key, |hash| {
            hash.remove(field);
        })
    }
}
