use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use super::store::{decode_entry, encode_entry};
use super::{LedgerEntry, LedgerRecord, LedgerStore, LedgerStoreError};

/// One hash per user (`{prefix}:ledger:{user_id}`) plus a set indexing all users.
#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("corrupt ledger hash: {0}")]
    Corrupt(String),
}

impl From<RedisStoreError> for LedgerStoreError {
    fn from(err: RedisStoreError) -> Self {
        match err {
            RedisStoreError::Corrupt(reason) => LedgerStoreError::Corrupt(reason),
            other => LedgerStoreError::Unavailable(other.to_string()),
        }
    }
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "credit_ledger".to_string(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key_users(&self) -> String {
        format!("{}:ledger_users", self.prefix)
    }

    fn key_ledger(&self, user_id: &str) -> String {
        format!("{}:ledger:{user_id}", self.prefix)
    }

    async fn load(&self, user_id: &str) -> Result<Option<LedgerEntry>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.hget(self.key_ledger(user_id), "value_json").await?;
        raw.map(|raw| decode_entry(&raw).map_err(|err| RedisStoreError::Corrupt(err.to_string())))
            .transpose()
    }

    async fn save(&self, user_id: &str, entry: &LedgerEntry) -> Result<(), LedgerStoreError> {
        let value_json = encode_entry(entry)?;
        let ledger_key = self.key_ledger(user_id);
        let mut conn = self.connection().await.map_err(RedisStoreError::from)?;

        let _: () = redis::pipe()
            .atomic()
            .hset(&ledger_key, "balance", entry.balance)
            .hset(&ledger_key, "version", entry.version)
            .hset(&ledger_key, "value_json", value_json)
            .hset(&ledger_key, "updated_at_ms", now_millis())
            .sadd(self.key_users(), user_id)
            .query_async(&mut conn)
            .await
            .map_err(RedisStoreError::from)?;
        Ok(())
    }

    pub async fn list_ledgers(&self) -> Result<Vec<LedgerRecord>, RedisStoreError> {
        let mut conn = self.connection().await?;
        let mut user_ids: Vec<String> = conn.smembers(self.key_users()).await?;
        user_ids.sort();

        let mut out = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            let raw: HashMap<String, String> = conn.hgetall(self.key_ledger(&user_id)).await?;
            let field = |name: &str| {
                raw.get(name)
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(0)
            };
            out.push(LedgerRecord {
                balance: field("balance"),
                version: field("version"),
                updated_at_ms: field("updated_at_ms"),
                user_id,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl LedgerStore for RedisStore {
    async fn fetch_ledger(&self, user_id: &str) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        Ok(self.load(user_id).await?)
    }

    async fn store_ledger(
        &self,
        user_id: &str,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerStoreError> {
        self.save(user_id, entry).await
    }

    async fn snapshot_ledger(
        &self,
        user_id: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        Ok(self.load(user_id).await?)
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
