use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use super::store::{decode_entry, encode_entry};
use super::{LedgerEntry, LedgerRecord, LedgerStore, LedgerStoreError};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

impl From<SqliteStoreError> for LedgerStoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Corrupt(reason) => LedgerStoreError::Corrupt(reason),
            other => LedgerStoreError::Unavailable(other.to_string()),
        }
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn load(&self, user_id: &str) -> Result<Option<LedgerEntry>, SqliteStoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<LedgerEntry>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let row: Option<(i64, i64, String)> = conn
                .query_row(
                    "SELECT balance, version, value_json FROM ledgers WHERE user_id=?1",
                    rusqlite::params![user_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((balance, version, value_json)) = row else {
                return Ok(None);
            };

            let entry = decode_entry(&value_json)
                .map_err(|err| SqliteStoreError::Corrupt(err.to_string()))?;
            if i64::try_from(entry.balance).ok() != Some(balance)
                || i64::try_from(entry.version).ok() != Some(version)
            {
                return Err(SqliteStoreError::Corrupt(format!(
                    "columns balance={balance} version={version} disagree with stored entry"
                )));
            }
            Ok(Some(entry))
        })
        .await?
    }

    async fn save(&self, user_id: &str, entry: &LedgerEntry) -> Result<(), LedgerStoreError> {
        let path = self.path.clone();
        let user_id = user_id.to_string();
        let value_json = encode_entry(entry)?;
        let balance = to_i64(entry.balance)?;
        let version = to_i64(entry.version)?;
        let ts_ms = now_millis();

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO ledgers (user_id, balance, version, value_json, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id) DO UPDATE SET
                    balance=excluded.balance,
                    version=excluded.version,
                    value_json=excluded.value_json,
                    updated_at_ms=excluded.updated_at_ms",
                rusqlite::params![user_id, balance, version, value_json, ts_ms],
            )?;
            Ok(())
        })
        .await
        .map_err(SqliteStoreError::from)?
        .map_err(LedgerStoreError::from)
    }

    /// Balance and version of every stored ledger, for audit.
    pub async fn list_ledgers(&self) -> Result<Vec<LedgerRecord>, SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LedgerRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT user_id, balance, version, updated_at_ms
                 FROM ledgers
                 ORDER BY user_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (user_id, balance, version, updated_at_ms) = row?;
                out.push(LedgerRecord {
                    user_id,
                    balance: i64_to_u64(balance),
                    version: i64_to_u64(version),
                    updated_at_ms: i64_to_u64(updated_at_ms),
                });
            }
            Ok(out)
        })
        .await?
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
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

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledgers (
            user_id TEXT PRIMARY KEY NOT NULL,
            balance INTEGER NOT NULL,
            version INTEGER NOT NULL,
            value_json TEXT NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// SQLite integers are signed; values past `i64::MAX` cannot be stored faithfully.
fn to_i64(value: u64) -> Result<i64, LedgerStoreError> {
    i64::try_from(value)
        .map_err(|_| LedgerStoreError::Corrupt(format!("{value} does not fit in a sqlite integer")))
}

fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
