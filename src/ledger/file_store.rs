use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use super::store::{decode_entry, encode_entry};
use super::{LedgerEntry, LedgerStore, LedgerStoreError};

/// One JSON document per user under a directory.
#[derive(Clone, Debug)]
pub struct FileStore {
    dir: PathBuf,
}

#[derive(Debug, Error)]
pub enum FileStoreError {
    #[error("file store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("read ledger file failed: {0}")]
    Read(std::io::Error),
    #[error("write ledger file failed: {0}")]
    Write(std::io::Error),
    #[error("parse ledger file failed: {0}")]
    Parse(String),
}

impl From<FileStoreError> for LedgerStoreError {
    fn from(err: FileStoreError) -> Self {
        match err {
            FileStoreError::Parse(reason) => LedgerStoreError::Corrupt(reason),
            other => LedgerStoreError::Unavailable(other.to_string()),
        }
    }
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn init(&self) -> Result<(), FileStoreError> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || fs::create_dir_all(dir).map_err(FileStoreError::Write))
            .await?
    }

    /// User ids are hex-encoded so any id maps to a safe, unique file name.
    fn path_for(&self, user_id: &str) -> PathBuf {
        let mut name = String::with_capacity(user_id.len() * 2 + 5);
        for byte in user_id.as_bytes() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(".json");
        self.dir.join(name)
    }

    async fn read(&self, user_id: &str) -> Result<Option<LedgerEntry>, FileStoreError> {
        let path = self.path_for(user_id);
        tokio::task::spawn_blocking(move || -> Result<Option<LedgerEntry>, FileStoreError> {
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(FileStoreError::Read(err)),
            };
            decode_entry(&raw)
                .map(Some)
                .map_err(|err| FileStoreError::Parse(err.to_string()))
        })
        .await?
    }

    async fn write(&self, user_id: &str, payload: String) -> Result<(), FileStoreError> {
        let dir = self.dir.clone();
        let path = self.path_for(user_id);
        tokio::task::spawn_blocking(move || -> Result<(), FileStoreError> {
            fs::create_dir_all(&dir).map_err(FileStoreError::Write)?;

            let tmp_path = path.with_extension("json.tmp");
            if fs::write(&tmp_path, &payload).is_err() {
                fs::write(&path, &payload).map_err(FileStoreError::Write)?;
                return Ok(());
            }

            match fs::rename(&tmp_path, &path) {
                Ok(()) => Ok(()),
                Err(_) => {
                    fs::write(&path, &payload).map_err(FileStoreError::Write)?;
                    let _ = fs::remove_file(&tmp_path);
                    Ok(())
                }
            }
        })
        .await?
    }
}

#[async_trait]
impl LedgerStore for FileStore {
    async fn fetch_ledger(&self, user_id: &str) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        Ok(self.read(user_id).await?)
    }

    async fn store_ledger(
        &self,
        user_id: &str,
        entry: &LedgerEntry,
    ) -> Result<(), LedgerStoreError> {
        let payload = encode_entry(entry)?;
        Ok(self.write(user_id, payload).await?)
    }

    async fn snapshot_ledger(
        &self,
        user_id: &str,
    ) -> Result<Option<LedgerEntry>, LedgerStoreError> {
        Ok(self.read(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trips_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("ledgers"));
        store.init().await.expect("init");

        assert!(store.fetch_ledger("alice").await.expect("fetch").is_none());

        let mut entry = LedgerEntry::new("alice");
        entry.balance = 700;
        entry.version = 2;
        store.store_ledger("alice", &entry).await.expect("store");

        let loaded = store.fetch_ledger("alice").await.expect("fetch");
        assert_eq!(loaded, Some(entry.clone()));

        entry.balance = 300;
        entry.version = 3;
        store.store_ledger("alice", &entry).await.expect("overwrite");
        let loaded = store.fetch_ledger("alice").await.expect("fetch");
        assert_eq!(loaded.map(|e| (e.balance, e.version)), Some((300, 3)));
    }

    #[tokio::test]
    async fn file_store_keeps_users_with_odd_ids_apart() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());

        for user in ["a/b", "a_b", "../etc", "npub1xyz"] {
            store
                .store_ledger(user, &LedgerEntry::new(user))
                .await
                .expect("store");
        }
        for user in ["a/b", "a_b", "../etc", "npub1xyz"] {
            let loaded = store.fetch_ledger(user).await.expect("fetch").expect("some");
            assert_eq!(loaded.user_id, user);
        }
        assert_eq!(fs::read_dir(dir.path()).expect("read_dir").count(), 4);
    }

    #[tokio::test]
    async fn file_store_reports_unparseable_files_as_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path());
        fs::write(store.path_for("bob"), "[]").expect("write");

        let err = store.fetch_ledger("bob").await.unwrap_err();
        assert!(matches!(err, LedgerStoreError::Corrupt(_)));
    }
}
