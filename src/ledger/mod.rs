//! Credit ledger: per-user balances held in a write-behind cache over a pluggable store.

pub mod cache;
pub mod config;
pub mod entry;
pub mod file_store;
mod flush;
pub mod observability;
pub mod operations;
pub mod store;
mod store_types;

#[cfg(feature = "store-redis")]
pub mod redis_store;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;

pub use cache::{FlushOutcome, FlushReport, LedgerCache};
pub use config::{CacheConfig, ConfigError, LedgerConfig, RetentionConfig, StoreConfig};
pub use entry::{LedgerEntry, SEED_BALANCE_REFERENCE, ToolUsage, UsageKind, UsageRecord};
pub use file_store::{FileStore, FileStoreError};
pub use observability::CacheHealth;
pub use operations::{
    CreditOutcome, LowBalanceWarning, UsageIter, UsageLog, UsageSummary, UserLedger,
};
pub use store::{LedgerStore, LedgerStoreError, MemoryStore, open_store};
pub use store_types::LedgerRecord;

#[cfg(feature = "store-redis")]
pub use redis_store::{RedisStore, RedisStoreError};
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}
