mod error;
pub mod ledger;
#[cfg(feature = "cli")]
pub mod telemetry;

pub use error::{LedgerError, Result};
pub use ledger::{
    CacheConfig, CacheHealth, Clock, ConfigError, CreditOutcome, FileStore, FlushOutcome,
    FlushReport, LedgerCache, LedgerConfig, LedgerEntry, LedgerStore, LedgerStoreError,
    LowBalanceWarning, MemoryStore, RetentionConfig, StoreConfig, SystemClock, ToolUsage,
    UsageKind, UsageLog, UsageRecord, UsageSummary, UserLedger, open_store,
};

#[cfg(feature = "store-redis")]
pub use ledger::RedisStore;
#[cfg(feature = "store-sqlite")]
pub use ledger::SqliteStore;
