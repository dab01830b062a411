use thiserror::Error;

use crate::ledger::LedgerStoreError;

#[derive(Clone, Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance for {user_id}: balance={balance} requested={requested}")]
    InsufficientBalance {
        user_id: String,
        balance: u64,
        requested: u64,
    },
    #[error("persistence unavailable for {user_id}: {reason}")]
    PersistenceUnavailable { user_id: String, reason: String },
    #[error("version conflict for {user_id}: flushed={flushed} current={current}")]
    VersionConflict {
        user_id: String,
        flushed: u64,
        current: u64,
    },
    #[error("corrupt ledger entry for {user_id}: {reason}")]
    CorruptEntry { user_id: String, reason: String },
    #[error("invalid amount for {user_id}: {reason}")]
    InvalidAmount { user_id: String, reason: String },
    #[error("ledger cache is shut down")]
    Closed,
}

impl LedgerError {
    pub(crate) fn from_store(user_id: &str, err: LedgerStoreError) -> Self {
        match err {
            LedgerStoreError::Unavailable(reason) => Self::PersistenceUnavailable {
                user_id: user_id.to_string(),
                reason,
            },
            LedgerStoreError::Corrupt(reason) => Self::CorruptEntry {
                user_id: user_id.to_string(),
                reason,
            },
        }
    }

    /// The caller asked for more credits than the user holds; deny the call.
    pub fn is_insufficient_balance(&self) -> bool {
        matches!(self, Self::InsufficientBalance { .. })
    }

    /// Infrastructure trouble the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::PersistenceUnavailable { .. } | Self::VersionConflict { .. } | Self::Closed
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
