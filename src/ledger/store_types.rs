use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub user_id: String,
    pub balance: u64,
    pub version: u64,
    pub updated_at_ms: u64,
}
