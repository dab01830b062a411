use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::RetentionConfig;
use crate::error::LedgerError;

pub const SCHEMA_VERSION: u32 = 1;

/// Reference recorded for the one-time starter grant.
pub const SEED_BALANCE_REFERENCE: &str = "seed_balance_v1";

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

fn default_schema() -> u32 {
    SCHEMA_VERSION
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    Debit,
    Credit,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub ts_ms: u64,
    pub kind: UsageKind,
    /// Tool id for debits and rollbacks, credit source for credits.
    pub tool_id: String,
    pub amount: u64,
    pub balance_after: u64,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl UsageRecord {
    /// UTC day number since the epoch.
    pub fn day(&self) -> u64 {
        self.ts_ms / DAY_MS
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage {
    pub calls: u64,
    pub amount: u64,
}

/// Durable per-user ledger record.
///
/// Cache bookkeeping (dirty flag, LRU position) lives next to the entry inside
/// [`super::LedgerCache`] and is never persisted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    #[serde(rename = "v", default = "default_schema")]
    pub schema: u32,
    pub user_id: String,
    pub balance: u64,
    pub version: u64,
    #[serde(default)]
    pub usage_log: Vec<UsageRecord>,
    #[serde(default)]
    pub total_deposited: u64,
    #[serde(default)]
    pub total_consumed: u64,
    #[serde(default)]
    pub tool_totals: BTreeMap<String, ToolUsage>,
    #[serde(default)]
    pub credited_refs: BTreeSet<String>,
    /// Amount of the most recent credit other than the seed grant. Kept
    /// outside the usage log so rotation does not reset it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_purchase: Option<u64>,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Mutation<'a> {
    pub kind: UsageKind,
    pub amount: u64,
    pub reason: &'a str,
    pub reference: Option<&'a str>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Applied {
    Mutated(u64),
    Duplicate(u64),
}

impl Applied {
    pub(crate) fn balance(self) -> u64 {
        match self {
            Self::Mutated(balance) | Self::Duplicate(balance) => balance,
        }
    }
}

impl LedgerEntry {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            schema: SCHEMA_VERSION,
            user_id: user_id.into(),
            balance: 0,
            version: 0,
            usage_log: Vec::new(),
            total_deposited: 0,
            total_consumed: 0,
            tool_totals: BTreeMap::new(),
            credited_refs: BTreeSet::new(),
            last_purchase: None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Structural checks applied to every record read back from a store.
    pub fn validate(&self, user_id: &str) -> Result<(), String> {
        if self.user_id != user_id {
            return Err(format!("record belongs to {:?}", self.user_id));
        }
        if self.schema == 0 || self.schema > SCHEMA_VERSION {
            return Err(format!("unsupported schema version {}", self.schema));
        }

        let mut previous: Option<u64> = None;
        for record in &self.usage_log {
            if record.version == 0 || record.version > self.version {
                return Err(format!(
                    "usage record version {} outside 1..={}",
                    record.version, self.version
                ));
            }
            if previous.is_some_and(|prev| record.version <= prev) {
                return Err("usage log versions are not strictly increasing".to_string());
            }
            previous = Some(record.version);
        }

        if let Some(last) = self.usage_log.last() {
            if last.version == self.version && last.balance_after != self.balance {
                return Err(format!(
                    "balance {} disagrees with last usage record {}",
                    self.balance, last.balance_after
                ));
            }
        }
        Ok(())
    }

    pub fn usage_since(&self, since_ms: u64) -> impl Iterator<Item = &UsageRecord> + '_ {
        self.usage_log
            .iter()
            .filter(move |record| record.ts_ms >= since_ms)
    }

    pub fn seed_granted(&self) -> bool {
        self.credited_refs.contains(SEED_BALANCE_REFERENCE)
    }

    /// Applies one mutation. On error nothing changes: balance, version,
    /// aggregates and usage log are all left as they were.
    pub(crate) fn apply(
        &mut self,
        mutation: &Mutation<'_>,
        ts_ms: u64,
        retention: &RetentionConfig,
    ) -> Result<Applied, LedgerError> {
        if let Some(reference) = mutation.reference {
            if self.credited_refs.contains(reference) {
                return Ok(Applied::Duplicate(self.balance));
            }
        }

        let balance = match mutation.kind {
            UsageKind::Debit => self.balance.checked_sub(mutation.amount).ok_or_else(|| {
                LedgerError::InsufficientBalance {
                    user_id: self.user_id.clone(),
                    balance: self.balance,
                    requested: mutation.amount,
                }
            })?,
            UsageKind::Credit | UsageKind::Rollback => self
                .balance
                .checked_add(mutation.amount)
                .ok_or_else(|| LedgerError::InvalidAmount {
                    user_id: self.user_id.clone(),
                    reason: format!(
                        "adding {} overflows balance {}",
                        mutation.amount, self.balance
                    ),
                })?,
        };
        let version = self
            .version
            .checked_add(1)
            .ok_or_else(|| LedgerError::InvalidAmount {
                user_id: self.user_id.clone(),
                reason: "version counter exhausted".to_string(),
            })?;

        self.balance = balance;
        self.version = version;

        match mutation.kind {
            UsageKind::Debit => {
                self.total_consumed = self.total_consumed.saturating_add(mutation.amount);
                let usage = self
                    .tool_totals
                    .entry(mutation.reason.to_string())
                    .or_default();
                usage.calls = usage.calls.saturating_add(1);
                usage.amount = usage.amount.saturating_add(mutation.amount);
            }
            UsageKind::Credit => {
                self.total_deposited = self.total_deposited.saturating_add(mutation.amount);
                if mutation.reference != Some(SEED_BALANCE_REFERENCE) {
                    self.last_purchase = Some(mutation.amount);
                }
            }
            UsageKind::Rollback => {
                self.total_consumed = self.total_consumed.saturating_sub(mutation.amount);
                if let Some(usage) = self.tool_totals.get_mut(mutation.reason) {
                    usage.calls = usage.calls.saturating_sub(1);
                    usage.amount = usage.amount.saturating_sub(mutation.amount);
                }
            }
        }

        if let Some(reference) = mutation.reference {
            self.credited_refs.insert(reference.to_string());
        }

        self.usage_log.push(UsageRecord {
            ts_ms,
            kind: mutation.kind,
            tool_id: mutation.reason.to_string(),
            amount: mutation.amount,
            balance_after: balance,
            version,
            reference: mutation.reference.map(str::to_string),
        });
        self.rotate(ts_ms, retention);

        Ok(Applied::Mutated(balance))
    }

    /// Drops usage records older than the retention window, then the oldest
    /// records beyond `max_records`. Aggregates are left untouched.
    pub(crate) fn rotate(&mut self, now_ms: u64, retention: &RetentionConfig) {
        let cutoff_day = (now_ms / DAY_MS).saturating_sub(u64::from(retention.retention_days));
        self.usage_log.retain(|record| record.day() >= cutoff_day);

        if self.usage_log.len() > retention.max_records {
            let excess = self.usage_log.len() - retention.max_records;
            self.usage_log.drain(..excess);
        }
    }
}
