//! Caller-facing ledger API used by the tool-gating layer and payment hooks.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::entry::{Applied, Mutation};
use super::{
    CacheHealth, ConfigError, FlushOutcome, FlushReport, LedgerCache, LedgerConfig, LedgerEntry,
    LedgerStore, SEED_BALANCE_REFERENCE, ToolUsage, UsageKind, UsageRecord, open_store,
};
use crate::error::Result;

const DEFAULT_TOP_UP: u64 = 1_000;
const MAX_TOP_UP: u64 = 1_000_000;
const DEFAULT_LOW_BALANCE_FLOOR: u64 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "balance", rename_all = "snake_case")]
pub enum CreditOutcome {
    Applied(u64),
    /// The reference was credited before; balance is returned unchanged.
    AlreadyApplied(u64),
}

impl CreditOutcome {
    pub fn balance(self) -> u64 {
        match self {
            Self::Applied(balance) | Self::AlreadyApplied(balance) => balance,
        }
    }
}

impl From<Applied> for CreditOutcome {
    fn from(applied: Applied) -> Self {
        match applied {
            Applied::Mutated(balance) => Self::Applied(balance),
            Applied::Duplicate(balance) => Self::AlreadyApplied(balance),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowBalanceWarning {
    pub balance: u64,
    pub threshold: u64,
    pub suggested_top_up: u64,
}

impl LowBalanceWarning {
    /// The threshold is a fifth of the last purchase, or of the seed grant
    /// when nothing was bought yet, and never below `floor`.
    pub fn evaluate(entry: &LedgerEntry, floor: u64, seed_balance: u64) -> Option<Self> {
        let reference = entry.last_purchase.or_else(|| {
            (seed_balance > 0 && entry.seed_granted()).then_some(seed_balance)
        });
        let threshold = reference.map_or(0, |amount| amount / 5).max(floor);
        if entry.balance >= threshold {
            return None;
        }
        let suggested_top_up = entry
            .last_purchase
            .filter(|amount| *amount > 0)
            .unwrap_or(DEFAULT_TOP_UP)
            .min(MAX_TOP_UP);
        Some(Self {
            balance: entry.balance,
            threshold,
            suggested_top_up,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub balance: u64,
    pub version: u64,
    pub total_deposited: u64,
    pub total_consumed: u64,
    pub tool_totals: BTreeMap<String, ToolUsage>,
}

impl From<&LedgerEntry> for UsageSummary {
    fn from(entry: &LedgerEntry) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            balance: entry.balance,
            version: entry.version,
            total_deposited: entry.total_deposited,
            total_consumed: entry.total_consumed,
            tool_totals: entry.tool_totals.clone(),
        }
    }
}

/// Point-in-time copy of a user's usage log, filtered by timestamp.
///
/// Iteration is lazy and can be restarted any number of times; later
/// mutations do not show up in an existing log.
#[derive(Clone, Debug)]
pub struct UsageLog {
    records: Arc<[UsageRecord]>,
    since_ms: u64,
}

impl UsageLog {
    pub fn since_ms(&self) -> u64 {
        self.since_ms
    }

    /// Same snapshot, different window.
    pub fn since(&self, since_ms: u64) -> Self {
        Self {
            records: Arc::clone(&self.records),
            since_ms,
        }
    }

    pub fn iter(&self) -> UsageIter<'_> {
        UsageIter {
            inner: self.records.iter(),
            since_ms: self.since_ms,
        }
    }

    pub fn debits(&self) -> impl Iterator<Item = &UsageRecord> + '_ {
        self.iter().filter(|record| record.kind == UsageKind::Debit)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

impl<'a> IntoIterator for &'a UsageLog {
    type Item = &'a UsageRecord;
    type IntoIter = UsageIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[derive(Clone, Debug)]
pub struct UsageIter<'a> {
    inner: std::slice::Iter<'a, UsageRecord>,
    since_ms: u64,
}

impl<'a> Iterator for UsageIter<'a> {
    type Item = &'a UsageRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let since_ms = self.since_ms;
        self.inner.find(|record| record.ts_ms >= since_ms)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.inner.size_hint().1)
    }
}

#[derive(Clone, Debug)]
pub struct UserLedger {
    cache: Arc<LedgerCache>,
    low_balance_floor: u64,
    seed_balance: u64,
}

impl UserLedger {
    pub fn new(cache: Arc<LedgerCache>) -> Self {
        Self {
            cache,
            low_balance_floor: DEFAULT_LOW_BALANCE_FLOOR,
            seed_balance: 0,
        }
    }

    pub fn from_config(store: Arc<dyn LedgerStore>, config: &LedgerConfig) -> Self {
        let cache = LedgerCache::new(store, config.cache.clone(), config.retention.clone());
        Self::new(Arc::new(cache))
            .with_low_balance_floor(config.low_balance_floor)
            .with_seed_balance(config.seed_balance)
    }

    /// Opens the configured store and wraps it in a fresh cache.
    pub async fn open(config: &LedgerConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let store = open_store(&config.store).await?;
        Ok(Self::from_config(store, config))
    }

    pub fn with_low_balance_floor(mut self, floor: u64) -> Self {
        self.low_balance_floor = floor;
        self
    }

    pub fn with_seed_balance(mut self, seed_balance: u64) -> Self {
        self.seed_balance = seed_balance;
        self
    }

    pub fn cache(&self) -> &Arc<LedgerCache> {
        &self.cache
    }

    pub async fn check_balance(&self, user_id: &str) -> Result<u64> {
        self.cache.read(user_id, |entry| entry.balance).await
    }

    /// Charges `cost` for one call of `tool_id`. The balance check and the
    /// charge happen under the same per-user lock.
    pub async fn debit(&self, user_id: &str, cost: u64, tool_id: &str) -> Result<u64> {
        let applied = self
            .cache
            .apply(
                user_id,
                Mutation {
                    kind: UsageKind::Debit,
                    amount: cost,
                    reason: tool_id,
                    reference: None,
                },
            )
            .await?;
        Ok(applied.balance())
    }

    pub async fn credit(&self, user_id: &str, amount: u64, source: &str) -> Result<u64> {
        let applied = self
            .cache
            .apply(
                user_id,
                Mutation {
                    kind: UsageKind::Credit,
                    amount,
                    reason: source,
                    reference: None,
                },
            )
            .await?;
        Ok(applied.balance())
    }

    /// Credits `amount` unless `reference` was already credited to this user.
    ///
    /// A fresh credit is flushed to the store before returning. A failed flush
    /// is logged and leaves the entry dirty for the next sweep; the credit
    /// itself stands.
    pub async fn credit_once(
        &self,
        user_id: &str,
        amount: u64,
        source: &str,
        reference: &str,
    ) -> Result<CreditOutcome> {
        let applied = self
            .cache
            .apply(
                user_id,
                Mutation {
                    kind: UsageKind::Credit,
                    amount,
                    reason: source,
                    reference: Some(reference),
                },
            )
            .await?;
        let outcome = CreditOutcome::from(applied);
        match outcome {
            CreditOutcome::Applied(balance) => {
                self.persist_credit(user_id, reference, balance).await;
            }
            CreditOutcome::AlreadyApplied(balance) => {
                tracing::debug!(user_id, reference, balance, "credit reference already applied");
            }
        }
        Ok(outcome)
    }

    async fn persist_credit(&self, user_id: &str, reference: &str, balance: u64) {
        match self.cache.flush(user_id).await {
            Ok(
                FlushOutcome::Flushed { version }
                | FlushOutcome::Superseded {
                    flushed: version, ..
                },
            ) => {
                tracing::debug!(user_id, reference, version, "credit persisted");
            }
            Ok(FlushOutcome::Clean | FlushOutcome::NotCached) => {}
            Err(err) => {
                tracing::error!(
                    user_id,
                    reference,
                    balance,
                    error = %err,
                    "credited funds not persisted, left for the next flush"
                );
            }
        }
    }

    /// Refunds a debit whose tool call failed downstream.
    pub async fn rollback(&self, user_id: &str, amount: u64, tool_id: &str) -> Result<u64> {
        self.cache.rollback(user_id, amount, tool_id).await
    }

    /// Grants the configured starter balance once per user. Returns `None`
    /// when no seed balance is configured.
    pub async fn grant_seed_balance(&self, user_id: &str) -> Result<Option<CreditOutcome>> {
        if self.seed_balance == 0 {
            return Ok(None);
        }
        self.credit_once(user_id, self.seed_balance, "seed", SEED_BALANCE_REFERENCE)
            .await
            .map(Some)
    }

    pub async fn usage_log(&self, user_id: &str, since_ms: u64) -> Result<UsageLog> {
        let records = self
            .cache
            .read(user_id, |entry| Arc::<[UsageRecord]>::from(entry.usage_log.as_slice()))
            .await?;
        Ok(UsageLog { records, since_ms })
    }

    pub async fn usage_summary(&self, user_id: &str) -> Result<UsageSummary> {
        self.cache
            .read(user_id, |entry| UsageSummary::from(entry))
            .await
    }

    pub async fn low_balance_warning(&self, user_id: &str) -> Result<Option<LowBalanceWarning>> {
        let floor = self.low_balance_floor;
        let seed_balance = self.seed_balance;
        self.cache
            .read(user_id, |entry| LowBalanceWarning::evaluate(entry, floor, seed_balance))
            .await
    }

    /// Durable copy from the store; recent unflushed mutations are not included.
    pub async fn export_snapshot(&self, user_id: &str) -> Result<Option<LedgerEntry>> {
        self.cache.export_snapshot(user_id).await
    }

    pub async fn health(&self) -> CacheHealth {
        self.cache.health().await
    }

    pub async fn shutdown(&self) -> FlushReport {
        self.cache.shutdown().await
    }
}
