//! Write-behind ledger cache.
//!
//! Every resident entry sits behind its own async mutex, so mutations for one
//! user are strictly ordered while different users proceed in parallel. The
//! table lock only guards membership and LRU bookkeeping and is never held
//! across an `.await`.
//!
//! Lock order is table -> flush gate -> entry. Paths that already hold an
//! entry lock only ever `try_lock` the others.
//!
//! Only a cache miss may wait on another user's eviction flush. Hits drop
//! clean entries in place and leave dirty overflow to the background worker.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt as _;
use futures_util::stream;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMappedMutexGuard, OwnedMutexGuard};

use super::entry::{Applied, Mutation};
use super::flush::FlushWorker;
use super::observability::CacheStats;
use super::{
    CacheConfig, CacheHealth, Clock, LedgerEntry, LedgerStore, LedgerStoreError, RetentionConfig,
    SystemClock, UsageKind,
};
use crate::error::{LedgerError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    Flushed { version: u64 },
    /// Nothing to write: the entry was already clean.
    Clean,
    /// The write succeeded but a newer mutation landed meanwhile; the entry
    /// stays dirty and the next sweep persists the newer state.
    Superseded { flushed: u64, current: u64 },
    NotCached,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub flushed: usize,
    pub superseded: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct CachedLedger {
    entry: LedgerEntry,
    dirty: bool,
}

#[derive(Debug)]
enum SlotState {
    Loading,
    Ready(CachedLedger),
    /// Removed from the table; holders of a stale handle must look up again.
    Evicted,
    /// The load failed; callers queued behind it get the same error.
    Failed(LedgerError),
}

impl SlotState {
    fn ready_mut(&mut self) -> Option<&mut CachedLedger> {
        match self {
            Self::Ready(ledger) => Some(ledger),
            Self::Loading | Self::Evicted | Self::Failed(_) => None,
        }
    }
}

type SlotCell = Arc<AsyncMutex<SlotState>>;
type FlushGate = Arc<AsyncMutex<()>>;
type ReadyGuard = OwnedMappedMutexGuard<SlotState, CachedLedger>;

#[derive(Debug)]
struct Slot {
    state: SlotCell,
    flush_gate: FlushGate,
    last_accessed: u64,
    inserted: u64,
}

#[derive(Debug, Default)]
struct Table {
    slots: HashMap<String, Slot>,
    /// Last version flushed for users that have left the cache.
    watermarks: HashMap<String, u64>,
    watermark_order: VecDeque<String>,
}

impl Table {
    fn detach(&mut self, user_id: &str, cell: &SlotCell) {
        let owned = self
            .slots
            .get(user_id)
            .is_some_and(|slot| Arc::ptr_eq(&slot.state, cell));
        if owned {
            self.slots.remove(user_id);
        }
    }

    fn remember_flushed(&mut self, user_id: &str, version: u64, limit: usize) {
        if self.watermarks.insert(user_id.to_string(), version).is_none() {
            self.watermark_order.push_back(user_id.to_string());
        }
        while self.watermarks.len() > limit {
            let Some(oldest) = self.watermark_order.pop_front() else {
                break;
            };
            self.watermarks.remove(&oldest);
        }
    }

    fn forget_flushed(&mut self, user_id: &str) {
        if self.watermarks.remove(user_id).is_some() {
            self.watermark_order.retain(|candidate| candidate != user_id);
        }
    }
}

struct DirtyVictim {
    user_id: String,
    cell: SlotCell,
    _gate: OwnedMutexGuard<()>,
    snapshot: LedgerEntry,
}

enum Victim {
    Clean,
    Dirty(DirtyVictim),
    None,
}

pub struct LedgerCache {
    store: Arc<dyn LedgerStore>,
    config: CacheConfig,
    retention: RetentionConfig,
    clock: Arc<dyn Clock>,
    table: Mutex<Table>,
    tick: AtomicU64,
    closed: AtomicBool,
    worker: Mutex<Option<FlushWorker>>,
    eviction_wanted: Arc<Notify>,
    stats: CacheStats,
}

impl std::fmt::Debug for LedgerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerCache")
            .field("config", &self.config)
            .field("retention", &self.retention)
            .field("len", &self.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl LedgerCache {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: CacheConfig,
        retention: RetentionConfig,
    ) -> Self {
        Self::with_clock(store, config, retention, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn LedgerStore>,
        config: CacheConfig,
        retention: RetentionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            config,
            retention,
            clock,
            table: Mutex::new(Table::default()),
            tick: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            worker: Mutex::new(None),
            eviction_wanted: Arc::new(Notify::new()),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn retention(&self) -> &RetentionConfig {
        &self.retention
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_epoch_millis()
    }

    pub fn len(&self) -> usize {
        self.table().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().slots.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.table().slots.contains_key(user_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn watermark_limit(&self) -> usize {
        self.config.capacity.saturating_mul(8).max(64)
    }

    /// Returns the resident entry, loading it from the store on a miss.
    pub async fn get_or_load(&self, user_id: &str) -> Result<LedgerEntry> {
        self.read(user_id, LedgerEntry::clone).await
    }

    pub(crate) async fn read<R, F>(&self, user_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&LedgerEntry) -> R + Send,
        R: Send,
    {
        let (value, loaded) = {
            let (ledger, loaded) = self.acquire(user_id).await?;
            (f(&ledger.entry), loaded)
        };
        self.settle_capacity(loaded).await;
        Ok(value)
    }

    /// Applies `delta` to the balance: negative values debit, others credit.
    pub async fn mutate(&self, user_id: &str, delta: i64, reason: &str) -> Result<u64> {
        let kind = if delta < 0 {
            UsageKind::Debit
        } else {
            UsageKind::Credit
        };
        let applied = self
            .apply(
                user_id,
                Mutation {
                    kind,
                    amount: delta.unsigned_abs(),
                    reason,
                    reference: None,
                },
            )
            .await?;
        Ok(applied.balance())
    }

    /// Compensates an earlier debit with a separately logged credit.
    pub async fn rollback(&self, user_id: &str, amount: u64, reason: &str) -> Result<u64> {
        let applied = self
            .apply(
                user_id,
                Mutation {
                    kind: UsageKind::Rollback,
                    amount,
                    reason,
                    reference: None,
                },
            )
            .await?;
        Ok(applied.balance())
    }

    pub(crate) async fn apply(&self, user_id: &str, mutation: Mutation<'_>) -> Result<Applied> {
        if self.is_closed() {
            return Err(LedgerError::Closed);
        }

        let (result, loaded) = {
            let (mut ledger, loaded) = self.acquire(user_id).await?;
            // Re-checked under the entry lock so nothing lands after the final flush.
            if self.is_closed() {
                return Err(LedgerError::Closed);
            }
            let now_ms = self.clock.now_epoch_millis();
            let result = ledger.entry.apply(&mutation, now_ms, &self.retention);
            if let Ok(Applied::Mutated(balance)) = result {
                ledger.dirty = true;
                tracing::debug!(
                    user_id,
                    kind = ?mutation.kind,
                    amount = mutation.amount,
                    balance,
                    version = ledger.entry.version,
                    "ledger mutated"
                );
            }
            (result, loaded)
        };

        self.settle_capacity(loaded).await;
        result
    }

    /// Returns the ready entry and whether this call loaded it from the store.
    async fn acquire(&self, user_id: &str) -> Result<(ReadyGuard, bool)> {
        loop {
            let (cell, loader) = {
                let mut table = self.table();
                let tick = self.next_tick();
                if let Some(slot) = table.slots.get_mut(user_id) {
                    slot.last_accessed = tick;
                    (Arc::clone(&slot.state), None)
                } else {
                    let cell: SlotCell = Arc::new(AsyncMutex::new(SlotState::Loading));
                    let Ok(guard) = Arc::clone(&cell).try_lock_owned() else {
                        continue;
                    };
                    table.slots.insert(
                        user_id.to_string(),
                        Slot {
                            state: Arc::clone(&cell),
                            flush_gate: Arc::new(AsyncMutex::new(())),
                            last_accessed: tick,
                            inserted: tick,
                        },
                    );
                    (cell, Some(guard))
                }
            };

            let loaded = loader.is_some();
            let guard = match loader {
                Some(mut guard) => {
                    self.stats.record_miss();
                    self.load_into(user_id, &cell, &mut guard).await?;
                    guard
                }
                None => {
                    let guard = cell.lock_owned().await;
                    match &*guard {
                        SlotState::Ready(_) => self.stats.record_hit(),
                        SlotState::Failed(err) => return Err(err.clone()),
                        SlotState::Loading | SlotState::Evicted => {}
                    }
                    guard
                }
            };

            if let Ok(ready) = OwnedMutexGuard::try_map(guard, SlotState::ready_mut) {
                return Ok((ready, loaded));
            }
        }
    }

    async fn load_into(
        &self,
        user_id: &str,
        cell: &SlotCell,
        guard: &mut OwnedMutexGuard<SlotState>,
    ) -> Result<()> {
        match self.fetch_validated(user_id).await {
            Ok(entry) => {
                **guard = SlotState::Ready(CachedLedger {
                    entry,
                    dirty: false,
                });
                Ok(())
            }
            Err(err) => {
                self.table().detach(user_id, cell);
                **guard = SlotState::Failed(err.clone());
                tracing::warn!(user_id, error = %err, "ledger load failed");
                Err(err)
            }
        }
    }

    /// Never substitutes a zero balance for a record the store failed to
    /// return, or for one that is older than what this cache last flushed.
    async fn fetch_validated(&self, user_id: &str) -> Result<LedgerEntry> {
        let fetched = self
            .call_store(user_id, "fetch_ledger", self.store.fetch_ledger(user_id))
            .await?;

        if let Some(entry) = &fetched {
            entry
                .validate(user_id)
                .map_err(|reason| LedgerError::CorruptEntry {
                    user_id: user_id.to_string(),
                    reason,
                })?;
        }

        let fetched_version = fetched.as_ref().map_or(0, |entry| entry.version);
        let mut table = self.table();
        if let Some(flushed) = table.watermarks.get(user_id).copied() {
            if fetched_version < flushed {
                return Err(LedgerError::PersistenceUnavailable {
                    user_id: user_id.to_string(),
                    reason: format!(
                        "store returned version {fetched_version}, older than flushed version {flushed}"
                    ),
                });
            }
        }
        table.forget_flushed(user_id);
        drop(table);

        Ok(fetched.unwrap_or_else(|| LedgerEntry::new(user_id)))
    }

    async fn call_store<T>(
        &self,
        user_id: &str,
        op: &str,
        call: impl Future<Output = std::result::Result<T, LedgerStoreError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.store_timeout(), call).await {
            Ok(result) => result.map_err(|err| LedgerError::from_store(user_id, err)),
            Err(_) => Err(LedgerError::PersistenceUnavailable {
                user_id: user_id.to_string(),
                reason: format!(
                    "{op} timed out after {}ms",
                    self.config.store_timeout_ms
                ),
            }),
        }
    }

    async fn store_with_retry(&self, user_id: &str, entry: &LedgerEntry) -> Result<()> {
        let attempts = self.config.flush_retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            let result = self
                .call_store(user_id, "store_ledger", self.store.store_ledger(user_id, entry))
                .await;
            match result {
                Ok(()) => {
                    self.stats.record_flush(self.clock.now_epoch_millis());
                    return Ok(());
                }
                Err(err) if attempt < attempts => {
                    tracing::warn!(
                        user_id,
                        attempt,
                        attempts,
                        error = %err,
                        "ledger flush failed, retrying"
                    );
                    tokio::time::sleep(self.config.flush_retry_delay()).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.stats.record_failed_flush();
                    tracing::warn!(user_id, attempts, error = %err, "ledger flush failed");
                    return Err(err);
                }
            }
        }
    }

    fn handles(&self, user_id: &str) -> Option<(SlotCell, FlushGate)> {
        self.table()
            .slots
            .get(user_id)
            .map(|slot| (Arc::clone(&slot.state), Arc::clone(&slot.flush_gate)))
    }

    /// Persists one resident entry now, dirty or not.
    pub async fn flush(&self, user_id: &str) -> Result<FlushOutcome> {
        let Some((cell, gate)) = self.handles(user_id) else {
            return Ok(FlushOutcome::NotCached);
        };
        self.flush_slot(user_id, &cell, &gate, true).await
    }

    /// The entry lock is held only to copy the entry and to clear the flag,
    /// never during the store call itself.
    async fn flush_slot(
        &self,
        user_id: &str,
        cell: &SlotCell,
        gate: &FlushGate,
        force: bool,
    ) -> Result<FlushOutcome> {
        let _gate = gate.lock().await;

        let snapshot = {
            let state = cell.lock().await;
            match &*state {
                SlotState::Ready(ledger) if force || ledger.dirty => ledger.entry.clone(),
                SlotState::Ready(_) => return Ok(FlushOutcome::Clean),
                SlotState::Loading | SlotState::Evicted | SlotState::Failed(_) => {
                    return Ok(FlushOutcome::NotCached);
                }
            }
        };

        self.store_with_retry(user_id, &snapshot).await?;

        match self.compare_and_clear(user_id, cell, snapshot.version).await {
            Ok(()) => Ok(FlushOutcome::Flushed {
                version: snapshot.version,
            }),
            Err(LedgerError::VersionConflict {
                flushed, current, ..
            }) => {
                self.stats.record_superseded_flush();
                tracing::debug!(user_id, flushed, current, "flush superseded by newer mutation");
                Ok(FlushOutcome::Superseded { flushed, current })
            }
            Err(err) => Err(err),
        }
    }

    async fn compare_and_clear(&self, user_id: &str, cell: &SlotCell, flushed: u64) -> Result<()> {
        let mut state = cell.lock().await;
        match &mut *state {
            SlotState::Ready(ledger) if ledger.entry.version == flushed => {
                ledger.dirty = false;
                Ok(())
            }
            SlotState::Ready(ledger) => Err(LedgerError::VersionConflict {
                user_id: user_id.to_string(),
                flushed,
                current: ledger.entry.version,
            }),
            SlotState::Loading | SlotState::Evicted | SlotState::Failed(_) => Ok(()),
        }
    }

    /// Flushes every dirty entry; failures stay dirty for the next sweep.
    pub async fn flush_dirty(&self) -> FlushReport {
        let handles: Vec<(String, SlotCell, FlushGate)> = self
            .table()
            .slots
            .iter()
            .map(|(user_id, slot)| {
                (
                    user_id.clone(),
                    Arc::clone(&slot.state),
                    Arc::clone(&slot.flush_gate),
                )
            })
            .collect();

        let outcomes: Vec<Result<FlushOutcome>> = stream::iter(handles)
            .map(|(user_id, cell, gate)| async move {
                self.flush_slot(&user_id, &cell, &gate, false).await
            })
            .buffer_unordered(self.config.flush_concurrency.max(1))
            .collect()
            .await;

        let mut report = FlushReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(FlushOutcome::Flushed { .. }) => report.flushed += 1,
                Ok(FlushOutcome::Superseded { .. }) => report.superseded += 1,
                Ok(FlushOutcome::Clean | FlushOutcome::NotCached) => {}
                Err(_) => report.failed += 1,
            }
        }
        report
    }

    /// A miss may flush a dirty victim inline. A hit never waits on the store:
    /// it drops clean overflow and hands the rest to the background worker.
    async fn settle_capacity(&self, loaded: bool) {
        if loaded {
            self.evict_quietly().await;
        } else if self.evict_clean() {
            self.eviction_wanted.notify_one();
        }
    }

    /// Drops clean entries from the overflow window. Returns `true` when the
    /// cache is still over capacity afterwards.
    fn evict_clean(&self) -> bool {
        let mut table = self.table();
        while table.slots.len() > self.config.capacity {
            if !matches!(self.pick_victim(&mut table, false), Victim::Clean) {
                return true;
            }
        }
        false
    }

    pub(crate) async fn evict_quietly(&self) {
        if let Err(err) = self.evict_if_needed().await {
            tracing::warn!(error = %err, "ledger eviction deferred");
        }
    }

    /// Shrinks the cache back to capacity. Least-recently-used clean entries
    /// go first; a dirty entry is flushed before it is dropped, and a failed
    /// flush keeps it resident.
    pub async fn evict_if_needed(&self) -> Result<usize> {
        let mut evicted = 0;
        loop {
            let victim = {
                let mut table = self.table();
                if table.slots.len() <= self.config.capacity {
                    return Ok(evicted);
                }
                self.pick_victim(&mut table, true)
            };

            match victim {
                Victim::Clean => evicted += 1,
                Victim::Dirty(victim) => {
                    if !self.evict_dirty(victim).await? {
                        return Ok(evicted);
                    }
                    evicted += 1;
                }
                Victim::None => {
                    tracing::debug!(
                        size = self.len(),
                        capacity = self.config.capacity,
                        "every eviction candidate is busy"
                    );
                    return Ok(evicted);
                }
            }
        }
    }

    /// Scans entries oldest first. Within the overflow window the first clean
    /// entry is dropped on the spot, otherwise the oldest dirty one is handed
    /// back for flushing. Newer entries are only considered when everything in
    /// the window is busy. With `allow_dirty` unset only the window is scanned.
    fn pick_victim(&self, table: &mut Table, allow_dirty: bool) -> Victim {
        let window = table.slots.len().saturating_sub(self.config.capacity);
        let mut candidates: Vec<(u64, u64, String)> = table
            .slots
            .iter()
            .map(|(user_id, slot)| (slot.last_accessed, slot.inserted, user_id.clone()))
            .collect();
        candidates.sort_unstable();

        let mut dirty_victim: Option<DirtyVictim> = None;
        for (position, (_, _, user_id)) in candidates.into_iter().enumerate() {
            if position >= window && (dirty_victim.is_some() || !allow_dirty) {
                break;
            }
            let Some(slot) = table.slots.get(&user_id) else {
                continue;
            };
            let cell = Arc::clone(&slot.state);
            let gate = Arc::clone(&slot.flush_gate);
            let Ok(mut state) = Arc::clone(&cell).try_lock_owned() else {
                continue;
            };
            let status = match &*state {
                SlotState::Ready(ledger) => Some((ledger.dirty, ledger.entry.version)),
                SlotState::Loading | SlotState::Evicted | SlotState::Failed(_) => None,
            };

            match status {
                Some((false, version)) => {
                    table.slots.remove(&user_id);
                    table.remember_flushed(&user_id, version, self.watermark_limit());
                    *state = SlotState::Evicted;
                    self.stats.record_eviction();
                    tracing::debug!(user_id = %user_id, version, "evicted clean ledger entry");
                    return Victim::Clean;
                }
                Some((true, _)) if allow_dirty && dirty_victim.is_none() => {
                    if let (Ok(gate), SlotState::Ready(ledger)) = (gate.try_lock_owned(), &*state) {
                        dirty_victim = Some(DirtyVictim {
                            snapshot: ledger.entry.clone(),
                            user_id,
                            cell: Arc::clone(&cell),
                            _gate: gate,
                        });
                    }
                }
                _ => {}
            }
        }

        dirty_victim.map_or(Victim::None, Victim::Dirty)
    }

    /// Writes a copy of the victim with its entry lock released, then evicts
    /// only if no mutation landed meanwhile. Returns `false` when a newer
    /// version kept the entry resident.
    async fn evict_dirty(&self, victim: DirtyVictim) -> Result<bool> {
        let DirtyVictim {
            user_id,
            cell,
            _gate,
            snapshot,
        } = victim;

        self.store_with_retry(&user_id, &snapshot).await?;

        let mut state = cell.lock().await;
        match &*state {
            SlotState::Ready(ledger) if ledger.entry.version == snapshot.version => {}
            SlotState::Ready(ledger) => {
                self.stats.record_superseded_flush();
                tracing::debug!(
                    user_id = %user_id,
                    flushed = snapshot.version,
                    current = ledger.entry.version,
                    "eviction skipped, entry changed during flush"
                );
                return Ok(false);
            }
            SlotState::Loading | SlotState::Evicted | SlotState::Failed(_) => return Ok(false),
        }

        {
            let mut table = self.table();
            table.detach(&user_id, &cell);
            table.remember_flushed(&user_id, snapshot.version, self.watermark_limit());
        }
        *state = SlotState::Evicted;
        self.stats.record_eviction();
        tracing::debug!(
            user_id = %user_id,
            version = snapshot.version,
            "flushed and evicted dirty ledger entry"
        );
        Ok(true)
    }

    /// Reads the durable copy straight from the store, bypassing the cache.
    pub async fn export_snapshot(&self, user_id: &str) -> Result<Option<LedgerEntry>> {
        let snapshot = self
            .call_store(
                user_id,
                "snapshot_ledger",
                self.store.snapshot_ledger(user_id),
            )
            .await?;
        if let Some(entry) = &snapshot {
            entry
                .validate(user_id)
                .map_err(|reason| LedgerError::CorruptEntry {
                    user_id: user_id.to_string(),
                    reason,
                })?;
        }
        Ok(snapshot)
    }

    pub async fn health(&self) -> CacheHealth {
        let cells: Vec<SlotCell> = self
            .table()
            .slots
            .values()
            .map(|slot| Arc::clone(&slot.state))
            .collect();

        let mut dirty_entries = 0;
        for cell in &cells {
            if matches!(&*cell.lock().await, SlotState::Ready(ledger) if ledger.dirty) {
                dirty_entries += 1;
            }
        }

        let mut health = CacheHealth {
            capacity: self.config.capacity,
            cache_size: cells.len(),
            dirty_entries,
            background_flush_running: self.background_flush_running(),
            ..CacheHealth::default()
        };
        self.stats.fill(&mut health);
        health
    }

    /// Starts the periodic flush sweep on the current tokio runtime. Returns
    /// `false` if a sweep is already running or the cache is shut down.
    pub fn start_background_flush(self: &Arc<Self>) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.as_ref().is_some_and(FlushWorker::is_running) {
            return false;
        }
        *worker = Some(FlushWorker::spawn(
            Arc::downgrade(self),
            self.config.flush_interval(),
            Arc::clone(&self.eviction_wanted),
        ));
        true
    }

    pub fn background_flush_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(FlushWorker::is_running)
    }

    /// Stops the sweep, rejects further mutations and flushes everything
    /// still dirty. Entries whose final flush failed remain in memory and are
    /// counted in the report.
    pub async fn shutdown(&self) -> FlushReport {
        self.closed.store(true, Ordering::Release);

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            worker.stop().await;
        }

        let report = self.flush_dirty().await;
        tracing::info!(
            flushed = report.flushed,
            failed = report.failed,
            "ledger cache shut down"
        );
        report
    }
}

#[cfg(test)]
mod tests;
