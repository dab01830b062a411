use super::*;
use crate::ledger::{CreditOutcome, MemoryStore, UserLedger};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

#[derive(Default)]
struct TestStore {
    inner: MemoryStore,
    fail_fetches: AtomicBool,
    fetch_delay_ms: AtomicU64,
    fetch_attempts: AtomicUsize,
    fail_stores: AtomicUsize,
    forget_writes: AtomicBool,
    store_attempts: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    store_started: Notify,
}

#[async_trait]
impl LedgerStore for TestStore {
    async fn fetch_ledger(
        &self,
        user_id: &str,
    ) -> std::result::Result<Option<LedgerEntry>, LedgerStoreError> {
        self.fetch_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(LedgerStoreError::Unavailable("fetch refused".to_string()));
        }
        self.inner.fetch_ledger(user_id).await
    }

    async fn store_ledger(
        &self,
        user_id: &str,
        entry: &LedgerEntry,
    ) -> std::result::Result<(), LedgerStoreError> {
        self.store_attempts.fetch_add(1, Ordering::SeqCst);
        self.store_started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| LedgerStoreError::Unavailable("gate closed".to_string()))?
                .forget();
        }
        if self.fail_stores.load(Ordering::SeqCst) > 0 {
            self.fail_stores.fetch_sub(1, Ordering::SeqCst);
            return Err(LedgerStoreError::Unavailable("store refused".to_string()));
        }
        if self.forget_writes.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.store_ledger(user_id, entry).await
    }

    async fn snapshot_ledger(
        &self,
        user_id: &str,
    ) -> std::result::Result<Option<LedgerEntry>, LedgerStoreError> {
        self.inner.snapshot_ledger(user_id).await
    }
}

struct ManualClock(AtomicU64);

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn config(capacity: usize) -> CacheConfig {
    CacheConfig {
        capacity,
        flush_retries: 0,
        flush_retry_delay_ms: 10,
        ..CacheConfig::default()
    }
}

fn cache_over(store: &Arc<TestStore>, config: CacheConfig) -> LedgerCache {
    let store: Arc<dyn LedgerStore> = store.clone();
    LedgerCache::with_clock(
        store,
        config,
        RetentionConfig::default(),
        Arc::new(ManualClock(AtomicU64::new(1_700_000_000_000))),
    )
}

async fn stored(store: &TestStore, user_id: &str) -> Option<(u64, u64)> {
    store
        .inner
        .fetch_ledger(user_id)
        .await
        .expect("fetch")
        .map(|entry| (entry.balance, entry.version))
}

#[tokio::test]
async fn miss_loads_zero_balance_and_hits_reuse_the_entry() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(4));

    let entry = cache.get_or_load("u1").await.expect("load");
    assert_eq!((entry.balance, entry.version), (0, 0));
    cache.get_or_load("u1").await.expect("hit");
    cache.mutate("u1", 10, "purchase").await.expect("credit");

    let health = cache.health().await;
    assert_eq!(health.misses, 1);
    assert_eq!(health.hits, 2);
    assert_eq!(health.cache_size, 1);
    assert_eq!(health.dirty_entries, 1);
    assert_eq!(stored(&store, "u1").await, None);
}

#[tokio::test]
async fn mutate_logs_every_change_and_rollback_is_a_separate_record() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(4));

    assert_eq!(cache.mutate("u1", 100, "purchase").await.unwrap(), 100);
    assert_eq!(cache.mutate("u1", -40, "search").await.unwrap(), 60);
    assert_eq!(cache.rollback("u1", 40, "search").await.unwrap(), 100);

    let entry = cache.get_or_load("u1").await.unwrap();
    assert_eq!(entry.version, 3);
    let kinds: Vec<UsageKind> = entry.usage_log.iter().map(|record| record.kind).collect();
    assert_eq!(
        kinds,
        vec![UsageKind::Credit, UsageKind::Debit, UsageKind::Rollback]
    );
    assert!(
        entry
            .usage_log
            .iter()
            .all(|record| record.ts_ms == 1_700_000_000_000)
    );
}

#[tokio::test]
async fn insufficient_balance_leaves_entry_clean_and_unchanged() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(4));
    cache.mutate("u1", 50, "purchase").await.unwrap();
    cache.flush("u1").await.unwrap();

    let err = cache.mutate("u1", -80, "search").await.unwrap_err();
    assert!(err.is_insufficient_balance());
    assert!(!err.is_transient());

    let entry = cache.get_or_load("u1").await.unwrap();
    assert_eq!((entry.balance, entry.version), (50, 1));
    assert_eq!(entry.usage_log.len(), 1);
    assert_eq!(cache.health().await.dirty_entries, 0);
}

#[tokio::test]
async fn flush_persists_and_clears_dirty_flag() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(4));

    assert_eq!(cache.flush("nobody").await.unwrap(), FlushOutcome::NotCached);

    cache.mutate("u1", 30, "purchase").await.unwrap();
    assert_eq!(
        cache.flush("u1").await.unwrap(),
        FlushOutcome::Flushed { version: 1 }
    );
    assert_eq!(stored(&store, "u1").await, Some((30, 1)));
    assert_eq!(cache.health().await.dirty_entries, 0);

    // Forced flush rewrites a clean entry; a sweep skips it.
    assert_eq!(
        cache.flush("u1").await.unwrap(),
        FlushOutcome::Flushed { version: 1 }
    );
    assert_eq!(cache.flush_dirty().await, FlushReport::default());
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), 2);

    let health = cache.health().await;
    assert_eq!(health.total_flushes, 2);
    assert_eq!(health.last_flush_at_ms, Some(1_700_000_000_000));
}

#[tokio::test]
async fn failed_fetch_is_not_cached_and_never_yields_zero() {
    let store = Arc::new(TestStore::default());
    let mut seeded = LedgerEntry::new("u1");
    seeded.balance = 900;
    seeded.version = 4;
    store.inner.store_ledger("u1", &seeded).await.unwrap();
    store.fail_fetches.store(true, Ordering::SeqCst);

    let cache = cache_over(&store, config(4));
    let err = cache.mutate("u1", -10, "search").await.unwrap_err();
    assert!(matches!(err, LedgerError::PersistenceUnavailable { .. }));
    assert!(err.is_transient());
    assert!(cache.is_empty());

    store.fail_fetches.store(false, Ordering::SeqCst);
    assert_eq!(cache.mutate("u1", -10, "search").await.unwrap(), 890);
}

#[tokio::test(start_paused = true)]
async fn slow_fetch_times_out_as_unavailable() {
    let store = Arc::new(TestStore::default());
    store.fetch_delay_ms.store(60_000, Ordering::SeqCst);
    let cache = cache_over(
        &store,
        CacheConfig {
            store_timeout_ms: 10_000,
            ..config(4)
        },
    );

    let err = cache.get_or_load("u1").await.unwrap_err();
    match err {
        LedgerError::PersistenceUnavailable { reason, .. } => {
            assert!(reason.contains("timed out"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!cache.contains("u1"));

    store.fetch_delay_ms.store(0, Ordering::SeqCst);
    assert_eq!(cache.get_or_load("u1").await.unwrap().balance, 0);
}

#[tokio::test(start_paused = true)]
async fn callers_queued_behind_a_failed_load_share_its_error() {
    let store = Arc::new(TestStore::default());
    store.fetch_delay_ms.store(60_000, Ordering::SeqCst);
    let cache = cache_over(
        &store,
        CacheConfig {
            store_timeout_ms: 100,
            ..config(4)
        },
    );

    let cache = &cache;
    let started = tokio::time::Instant::now();
    let results = join_all((0..4).map(|_| async move {
        let result = cache.get_or_load("u1").await;
        (started.elapsed(), result)
    }))
    .await;

    for (elapsed, result) in &results {
        assert!(
            matches!(result, Err(LedgerError::PersistenceUnavailable { .. })),
            "{result:?}"
        );
        assert!(*elapsed < Duration::from_millis(150), "{elapsed:?}");
    }
    assert_eq!(store.fetch_attempts.load(Ordering::SeqCst), 1);
    assert!(!cache.contains("u1"));
}

#[tokio::test]
async fn corrupt_or_foreign_records_are_rejected() {
    let store = Arc::new(TestStore::default());
    store.inner.insert_raw("u1", "{\"balance\": ").await;
    let foreign = LedgerEntry::new("someone-else").to_json().unwrap();
    store.inner.insert_raw("u2", foreign).await;

    let cache = cache_over(&store, config(4));
    assert!(matches!(
        cache.get_or_load("u1").await.unwrap_err(),
        LedgerError::CorruptEntry { .. }
    ));
    assert!(matches!(
        cache.get_or_load("u2").await.unwrap_err(),
        LedgerError::CorruptEntry { .. }
    ));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn eviction_flushes_the_least_recently_used_dirty_entry() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(2));

    cache.mutate("u1", 10, "purchase").await.unwrap();
    cache.mutate("u2", 20, "purchase").await.unwrap();
    cache.mutate("u3", 30, "purchase").await.unwrap();

    assert_eq!(cache.len(), 2);
    assert!(!cache.contains("u1"));
    assert_eq!(stored(&store, "u1").await, Some((10, 1)));
    assert_eq!(stored(&store, "u2").await, None);

    let reloaded = cache.get_or_load("u1").await.unwrap();
    assert_eq!((reloaded.balance, reloaded.version), (10, 1));
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.health().await.evictions, 2);
}

#[tokio::test]
async fn eviction_drops_clean_entries_without_writing() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(2));

    cache.get_or_load("u1").await.unwrap();
    cache.mutate("u2", 5, "purchase").await.unwrap();
    cache.get_or_load("u3").await.unwrap();

    assert!(!cache.contains("u1"));
    assert!(cache.contains("u2"));
    assert!(cache.contains("u3"));
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), 0);

    // Touching u2 makes u3 the eviction candidate.
    cache.get_or_load("u2").await.unwrap();
    cache.get_or_load("u4").await.unwrap();
    assert!(!cache.contains("u3"));
    assert!(cache.contains("u2"));
}

#[tokio::test]
async fn failed_eviction_flush_keeps_the_dirty_entry_resident() {
    let store = Arc::new(TestStore::default());
    store.fail_stores.store(usize::MAX, Ordering::SeqCst);
    let cache = cache_over(&store, config(1));

    cache.mutate("u1", 10, "purchase").await.unwrap();
    assert_eq!(cache.mutate("u2", 5, "purchase").await.unwrap(), 5);
    assert_eq!(cache.len(), 2);

    let health = cache.health().await;
    assert_eq!(health.dirty_entries, 2);
    assert_eq!(health.failed_flushes, 1);
    assert_eq!(health.evictions, 0);

    store.fail_stores.store(0, Ordering::SeqCst);
    let report = cache.flush_dirty().await;
    assert_eq!(report.flushed, 2);
    assert_eq!(cache.evict_if_needed().await.unwrap(), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(stored(&store, "u1").await, Some((10, 1)));
}

#[tokio::test(start_paused = true)]
async fn cached_mutation_never_waits_on_another_users_eviction() {
    let store = Arc::new(TestStore::default());
    store.fail_stores.store(usize::MAX, Ordering::SeqCst);
    let cache = Arc::new(cache_over(
        &store,
        CacheConfig {
            flush_retries: 1,
            flush_retry_delay_ms: 2_000,
            ..config(1)
        },
    ));

    cache.mutate("a", 10, "purchase").await.unwrap();
    // Loading b tries to flush a out and fails.
    cache.mutate("b", 5, "purchase").await.unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), 2);

    let started = tokio::time::Instant::now();
    assert_eq!(cache.mutate("b", 1, "purchase").await.unwrap(), 6);
    assert_eq!(cache.get_or_load("b").await.unwrap().balance, 6);
    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(cache.len(), 2);

    // The background worker finishes the eviction once the store recovers.
    store.fail_stores.store(0, Ordering::SeqCst);
    assert!(cache.start_background_flush());
    cache.mutate("b", 1, "purchase").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.len(), 1);
    assert!(!cache.contains("a"));
    assert_eq!(stored(&store, "a").await, Some((10, 1)));

    assert_eq!(cache.shutdown().await.flushed, 1);
    assert_eq!(stored(&store, "b").await, Some((7, 3)));
}

#[tokio::test]
async fn hits_drop_clean_overflow_without_touching_the_store() {
    let store = Arc::new(TestStore::default());
    store.fail_stores.store(usize::MAX, Ordering::SeqCst);
    let cache = cache_over(&store, config(1));

    cache.mutate("a", 10, "purchase").await.unwrap();
    cache.mutate("b", 5, "purchase").await.unwrap();
    assert_eq!(cache.len(), 2);

    store.fail_stores.store(0, Ordering::SeqCst);
    cache.flush("a").await.unwrap();
    let attempts = store.store_attempts.load(Ordering::SeqCst);

    cache.get_or_load("b").await.unwrap();
    assert_eq!(cache.len(), 1);
    assert!(!cache.contains("a"));
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), attempts);
}

#[tokio::test]
async fn dirty_eviction_releases_the_entry_during_the_write() {
    let gate = Arc::new(Semaphore::new(0));
    let store = Arc::new(TestStore {
        gate: Some(Arc::clone(&gate)),
        ..TestStore::default()
    });
    let cache = Arc::new(cache_over(&store, config(1)));
    cache.mutate("u1", 10, "purchase").await.unwrap();

    let loading = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.mutate("u2", 20, "purchase").await }
    });
    store.store_started.notified().await;

    // u1 is being written out, yet its own lock is free.
    assert_eq!(cache.mutate("u1", 5, "purchase").await.unwrap(), 15);
    gate.add_permits(1);
    assert_eq!(loading.await.expect("join").unwrap(), 20);

    // The write carried version 1, so the newer u1 stays resident.
    assert!(cache.contains("u1"));
    assert_eq!(stored(&store, "u1").await, Some((10, 1)));
    let health = cache.health().await;
    assert_eq!(health.evictions, 0);
    assert_eq!(health.superseded_flushes, 1);
    assert_eq!(health.dirty_entries, 2);

    gate.add_permits(2);
    assert_eq!(cache.flush_dirty().await.flushed, 2);
    assert_eq!(cache.evict_if_needed().await.unwrap(), 1);
    assert!(cache.contains("u1"));
    assert_eq!(stored(&store, "u1").await, Some((15, 2)));
}

#[tokio::test]
async fn invoice_credit_stands_when_its_flush_fails() {
    let store = Arc::new(TestStore::default());
    store.fail_stores.store(usize::MAX, Ordering::SeqCst);
    let ledger = UserLedger::new(Arc::new(cache_over(&store, config(4))));

    let outcome = ledger
        .credit_once("u1", 300, "purchase", "inv-1")
        .await
        .unwrap();
    assert_eq!(outcome, CreditOutcome::Applied(300));
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), 1);

    let health = ledger.health().await;
    assert_eq!(health.dirty_entries, 1);
    assert_eq!(health.failed_flushes, 1);
}

#[tokio::test]
async fn flush_is_superseded_when_a_mutation_lands_during_the_write() {
    let gate = Arc::new(Semaphore::new(0));
    let store = Arc::new(TestStore {
        gate: Some(Arc::clone(&gate)),
        ..TestStore::default()
    });
    let cache = Arc::new(cache_over(&store, config(4)));
    cache.mutate("u1", 100, "purchase").await.unwrap();

    let flushing = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.flush("u1").await }
    });
    store.store_started.notified().await;

    // The entry lock is free while the store call is parked.
    assert_eq!(cache.mutate("u1", -30, "search").await.unwrap(), 70);
    gate.add_permits(1);

    let outcome = flushing.await.expect("join").expect("flush");
    assert_eq!(
        outcome,
        FlushOutcome::Superseded {
            flushed: 1,
            current: 2
        }
    );
    let health = cache.health().await;
    assert_eq!(health.dirty_entries, 1);
    assert_eq!(health.superseded_flushes, 1);

    gate.add_permits(1);
    assert_eq!(
        cache.flush_dirty().await,
        FlushReport {
            flushed: 1,
            superseded: 0,
            failed: 0
        }
    );
    assert_eq!(stored(&store, "u1").await, Some((70, 2)));
    assert_eq!(cache.health().await.dirty_entries, 0);
}

#[tokio::test(start_paused = true)]
async fn store_failures_are_retried_before_giving_up() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(
        &store,
        CacheConfig {
            flush_retries: 1,
            flush_retry_delay_ms: 2_000,
            ..config(4)
        },
    );
    cache.mutate("u1", 10, "purchase").await.unwrap();

    store.fail_stores.store(1, Ordering::SeqCst);
    assert_eq!(
        cache.flush("u1").await.unwrap(),
        FlushOutcome::Flushed { version: 1 }
    );
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), 2);

    cache.mutate("u1", 5, "purchase").await.unwrap();
    store.fail_stores.store(2, Ordering::SeqCst);
    let err = cache.flush("u1").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(store.store_attempts.load(Ordering::SeqCst), 4);

    let health = cache.health().await;
    assert_eq!(health.failed_flushes, 1);
    assert_eq!(health.dirty_entries, 1);
    assert_eq!(stored(&store, "u1").await, Some((10, 1)));
}

#[tokio::test]
async fn reload_older_than_flushed_version_is_refused() {
    let store = Arc::new(TestStore::default());
    store.forget_writes.store(true, Ordering::SeqCst);
    let cache = cache_over(&store, config(1));

    cache.mutate("u1", 50, "purchase").await.unwrap();
    cache.mutate("u2", 1, "purchase").await.unwrap();
    assert!(!cache.contains("u1"));

    let err = cache.get_or_load("u1").await.unwrap_err();
    assert!(matches!(err, LedgerError::PersistenceUnavailable { .. }));
    assert!(!cache.contains("u1"));

    let mut durable = LedgerEntry::new("u1");
    durable.balance = 50;
    durable.version = 1;
    store.inner.store_ledger("u1", &durable).await.unwrap();
    assert_eq!(cache.get_or_load("u1").await.unwrap().balance, 50);
}

#[tokio::test(start_paused = true)]
async fn background_flush_runs_on_interval_until_shutdown() {
    let store = Arc::new(TestStore::default());
    let cache = Arc::new(cache_over(&store, config(4)));
    assert!(cache.start_background_flush());
    assert!(!cache.start_background_flush());

    cache.mutate("u1", 25, "purchase").await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(stored(&store, "u1").await, None);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(stored(&store, "u1").await, Some((25, 1)));

    let health = cache.health().await;
    assert!(health.background_flush_running);
    assert_eq!(health.dirty_entries, 0);

    assert_eq!(cache.shutdown().await, FlushReport::default());
    assert!(!cache.health().await.background_flush_running);
    assert!(!cache.start_background_flush());
}

#[tokio::test]
async fn shutdown_flushes_everything_and_rejects_mutations() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(4));
    cache.mutate("u1", 10, "purchase").await.unwrap();
    cache.mutate("u2", 20, "purchase").await.unwrap();

    let report = cache.shutdown().await;
    assert_eq!(report.flushed, 2);
    assert_eq!(stored(&store, "u1").await, Some((10, 1)));
    assert_eq!(stored(&store, "u2").await, Some((20, 1)));

    let err = cache.mutate("u1", 1, "purchase").await.unwrap_err();
    assert!(matches!(err, LedgerError::Closed));
    assert_eq!(cache.get_or_load("u1").await.unwrap().balance, 10);
}

#[tokio::test]
async fn export_snapshot_reads_the_store_not_the_cache() {
    let store = Arc::new(TestStore::default());
    let cache = cache_over(&store, config(4));

    assert_eq!(cache.export_snapshot("u1").await.unwrap(), None);
    cache.mutate("u1", 10, "purchase").await.unwrap();
    assert_eq!(cache.export_snapshot("u1").await.unwrap(), None);

    cache.flush("u1").await.unwrap();
    let snapshot = cache.export_snapshot("u1").await.unwrap().expect("some");
    assert_eq!((snapshot.balance, snapshot.version), (10, 1));
}

#[test]
fn watermarks_are_bounded() {
    let mut table = Table::default();
    for i in 0..10 {
        table.remember_flushed(&format!("u{i}"), i, 4);
    }
    assert_eq!(table.watermarks.len(), 4);
    assert!(table.watermarks.contains_key("u9"));
    assert!(!table.watermarks.contains_key("u0"));

    table.forget_flushed("u9");
    assert!(!table.watermarks.contains_key("u9"));
    assert_eq!(table.watermark_order.len(), 3);
}
