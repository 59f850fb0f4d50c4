//! Snapshot Cache
//!
//! Per-instrument latest-state cache with an exchange index and
//! staleness-based eviction.
//!
//! # Design
//!
//! The cache tracks:
//! - The latest snapshot for every instrument seen on the feed
//! - Which instruments belong to which exchange
//! - Update and read counters
//!
//! Both maps are sharded (`DashMap`), so writers to different instruments
//! rarely contend and no operation takes a map-wide lock. Write paths lock
//! the snapshot entry first and the exchange index entry second; readers
//! never hold two guards at once.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use super::clock::SharedClock;
use super::market::{ExchangeId, InstrumentId, Snapshot, TickEvent};

/// Default staleness window.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(300);

// =============================================================================
// Snapshot Store
// =============================================================================

/// Concurrent latest-snapshot cache.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use market_fanout::domain::cache::SnapshotStore;
/// use market_fanout::domain::clock::SystemClock;
/// use market_fanout::domain::market::{Quote, TickEvent};
///
/// let store = SnapshotStore::new(Arc::new(SystemClock));
/// store.update(TickEvent::new("rb2405", "SHFE", Quote::default()));
///
/// let snapshot = store.get("rb2405").unwrap();
/// assert_eq!(snapshot.exchange_id, "SHFE");
/// assert_eq!(store.get_by_exchange("SHFE").len(), 1);
/// ```
pub struct SnapshotStore {
    snapshots: DashMap<InstrumentId, Snapshot>,
    exchange_index: DashMap<ExchangeId, HashSet<InstrumentId>>,
    clock: SharedClock,
    staleness_window: Duration,
    total_updates: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl SnapshotStore {
    /// Create a store with the default staleness window.
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self::with_staleness_window(clock, DEFAULT_STALENESS_WINDOW)
    }

    /// Create a store with a custom staleness window.
    #[must_use]
    pub fn with_staleness_window(clock: SharedClock, staleness_window: Duration) -> Self {
        Self {
            snapshots: DashMap::new(),
            exchange_index: DashMap::new(),
            clock,
            staleness_window,
            total_updates: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// The configured staleness window.
    #[must_use]
    pub const fn staleness_window(&self) -> Duration {
        self.staleness_window
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Apply a tick, creating the snapshot on first sight.
    ///
    /// The exchange association is first-write-wins. Completes without
    /// waiting on anything but the instrument's own shard.
    pub fn update(&self, tick: TickEvent) {
        let now = self.clock.now();

        match self.snapshots.entry(tick.instrument_id.clone()) {
            Entry::Occupied(mut entry) => {
                let snapshot = entry.get_mut();
                if snapshot.exchange_id != tick.exchange_id {
                    tracing::debug!(
                        instrument = %snapshot.instrument_id,
                        known = %snapshot.exchange_id,
                        reported = %tick.exchange_id,
                        "Ignoring exchange change for known instrument"
                    );
                }
                snapshot.apply(tick, now);
            }
            Entry::Vacant(entry) => {
                let snapshot = entry.insert(Snapshot::from_tick(tick, now));
                // Index while the entry is still locked so a concurrent sweep
                // cannot interleave between record and index.
                self.exchange_index
                    .entry(snapshot.exchange_id.clone())
                    .or_default()
                    .insert(snapshot.instrument_id.clone());
            }
        }

        self.total_updates.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove every snapshot stale beyond the window.
    ///
    /// Returns the number of evicted snapshots. Each removal locks only the
    /// instrument being removed, and staleness is re-checked under that lock.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let window = self.staleness_window;

        let candidates: Vec<InstrumentId> = self
            .snapshots
            .iter()
            .filter(|entry| entry.is_stale_at(now, window))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for instrument_id in candidates {
            if let Entry::Occupied(entry) = self.snapshots.entry(instrument_id)
                && entry.get().is_stale_at(now, window)
            {
                let exchange_id = entry.get().exchange_id.clone();
                self.unindex(&exchange_id, entry.key());
                entry.remove();
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::info!(evicted, "Evicted stale snapshots");
        }

        evicted
    }

    /// Drop everything and reset counters.
    pub fn clear(&self) {
        tracing::info!("Clearing snapshot cache");
        self.snapshots.clear();
        self.exchange_index.clear();
        self.total_updates.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
    }

    fn unindex(&self, exchange_id: &str, instrument_id: &str) {
        if let Entry::Occupied(mut members) = self.exchange_index.entry(exchange_id.to_string()) {
            members.get_mut().remove(instrument_id);
            if members.get().is_empty() {
                members.remove();
            }
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Copy of the snapshot for `instrument_id`.
    #[must_use]
    pub fn get(&self, instrument_id: &str) -> Option<Snapshot> {
        let snapshot = self.snapshots.get(instrument_id).map(|entry| entry.clone());
        let counter = if snapshot.is_some() {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        snapshot
    }

    /// Whether the cache currently holds `instrument_id`.
    #[must_use]
    pub fn has_instrument(&self, instrument_id: &str) -> bool {
        self.snapshots.contains_key(instrument_id)
    }

    /// All snapshots for one exchange.
    #[must_use]
    pub fn get_by_exchange(&self, exchange_id: &str) -> Vec<Snapshot> {
        self.instruments_by_exchange(exchange_id)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// All snapshots for several exchanges.
    #[must_use]
    pub fn get_by_exchanges<'a>(
        &self,
        exchange_ids: impl IntoIterator<Item = &'a String>,
    ) -> Vec<Snapshot> {
        exchange_ids
            .into_iter()
            .flat_map(|exchange_id| self.get_by_exchange(exchange_id))
            .collect()
    }

    /// Snapshots for the listed instruments that are present.
    #[must_use]
    pub fn get_by_instruments<'a>(
        &self,
        instrument_ids: impl IntoIterator<Item = &'a String>,
    ) -> Vec<Snapshot> {
        instrument_ids
            .into_iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Every non-stale snapshot.
    #[must_use]
    pub fn get_active(&self) -> Vec<Snapshot> {
        let now = self.clock.now();
        self.snapshots
            .iter()
            .filter(|entry| !entry.is_stale_at(now, self.staleness_window))
            .map(|entry| entry.clone())
            .collect()
    }

    /// Non-stale snapshots for one exchange.
    #[must_use]
    pub fn get_active_by_exchange(&self, exchange_id: &str) -> Vec<Snapshot> {
        let now = self.clock.now();
        self.instruments_by_exchange(exchange_id)
            .iter()
            .filter_map(|id| self.snapshots.get(id).map(|entry| entry.clone()))
            .filter(|snapshot| !snapshot.is_stale_at(now, self.staleness_window))
            .collect()
    }

    /// Non-stale snapshots for several exchanges.
    #[must_use]
    pub fn get_active_by_exchanges<'a>(
        &self,
        exchange_ids: impl IntoIterator<Item = &'a String>,
    ) -> Vec<Snapshot> {
        exchange_ids
            .into_iter()
            .flat_map(|exchange_id| self.get_active_by_exchange(exchange_id))
            .collect()
    }

    /// Whether `snapshot` is older than `window`.
    #[must_use]
    pub fn is_stale(&self, snapshot: &Snapshot, window: Duration) -> bool {
        snapshot.is_stale_at(self.clock.now(), window)
    }

    /// Exchanges with at least one cached instrument.
    #[must_use]
    pub fn exchanges(&self) -> Vec<ExchangeId> {
        self.exchange_index
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Instrument ids cached under `exchange_id`.
    #[must_use]
    pub fn instruments_by_exchange(&self, exchange_id: &str) -> Vec<InstrumentId> {
        self.exchange_index
            .get(exchange_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Exchange an instrument was first observed on.
    #[must_use]
    pub fn exchange_of(&self, instrument_id: &str) -> Option<ExchangeId> {
        self.snapshots
            .get(instrument_id)
            .map(|entry| entry.exchange_id.clone())
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let cache_hits = self.cache_hits.load(Ordering::Relaxed);
        let cache_misses = self.cache_misses.load(Ordering::Relaxed);

        let active_instruments = self
            .snapshots
            .iter()
            .filter(|entry| !entry.is_stale_at(now, self.staleness_window))
            .count();

        let instruments_by_exchange = self
            .exchange_index
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();

        CacheStats {
            total_instruments: self.snapshots.len(),
            active_instruments,
            total_exchanges: self.exchange_index.len(),
            total_updates: self.total_updates.load(Ordering::Relaxed),
            cache_hits,
            cache_misses,
            hit_rate_percent: percentage(cache_hits, cache_hits + cache_misses),
            instruments_by_exchange,
        }
    }

    /// Total updates applied, read without touching the data path.
    #[must_use]
    pub fn total_updates(&self) -> u64 {
        self.total_updates.load(Ordering::Relaxed)
    }

    /// Number of cached instruments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Cached instruments.
    pub total_instruments: usize,
    /// Cached instruments that are not stale.
    pub active_instruments: usize,
    /// Exchanges with cached instruments.
    pub total_exchanges: usize,
    /// Updates applied.
    pub total_updates: u64,
    /// Reads that found a snapshot.
    pub cache_hits: u64,
    /// Reads that found nothing.
    pub cache_misses: u64,
    /// Hits as a percentage of reads.
    pub hit_rate_percent: f64,
    /// Instrument count per exchange.
    pub instruments_by_exchange: BTreeMap<ExchangeId, usize>,
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::market::Quote;

    fn tick(instrument: &str, exchange: &str, last: i64) -> TickEvent {
        TickEvent::new(
            instrument,
            exchange,
            Quote {
                update_time: "09:30:00".to_string(),
                last_price: Decimal::from(last),
                pre_close_price: Decimal::from(3400),
                ..Quote::default()
            },
        )
    }

    fn store() -> (SnapshotStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        (SnapshotStore::new(clock.clone()), clock)
    }

    #[test]
    fn update_creates_snapshot() {
        let (store, _) = store();

        store.update(tick("rb2405", "SHFE", 3500));

        let snapshot = store.get("rb2405").unwrap();
        assert_eq!(snapshot.quote.last_price, Decimal::from(3500));
        assert_eq!(snapshot.revision, 1);
        assert!(store.has_instrument("rb2405"));
    }

    #[test]
    fn get_unknown_counts_miss() {
        let (store, _) = store();

        assert!(store.get("nope").is_none());

        let stats = store.stats();
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.cache_hits, 0);
    }

    #[test]
    fn returned_snapshot_is_a_copy() {
        let (store, _) = store();
        store.update(tick("rb2405", "SHFE", 3500));

        let mut copy = store.get("rb2405").unwrap();
        copy.quote.last_price = Decimal::from(1);

        assert_eq!(store.get("rb2405").unwrap().quote.last_price, Decimal::from(3500));
    }

    #[test]
    fn exchange_association_is_first_write_wins() {
        let (store, _) = store();

        store.update(tick("rb2405", "SHFE", 3500));
        store.update(tick("rb2405", "DCE", 3501));

        assert_eq!(store.exchange_of("rb2405").as_deref(), Some("SHFE"));
        assert_eq!(store.get_by_exchange("SHFE").len(), 1);
        assert!(store.get_by_exchange("DCE").is_empty());
        assert_eq!(store.get("rb2405").unwrap().quote.last_price, Decimal::from(3501));
    }

    #[test]
    fn active_queries_skip_stale() {
        let (store, clock) = store();
        store.update(tick("rb2405", "SHFE", 3500));
        clock.advance(Duration::from_secs(301));
        store.update(tick("cu2405", "SHFE", 68000));

        let active: Vec<_> = store
            .get_active_by_exchange("SHFE")
            .into_iter()
            .map(|s| s.instrument_id)
            .collect();

        assert_eq!(active, vec!["cu2405".to_string()]);
        assert_eq!(store.get_active().len(), 1);
        assert_eq!(store.get_by_exchange("SHFE").len(), 2);
    }

    #[test]
    fn is_stale_uses_supplied_window() {
        let (store, clock) = store();
        store.update(tick("rb2405", "SHFE", 3500));
        let snapshot = store.get("rb2405").unwrap();

        clock.advance(Duration::from_secs(61));

        assert!(store.is_stale(&snapshot, Duration::from_secs(60)));
        assert!(!store.is_stale(&snapshot, Duration::from_secs(300)));
    }

    #[test]
    fn sweep_removes_stale_and_index() {
        let (store, clock) = store();
        store.update(tick("rb2405", "SHFE", 3500));
        store.update(tick("m2405", "DCE", 3200));
        clock.advance(Duration::from_secs(200));
        store.update(tick("m2405", "DCE", 3201));
        clock.advance(Duration::from_secs(101));

        let evicted = store.sweep();

        assert_eq!(evicted, 1);
        assert!(store.get("rb2405").is_none());
        assert!(store.instruments_by_exchange("SHFE").is_empty());
        assert!(!store.exchanges().contains(&"SHFE".to_string()));
        assert!(store.get("m2405").is_some());
    }

    #[test]
    fn recreated_after_sweep_resets_revision() {
        let (store, clock) = store();
        store.update(tick("rb2405", "SHFE", 3500));
        store.update(tick("rb2405", "SHFE", 3501));
        clock.advance(Duration::from_secs(301));
        store.sweep();

        store.update(tick("rb2405", "SHFE", 3502));

        assert_eq!(store.get("rb2405").unwrap().revision, 1);
        assert_eq!(store.instruments_by_exchange("SHFE"), vec!["rb2405".to_string()]);
    }

    #[test]
    fn get_by_instruments_skips_missing() {
        let (store, _) = store();
        store.update(tick("rb2405", "SHFE", 3500));

        let ids = vec!["rb2405".to_string(), "missing".to_string()];
        let found = store.get_by_instruments(&ids);

        assert_eq!(found.len(), 1);
    }

    #[test]
    fn stats_are_accurate() {
        let (store, _) = store();
        store.update(tick("rb2405", "SHFE", 3500));
        store.update(tick("cu2405", "SHFE", 68000));
        store.update(tick("m2405", "DCE", 3200));
        let _ = store.get("rb2405");
        let _ = store.get("missing");

        let stats = store.stats();

        assert_eq!(stats.total_instruments, 3);
        assert_eq!(stats.active_instruments, 3);
        assert_eq!(stats.total_exchanges, 2);
        assert_eq!(stats.total_updates, 3);
        assert!((stats.hit_rate_percent - 50.0).abs() < f64::EPSILON);
        assert_eq!(stats.instruments_by_exchange.get("SHFE"), Some(&2));
    }

    #[test]
    fn clear_resets_everything() {
        let (store, _) = store();
        store.update(tick("rb2405", "SHFE", 3500));

        store.clear();

        assert!(store.is_empty());
        assert!(store.exchanges().is_empty());
        assert_eq!(store.total_updates(), 0);
    }

    #[test]
    fn concurrent_writers_keep_revision_exact() {
        use std::thread;

        let store = Arc::new(SnapshotStore::new(Arc::new(ManualClock::new())));
        let mut handles = vec![];

        for i in 0..8 {
            let s = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for n in 0..250 {
                    s.update(tick("shared", "SHFE", n));
                    s.update(tick(&format!("own{i}"), "DCE", n));
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.get("shared").unwrap().revision, 2000);
        assert_eq!(store.instruments_by_exchange("DCE").len(), 8);
        assert_eq!(store.total_updates(), 4000);
    }

    proptest! {
        #[test]
        fn last_update_wins(prices in proptest::collection::vec(1i64..1_000_000, 1..50)) {
            let (store, _) = store();

            for price in &prices {
                store.update(tick("rb2405", "SHFE", *price));
            }

            let snapshot = store.get("rb2405").unwrap();
            let last = *prices.last().unwrap();
            prop_assert_eq!(snapshot.quote.last_price, Decimal::from(last));
            prop_assert_eq!(snapshot.revision, prices.len() as u64);
        }
    }
}
