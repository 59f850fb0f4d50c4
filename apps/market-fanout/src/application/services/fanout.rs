//! Fan-out Engine
//!
//! Pushes cached snapshots to every active session according to its
//! subscriptions, and supports immediate targeted pushes. The binary drives
//! [`FanoutEngine::run_cycle`] on the configured cadence.
//!
//! # Cycle
//!
//! 1. Copy the active sessions out of the registry and group them by
//!    [`SubscriptionSignature`]; empty signatures are dropped.
//! 2. Exchange pass: merge signature groups sharing an exchange set,
//!    assemble the active snapshots of those exchanges once per group and
//!    deliver the same payload to every member.
//! 3. Instrument pass: merge by instrument set and do the same with the
//!    listed instruments.
//!
//! A session subscribed to both exchanges and instruments receives one
//! delivery from each pass. Groups without matching data deliver nothing.
//! A failed delivery is counted and affects no other recipient; a group
//! that panics while assembling or delivering is abandoned and the cycle
//! moves on to the next group.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;

use crate::application::ports::{
    DeliveryPath, Destination, NoopMetrics, PushPayload, ServiceMetrics, Transport,
};
use crate::domain::cache::{SnapshotStore, percentage};
use crate::domain::clock::SharedClock;
use crate::domain::market::{ExchangeId, InstrumentId, Snapshot};
use crate::domain::session::{SessionId, SessionRegistry, SubscriptionSignature};

// =============================================================================
// Configuration
// =============================================================================

/// Fan-out cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Time between cycles.
    pub push_interval: Duration,
    /// Delay before the first cycle.
    pub warmup: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_millis(500),
            warmup: Duration::from_millis(1000),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    /// Active sessions considered.
    pub sessions: usize,
    /// Distinct non-empty subscription signatures.
    pub signature_groups: usize,
    /// Distinct exchange sets.
    pub exchange_groups: usize,
    /// Distinct instrument sets.
    pub instrument_groups: usize,
    /// Data assembly passes performed.
    pub assemblies: usize,
    /// Successful deliveries.
    pub deliveries: usize,
    /// Failed deliveries, including every member of an abandoned group.
    pub failures: usize,
    /// Groups abandoned after a panic.
    pub failed_groups: usize,
}

impl CycleReport {
    fn absorb(&mut self, delivered: Delivered) {
        self.assemblies += 1;
        self.deliveries += delivered.ok;
        self.failures += delivered.failed;
        if delivered.abandoned {
            self.failed_groups += 1;
        }
    }
}

/// Cumulative engine statistics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutStats {
    /// Cycles run.
    pub cycles: u64,
    /// Assembly passes across all cycles.
    pub assemblies: u64,
    /// Delivery attempts, including on-demand pushes.
    pub total_pushes: u64,
    /// Successful deliveries.
    pub successful_pushes: u64,
    /// Failed deliveries.
    pub failed_pushes: u64,
    /// Groups abandoned after a panic.
    pub failed_groups: u64,
    /// Successful deliveries as a percentage of attempts.
    pub success_rate_percent: f64,
    /// Configured cadence.
    pub push_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Delivered {
    ok: usize,
    failed: usize,
    entries: usize,
    abandoned: bool,
}

// =============================================================================
// Engine
// =============================================================================

/// Subscription-driven distributor.
pub struct FanoutEngine {
    store: Arc<SnapshotStore>,
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    clock: SharedClock,
    config: FanoutConfig,
    metrics: Arc<dyn ServiceMetrics>,
    cycles: AtomicU64,
    assemblies: AtomicU64,
    total_pushes: AtomicU64,
    successful_pushes: AtomicU64,
    failed_pushes: AtomicU64,
    failed_groups: AtomicU64,
}

impl FanoutEngine {
    /// Create an engine over the shared store and registry.
    ///
    /// Metrics are discarded until [`FanoutEngine::with_metrics`] sets a sink.
    #[must_use]
    pub fn new(
        store: Arc<SnapshotStore>,
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
        config: FanoutConfig,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
            clock,
            config,
            metrics: Arc::new(NoopMetrics),
            cycles: AtomicU64::new(0),
            assemblies: AtomicU64::new(0),
            total_pushes: AtomicU64::new(0),
            successful_pushes: AtomicU64::new(0),
            failed_pushes: AtomicU64::new(0),
            failed_groups: AtomicU64::new(0),
        }
    }

    /// Report deliveries and abandoned groups to `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn ServiceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Configured cadence.
    #[must_use]
    pub const fn config(&self) -> FanoutConfig {
        self.config
    }

    // =========================================================================
    // Periodic Cycle
    // =========================================================================

    /// Run one full cycle.
    ///
    /// Every payload of the cycle carries the timestamp taken when it starts.
    pub async fn run_cycle(&self) -> CycleReport {
        let now = self.clock.now();
        self.cycles.fetch_add(1, Ordering::Relaxed);

        let sessions = self.registry.get_active_sessions();
        let mut report = CycleReport {
            sessions: sessions.len(),
            ..CycleReport::default()
        };
        if sessions.is_empty() {
            return report;
        }

        let mut signatures: HashMap<SubscriptionSignature, Vec<SessionId>> = HashMap::new();
        for session in &sessions {
            let signature = session.signature();
            if !signature.is_empty() {
                signatures.entry(signature).or_default().push(session.id);
            }
        }
        report.signature_groups = signatures.len();

        let mut by_exchanges: HashMap<&BTreeSet<ExchangeId>, Vec<SessionId>> = HashMap::new();
        let mut by_instruments: HashMap<&BTreeSet<InstrumentId>, Vec<SessionId>> = HashMap::new();
        for (signature, members) in &signatures {
            if !signature.exchanges.is_empty() {
                by_exchanges
                    .entry(&signature.exchanges)
                    .or_default()
                    .extend_from_slice(members);
            }
            if !signature.instruments.is_empty() {
                by_instruments
                    .entry(&signature.instruments)
                    .or_default()
                    .extend_from_slice(members);
            }
        }
        report.exchange_groups = by_exchanges.len();
        report.instrument_groups = by_instruments.len();

        for (exchanges, members) in by_exchanges {
            self.assemblies.fetch_add(1, Ordering::Relaxed);
            let delivered = self
                .run_group(now, &members, DeliveryPath::Exchange, || {
                    self.store.get_active_by_exchanges(exchanges)
                })
                .await;
            report.absorb(delivered);
        }

        for (instruments, members) in by_instruments {
            self.assemblies.fetch_add(1, Ordering::Relaxed);
            let delivered = self
                .run_group(now, &members, DeliveryPath::Instrument, || {
                    self.store.get_by_instruments(instruments)
                })
                .await;
            report.absorb(delivered);
        }

        tracing::debug!(
            sessions = report.sessions,
            signatures = report.signature_groups,
            assemblies = report.assemblies,
            deliveries = report.deliveries,
            failures = report.failures,
            failed_groups = report.failed_groups,
            "Fan-out cycle complete"
        );

        report
    }

    // =========================================================================
    // On-demand Pushes
    // =========================================================================

    /// Push active snapshots of one exchange to every session subscribed to it.
    ///
    /// Returns the number of successful deliveries.
    pub async fn push_exchange_data(&self, exchange_id: &str) -> usize {
        let members: Vec<SessionId> = self
            .registry
            .get_sessions_by_exchange(exchange_id)
            .into_iter()
            .map(|session| session.id)
            .collect();
        if members.is_empty() {
            return 0;
        }

        let delivered = self
            .run_group(self.clock.now(), &members, DeliveryPath::OnDemand, || {
                self.store.get_active_by_exchange(exchange_id)
            })
            .await;

        if delivered.ok > 0 {
            tracing::info!(
                exchange = exchange_id,
                sessions = members.len(),
                instruments = delivered.entries,
                "Pushed exchange data"
            );
        }
        delivered.ok
    }

    /// Push one instrument's snapshot to every session subscribed to it.
    ///
    /// Returns the number of successful deliveries.
    pub async fn push_instrument_data(&self, instrument_id: &str) -> usize {
        let members: Vec<SessionId> = self
            .registry
            .get_sessions_by_instrument(instrument_id)
            .into_iter()
            .map(|session| session.id)
            .collect();
        if members.is_empty() {
            return 0;
        }

        let delivered = self
            .run_group(self.clock.now(), &members, DeliveryPath::OnDemand, || {
                self.store.get(instrument_id).into_iter().collect()
            })
            .await;

        if delivered.ok > 0 {
            tracing::info!(
                instrument = instrument_id,
                sessions = members.len(),
                "Pushed instrument data"
            );
        }
        delivered.ok
    }

    /// Push everything one session subscribes to, de-duplicated by instrument.
    ///
    /// Returns the number of entries delivered, zero when the session is
    /// unknown or inactive, nothing matches, or the delivery failed.
    pub async fn push_full_snapshot(&self, session_id: SessionId) -> usize {
        let Some(session) = self.registry.get_session(session_id) else {
            return 0;
        };
        if !session.active {
            return 0;
        }

        let delivered = self
            .run_group(self.clock.now(), &[session_id], DeliveryPath::OnDemand, || {
                let mut unique: BTreeMap<InstrumentId, Snapshot> = BTreeMap::new();
                let exchange_data = self
                    .store
                    .get_active_by_exchanges(&session.subscribed_exchanges);
                let instrument_data = self
                    .store
                    .get_by_instruments(&session.subscribed_instruments);
                for snapshot in exchange_data.into_iter().chain(instrument_data) {
                    unique.insert(snapshot.instrument_id.clone(), snapshot);
                }
                unique.into_values().collect()
            })
            .await;

        if delivered.ok == 0 {
            return 0;
        }
        tracing::info!(
            session_id = %session_id,
            count = delivered.entries,
            "Pushed full snapshot to session"
        );
        delivered.entries
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Assemble and deliver one group, abandoning it if either step panics.
    async fn run_group(
        &self,
        now: DateTime<Utc>,
        members: &[SessionId],
        path: DeliveryPath,
        assemble: impl FnOnce() -> Vec<Snapshot>,
    ) -> Delivered {
        let attempt = AssertUnwindSafe(async {
            let snapshots = assemble();
            self.deliver_group(now, members, &snapshots, path).await
        })
        .catch_unwind()
        .await;

        match attempt {
            Ok(delivered) => delivered,
            Err(panic) => {
                self.failed_groups.fetch_add(1, Ordering::Relaxed);
                self.metrics.group_failed(path);
                tracing::error!(
                    ?path,
                    sessions = members.len(),
                    reason = panic_reason(panic.as_ref()),
                    "Fan-out group abandoned"
                );
                Delivered {
                    failed: members.len(),
                    abandoned: true,
                    ..Delivered::default()
                }
            }
        }
    }

    async fn deliver_group(
        &self,
        now: DateTime<Utc>,
        members: &[SessionId],
        snapshots: &[Snapshot],
        path: DeliveryPath,
    ) -> Delivered {
        if members.is_empty() || snapshots.is_empty() {
            return Delivered::default();
        }

        let payload = Arc::new(PushPayload::new(now, snapshots));
        let attempts = members.iter().map(|id| {
            let payload = Arc::clone(&payload);
            async move {
                let result = self
                    .transport
                    .deliver(Destination::Session(*id), payload)
                    .await;
                (*id, result)
            }
        });

        let mut delivered = Delivered {
            entries: payload.count,
            ..Delivered::default()
        };
        for (id, result) in join_all(attempts).await {
            self.total_pushes.fetch_add(1, Ordering::Relaxed);
            match result {
                Ok(_) => {
                    delivered.ok += 1;
                    self.successful_pushes.fetch_add(1, Ordering::Relaxed);
                    self.metrics.delivery(path, true);
                    tracing::debug!(session_id = %id, count = payload.count, "Delivered push");
                }
                Err(error) => {
                    delivered.failed += 1;
                    self.failed_pushes.fetch_add(1, Ordering::Relaxed);
                    self.metrics.delivery(path, false);
                    tracing::warn!(session_id = %id, %error, "Push delivery failed");
                }
            }
        }
        delivered
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Cumulative statistics.
    #[must_use]
    pub fn stats(&self) -> FanoutStats {
        let total_pushes = self.total_pushes.load(Ordering::Relaxed);
        let successful_pushes = self.successful_pushes.load(Ordering::Relaxed);

        FanoutStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            assemblies: self.assemblies.load(Ordering::Relaxed),
            total_pushes,
            successful_pushes,
            failed_pushes: self.failed_pushes.load(Ordering::Relaxed),
            failed_groups: self.failed_groups.load(Ordering::Relaxed),
            success_rate_percent: percentage(successful_pushes, total_pushes),
            push_interval_ms: u64::try_from(self.config.push_interval.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

// =============================================================================
// Tests
// =============================================================================
