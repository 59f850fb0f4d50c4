//! Tick Feed Ingestion
//!
//! The upstream gateway (posting to the health server's `/ingest` route)
//! or the built-in simulator produces [`FeedEvent`]s
//! on an mpsc channel. [`run_ingest`] drains that channel into the
//! [`SnapshotStore`] and keeps a [`FeedState`] for health reporting.
//!
//! ```text
//! /ingest / SimulatedFeed ──FeedEvent──► mpsc ──► run_ingest ──► SnapshotStore
//!                                                     │
//!                                                     └──► FeedState
//! ```

mod simulated;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use simulated::SimulatedFeed;

use crate::domain::cache::SnapshotStore;
use crate::domain::market::TickEvent;
use crate::infrastructure::metrics::record_ticks_ingested;

/// Default feed channel capacity.
pub const DEFAULT_FEED_CAPACITY: usize = 4096;

// =============================================================================
// Events
// =============================================================================

/// Something the upstream feed reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// Upstream connection established.
    Connected,
    /// Upstream connection lost.
    Disconnected,
    /// One full market update.
    Tick(Box<TickEvent>),
    /// Upstream error.
    Error(String),
}

impl From<TickEvent> for FeedEvent {
    fn from(tick: TickEvent) -> Self {
        Self::Tick(Box::new(tick))
    }
}

/// Producer side of the feed channel.
pub type FeedSender = mpsc::Sender<FeedEvent>;

/// Create a feed channel.
#[must_use]
pub fn channel(capacity: usize) -> (FeedSender, mpsc::Receiver<FeedEvent>) {
    mpsc::channel(capacity.max(1))
}

// =============================================================================
// Feed State Tracking
// =============================================================================

/// Connection state of the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected yet or connection lost.
    #[default]
    Disconnected,
    /// Receiving data.
    Connected,
    /// Last event was an error.
    Error,
}

/// Tracks the state of the upstream feed.
#[derive(Debug, Default)]
pub struct FeedState {
    state: RwLock<ConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    error_message: RwLock<Option<String>>,
    ticks_received: AtomicU64,
}

impl FeedState {
    /// Create a disconnected feed state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Connected {
            *self.last_connected_at.write() = Some(Utc::now());
            *self.error_message.write() = None;
        }
    }

    /// Set an error state with message.
    pub fn set_error(&self, message: String) {
        *self.state.write() = ConnectionState::Error;
        *self.error_message.write() = Some(message);
    }

    /// Count one applied tick.
    pub fn record_tick(&self) {
        self.ticks_received.fetch_add(1, Ordering::Relaxed);
        *self.last_tick_at.write() = Some(Utc::now());
    }

    /// Current connection state.
    #[must_use]
    pub fn get_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Whether the feed is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.get_state() == ConnectionState::Connected
    }

    /// Ticks applied so far.
    #[must_use]
    pub fn ticks_received(&self) -> u64 {
        self.ticks_received.load(Ordering::Relaxed)
    }

    /// Serializable view for health reporting.
    #[must_use]
    pub fn status(&self) -> FeedStatus {
        FeedStatus {
            state: self.get_state(),
            last_connected_at: *self.last_connected_at.read(),
            last_tick_at: *self.last_tick_at.read(),
            error_message: self.error_message.read().clone(),
            ticks_received: self.ticks_received(),
        }
    }
}

/// Point-in-time feed status.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    /// Connection state.
    pub state: ConnectionState,
    /// Last successful connection.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last applied tick.
    pub last_tick_at: Option<DateTime<Utc>>,
    /// Last reported error.
    pub error_message: Option<String>,
    /// Ticks applied.
    pub ticks_received: u64,
}

// =============================================================================
// Ingest Loop
// =============================================================================

/// Apply feed events to the store until the channel closes or `cancel` fires.
pub async fn run_ingest(
    mut events: mpsc::Receiver<FeedEvent>,
    store: Arc<SnapshotStore>,
    state: Arc<FeedState>,
    cancel: CancellationToken,
) {
    tracing::info!("Feed ingest started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("Feed ingest cancelled");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::info!("Feed channel closed");
                    state.set_state(ConnectionState::Disconnected);
                    break;
                };
                apply(event, &store, &state);
            }
        }
    }

    tracing::info!(ticks = state.ticks_received(), "Feed ingest stopped");
}

fn apply(event: FeedEvent, store: &SnapshotStore, state: &FeedState) {
    match event {
        FeedEvent::Tick(tick) => {
            tracing::trace!(instrument = %tick.instrument_id, "Tick received");
            store.update(*tick);
            state.record_tick();
            record_ticks_ingested(1);
        }
        FeedEvent::Connected => {
            tracing::info!("Feed connected");
            state.set_state(ConnectionState::Connected);
        }
        FeedEvent::Disconnected => {
            tracing::warn!("Feed disconnected");
            state.set_state(ConnectionState::Disconnected);
        }
        FeedEvent::Error(message) => {
            tracing::error!(error = %message, "Feed error");
            state.set_error(message);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
