#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Market Fanout - Snapshot Cache and Subscription Distribution
//!
//! Absorbs a high-frequency tick feed into a per-instrument snapshot cache
//! and redistributes snapshots to client sessions on a fixed cadence,
//! grouped by subscription signature so each distinct data set is
//! assembled once per cycle.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core state with no I/O
//!   - `clock`: Time source port
//!   - `market`: Ticks, quotes and snapshots
//!   - `cache`: `SnapshotStore`, the latest-value cache
//!   - `session`: Sessions and the `SessionRegistry`
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Outbound `Transport`, the metrics port and the push payload
//!   - `services`: `FanoutEngine` and the session command surface
//!
//! - **Infrastructure**: Adapters and runtime plumbing
//!   - `broadcast`: Topic channels implementing `Transport`
//!   - `feed`: Tick ingestion and the simulated feed
//!   - `scheduler`: Periodic background tasks
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! Feed ──► run_ingest ──► SnapshotStore ◄──┐
//!                                          │ read
//! Commands ──► SessionRegistry ◄───────────┤
//!                                          │
//!                   timer ──► FanoutEngine ─┴──► Transport ──► /topic/market/user/<session>
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types and stores with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::cache::{CacheStats, DEFAULT_STALENESS_WINDOW, SnapshotStore};
pub use domain::clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use domain::market::{BOOK_DEPTH, BookLevel, Quote, Snapshot, TickEvent};
pub use domain::session::{
    DEFAULT_SESSION_TIMEOUT, Permission, Session, SessionId, SessionRegistry, SessionStats,
    SubscriptionSignature,
};

// Application
pub use application::ports::{
    DeliveryError, DeliveryPath, Destination, NoopMetrics, PushPayload, RemovalReason,
    ServiceMetrics, SnapshotView, Transport,
};
pub use application::services::{
    CommandError, CycleReport, FanoutConfig, FanoutEngine, FanoutStats, MarketDataService,
    ServiceStats,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, FeedMode, ServiceConfig};

// Topic hub (for integration tests)
pub use infrastructure::broadcast::{SharedTopicHub, TopicHub, TopicHubConfig, TopicHubStats};

// Feed
pub use infrastructure::feed::{FeedEvent, FeedState, SimulatedFeed};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::{PrometheusMetrics, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
