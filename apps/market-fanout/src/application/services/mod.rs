//! Application Services
//!
//! Services that orchestrate the domain and drive the outbound ports.
//!
//! - `FanoutEngine`: periodic and on-demand distribution of snapshots
//! - `MarketDataService`: session command surface and combined statistics

/// Subscription-driven snapshot distribution.
pub mod fanout;

/// Session commands.
pub mod commands;

pub use commands::{CommandError, MarketDataService, ServiceStats};
pub use fanout::{CycleReport, FanoutConfig, FanoutEngine, FanoutStats};
