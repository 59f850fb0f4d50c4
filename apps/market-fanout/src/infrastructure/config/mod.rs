//! Configuration Module
//!
//! Environment-driven configuration for the fan-out service.

mod settings;

pub use settings::{
    BroadcastSettings, CacheSettings, ConfigError, DEFAULT_FEED_INSTRUMENTS, FanoutSettings,
    FeedMode, FeedSettings, ServerSettings, ServiceConfig, SessionSettings, SimulatedInstrument,
};
