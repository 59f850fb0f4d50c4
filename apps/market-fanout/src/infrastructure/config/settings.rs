//! Service Configuration Settings
//!
//! Configuration types for the fan-out service, loaded from environment
//! variables. Unparseable values fall back to defaults; zero intervals are
//! rejected.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::application::services::FanoutConfig;

/// Where ticks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedMode {
    /// Built-in random-walk generator.
    #[default]
    Simulated,
    /// An external gateway posts ticks to the health server's `/ingest` route.
    External,
}

impl FeedMode {
    /// Parse feed mode from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "external" => Self::External,
            _ => Self::Simulated,
        }
    }

    /// Mode name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::External => "external",
        }
    }
}

/// Snapshot cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// Age after which a snapshot is stale.
    pub staleness_window: Duration,
    /// Time between cache sweeps.
    pub sweep_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(600),
        }
    }
}

/// Session registry settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Idle time after which a session expires.
    pub timeout: Duration,
    /// Time between session sweeps.
    pub sweep_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

/// Fan-out cadence settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanoutSettings {
    /// Time between fan-out cycles.
    pub push_interval: Duration,
    /// Delay before the first cycle.
    pub warmup: Duration,
}

impl Default for FanoutSettings {
    fn default() -> Self {
        Self {
            push_interval: Duration::from_millis(500),
            warmup: Duration::from_millis(1000),
        }
    }
}

impl From<FanoutSettings> for FanoutConfig {
    fn from(settings: FanoutSettings) -> Self {
        Self {
            push_interval: settings.push_interval,
            warmup: settings.warmup,
        }
    }
}

/// Topic channel settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Buffered payloads per topic before slow listeners lag.
    pub topic_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            topic_capacity: 256,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Health, stats and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// One instrument produced by the simulated feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedInstrument {
    /// Instrument id.
    pub instrument_id: String,
    /// Exchange id.
    pub exchange_id: String,
    /// Starting price of the random walk.
    pub base_price: Decimal,
}

impl SimulatedInstrument {
    /// Parse `id:exchange:base`.
    #[must_use]
    pub fn parse(entry: &str) -> Option<Self> {
        let mut parts = entry.trim().split(':');
        let instrument_id = parts.next().filter(|s| !s.is_empty())?;
        let exchange_id = parts.next().filter(|s| !s.is_empty())?;
        let base_price = parts.next()?.parse::<Decimal>().ok()?;
        if parts.next().is_some() || base_price <= Decimal::ZERO {
            return None;
        }
        Some(Self {
            instrument_id: instrument_id.to_string(),
            exchange_id: exchange_id.to_string(),
            base_price,
        })
    }
}

/// Default simulated instrument list.
pub const DEFAULT_FEED_INSTRUMENTS: &str =
    "rb2405:SHFE:3500,cu2405:SHFE:68000,IF2403:CFFEX:3400,m2405:DCE:3200";

/// Tick source settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSettings {
    /// Tick source.
    pub mode: FeedMode,
    /// Instruments the simulated feed produces.
    pub instruments: Vec<SimulatedInstrument>,
    /// Simulated tick period per instrument.
    pub tick_interval: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            mode: FeedMode::default(),
            instruments: parse_instruments(DEFAULT_FEED_INSTRUMENTS),
            tick_interval: Duration::from_millis(1000),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Snapshot cache settings.
    pub cache: CacheSettings,
    /// Session registry settings.
    pub sessions: SessionSettings,
    /// Fan-out cadence.
    pub fanout: FanoutSettings,
    /// Topic channel settings.
    pub broadcast: BroadcastSettings,
    /// Server ports.
    pub server: ServerSettings,
    /// Tick source.
    pub feed: FeedSettings,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an interval or capacity is configured as zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if an interval or capacity is configured as zero.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let defaults = Self::default();

        let cache = CacheSettings {
            staleness_window: env.duration_secs(
                "MARKET_FANOUT_STALE_SECS",
                defaults.cache.staleness_window,
            )?,
            sweep_interval: env.duration_secs(
                "MARKET_FANOUT_CACHE_SWEEP_SECS",
                defaults.cache.sweep_interval,
            )?,
        };

        let sessions = SessionSettings {
            timeout: env.duration_secs(
                "MARKET_FANOUT_SESSION_TIMEOUT_SECS",
                defaults.sessions.timeout,
            )?,
            sweep_interval: env.duration_secs(
                "MARKET_FANOUT_SESSION_SWEEP_SECS",
                defaults.sessions.sweep_interval,
            )?,
        };

        let fanout = FanoutSettings {
            push_interval: env.duration_millis(
                "MARKET_FANOUT_PUSH_INTERVAL_MS",
                defaults.fanout.push_interval,
            )?,
            warmup: env.duration_millis_allow_zero(
                "MARKET_FANOUT_PUSH_WARMUP_MS",
                defaults.fanout.warmup,
            ),
        };

        let broadcast = BroadcastSettings {
            topic_capacity: env.nonzero_usize(
                "MARKET_FANOUT_TOPIC_CAPACITY",
                defaults.broadcast.topic_capacity,
            )?,
        };

        let server = ServerSettings {
            health_port: env.u16("MARKET_FANOUT_HEALTH_PORT", defaults.server.health_port),
        };

        let feed = FeedSettings {
            mode: lookup("MARKET_FANOUT_FEED")
                .map(|s| FeedMode::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            instruments: lookup("MARKET_FANOUT_FEED_INSTRUMENTS")
                .map_or(defaults.feed.instruments, |s| parse_instruments(&s)),
            tick_interval: env.duration_millis(
                "MARKET_FANOUT_FEED_TICK_MS",
                defaults.feed.tick_interval,
            )?,
        };

        Ok(Self {
            cache,
            sessions,
            fanout,
            broadcast,
            server,
            feed,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A value parsed but is not allowed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Environment variable.
        key: String,
        /// Why it was rejected.
        reason: String,
    },
}

fn parse_instruments(raw: &str) -> Vec<SimulatedInstrument> {
    raw.split(',')
        .filter(|s| !s.trim().is_empty())
        .filter_map(|entry| {
            let parsed = SimulatedInstrument::parse(entry);
            if parsed.is_none() {
                tracing::warn!(entry, "Ignoring malformed simulated instrument");
            }
            parsed
        })
        .collect()
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        (self.0)(key).and_then(|v| v.trim().parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> u16 {
        self.parse(key).unwrap_or(default)
    }

    fn nonzero_usize(&self, key: &str, default: usize) -> Result<usize, ConfigError> {
        match self.parse::<usize>(key) {
            Some(0) => Err(zero(key)),
            Some(value) => Ok(value),
            None => Ok(default),
        }
    }

    fn nonzero_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        match self.parse::<u64>(key) {
            Some(0) => Err(zero(key)),
            other => Ok(other),
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .nonzero_u64(key)?
            .map_or(default, Duration::from_secs))
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .nonzero_u64(key)?
            .map_or(default, Duration::from_millis))
    }

    fn duration_millis_allow_zero(&self, key: &str, default: Duration) -> Duration {
        self.parse::<u64>(key)
            .map_or(default, Duration::from_millis)
    }
}

fn zero(key: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: "must be greater than zero".to_string(),
    }
}
