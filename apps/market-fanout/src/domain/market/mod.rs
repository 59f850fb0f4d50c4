//! Market Data Types
//!
//! Canonical internal representation of one instrument's market state:
//! the tick event produced by the feed and the cached snapshot derived
//! from it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::clock::age_exceeds;

// =============================================================================
// Types
// =============================================================================

/// Instrument identifier (e.g. `rb2405`).
pub type InstrumentId = String;

/// Exchange identifier (e.g. `SHFE`).
pub type ExchangeId = String;

/// Number of price levels carried on each side of the book.
pub const BOOK_DEPTH: usize = 5;

/// One price level of the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BookLevel {
    /// Level price.
    pub price: Decimal,
    /// Resting volume at this price.
    pub volume: u32,
}

impl BookLevel {
    /// Create a level.
    #[must_use]
    pub const fn new(price: Decimal, volume: u32) -> Self {
        Self { price, volume }
    }
}

/// Full field set of one market update.
///
/// The feed always supplies every field; partial updates do not exist.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    /// Feed-supplied update time, kept verbatim.
    pub update_time: String,
    /// Trading day, when the feed reports one.
    pub trading_day: Option<String>,
    /// Last traded price.
    pub last_price: Decimal,
    /// Previous session close.
    pub pre_close_price: Decimal,
    /// Session open.
    pub open_price: Decimal,
    /// Session high.
    pub highest_price: Decimal,
    /// Session low.
    pub lowest_price: Decimal,
    /// Upper price limit.
    pub upper_limit_price: Decimal,
    /// Lower price limit.
    pub lower_limit_price: Decimal,
    /// Cumulative traded volume.
    pub volume: u64,
    /// Cumulative turnover.
    pub turnover: Decimal,
    /// Open interest.
    pub open_interest: Decimal,
    /// Bid levels, best first.
    pub bids: [BookLevel; BOOK_DEPTH],
    /// Ask levels, best first.
    pub asks: [BookLevel; BOOK_DEPTH],
}

/// A single ingestion event from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickEvent {
    /// Instrument the tick belongs to.
    pub instrument_id: InstrumentId,
    /// Exchange the instrument trades on.
    pub exchange_id: ExchangeId,
    /// Display name, if the feed knows it.
    pub instrument_name: Option<String>,
    /// Market fields.
    pub quote: Quote,
}

impl TickEvent {
    /// Create a tick without a display name.
    #[must_use]
    pub fn new(
        instrument_id: impl Into<InstrumentId>,
        exchange_id: impl Into<ExchangeId>,
        quote: Quote,
    ) -> Self {
        Self {
            instrument_id: instrument_id.into(),
            exchange_id: exchange_id.into(),
            instrument_name: None,
            quote,
        }
    }

    /// Attach a display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.instrument_name = Some(name.into());
        self
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Latest known state of one instrument.
///
/// Values handed out by the cache are copies; mutating one has no effect
/// on the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Instrument identifier.
    pub instrument_id: InstrumentId,
    /// Exchange fixed at first observation.
    pub exchange_id: ExchangeId,
    /// Display name.
    pub instrument_name: Option<String>,
    /// Most recent field set.
    pub quote: Quote,
    /// When the cache last applied an update.
    pub last_mutated: DateTime<Utc>,
    /// Number of updates applied since the snapshot was created.
    pub revision: u64,
}

impl Snapshot {
    /// Build a fresh snapshot from its first tick (revision 1).
    #[must_use]
    pub fn from_tick(tick: TickEvent, now: DateTime<Utc>) -> Self {
        Self {
            instrument_id: tick.instrument_id,
            exchange_id: tick.exchange_id,
            instrument_name: tick.instrument_name,
            quote: tick.quote,
            last_mutated: now,
            revision: 1,
        }
    }

    /// Apply a subsequent tick.
    ///
    /// The exchange association is never changed here.
    pub fn apply(&mut self, tick: TickEvent, now: DateTime<Utc>) {
        if tick.instrument_name.is_some() {
            self.instrument_name = tick.instrument_name;
        }
        self.quote = tick.quote;
        self.last_mutated = now;
        self.revision += 1;
    }

    /// Last price minus previous close; zero when the difference overflows.
    #[must_use]
    pub fn price_change(&self) -> Decimal {
        self.quote
            .last_price
            .checked_sub(self.quote.pre_close_price)
            .unwrap_or(Decimal::ZERO)
    }

    /// Percentage change against previous close; zero when the close is not positive.
    #[must_use]
    pub fn price_change_percent(&self) -> Decimal {
        if self.quote.pre_close_price <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.price_change()
            .checked_div(self.quote.pre_close_price)
            .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
            .map_or(Decimal::ZERO, |percent| percent.normalize())
    }

    /// Whether more than `window` has passed since the last update.
    #[must_use]
    pub fn is_stale_at(&self, now: DateTime<Utc>, window: Duration) -> bool {
        age_exceeds(now, self.last_mutated, window)
    }
}

// =============================================================================
// Tests
// =============================================================================
