//! Push payload wire format.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::market::{BookLevel, ExchangeId, InstrumentId, Snapshot};

/// One batched push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushPayload {
    /// Assembly time, epoch milliseconds.
    pub timestamp: i64,
    /// Number of entries in `data`.
    pub count: usize,
    /// Snapshot views.
    pub data: Vec<SnapshotView>,
}

impl PushPayload {
    /// Build a payload from snapshots.
    #[must_use]
    pub fn new(timestamp: DateTime<Utc>, snapshots: &[Snapshot]) -> Self {
        let data: Vec<SnapshotView> = snapshots.iter().map(SnapshotView::from).collect();
        Self {
            timestamp: timestamp.timestamp_millis(),
            count: data.len(),
            data,
        }
    }

    /// Whether the payload carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Client-facing view of one snapshot.
///
/// Price fields mirror [`crate::domain::market::Quote`]; `priceChange` and
/// `priceChangePercent` are derived at assembly time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotView {
    /// Instrument identifier.
    pub instrument_id: InstrumentId,
    /// Exchange fixed at first observation.
    pub exchange_id: ExchangeId,
    /// Display name, when known.
    pub instrument_name: Option<String>,
    /// Feed-supplied update time.
    pub update_time: String,
    /// Trading day, when reported.
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
    /// Last price minus previous close; zero when not representable.
    pub price_change: Decimal,
    /// Change as a percentage of previous close; zero when the close is not positive.
    pub price_change_percent: Decimal,
    /// Bid levels, best first.
    pub bid: Vec<BookLevel>,
    /// Ask levels, best first.
    pub ask: Vec<BookLevel>,
    /// Cache revision the view was taken from.
    pub revision: u64,
}

impl From<&Snapshot> for SnapshotView {
    fn from(snapshot: &Snapshot) -> Self {
        let quote = &snapshot.quote;
        Self {
            instrument_id: snapshot.instrument_id.clone(),
            exchange_id: snapshot.exchange_id.clone(),
            instrument_name: snapshot.instrument_name.clone(),
            update_time: quote.update_time.clone(),
            trading_day: quote.trading_day.clone(),
            last_price: quote.last_price,
            pre_close_price: quote.pre_close_price,
            open_price: quote.open_price,
            highest_price: quote.highest_price,
            lowest_price: quote.lowest_price,
            upper_limit_price: quote.upper_limit_price,
            lower_limit_price: quote.lower_limit_price,
            volume: quote.volume,
            turnover: quote.turnover,
            open_interest: quote.open_interest,
            price_change: snapshot.price_change(),
            price_change_percent: snapshot.price_change_percent(),
            bid: quote.bids.to_vec(),
            ask: quote.asks.to_vec(),
            revision: snapshot.revision,
        }
    }
}
