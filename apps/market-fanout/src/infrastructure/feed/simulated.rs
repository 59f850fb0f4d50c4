//! Simulated tick source.
//!
//! Random-walks a configured set of instruments and emits one full tick per
//! instrument per period, with a five-level book around the last price.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{FeedEvent, FeedSender};
use crate::domain::market::{BOOK_DEPTH, BookLevel, Quote, TickEvent};
use crate::infrastructure::config::SimulatedInstrument;

/// Largest single-step move, in basis points of the base price.
const MAX_STEP_BPS: i64 = 20;

/// Price limit band, in percent of the base price.
const LIMIT_BAND_PERCENT: i64 = 10;

#[derive(Debug, Clone)]
struct WalkState {
    instrument: SimulatedInstrument,
    last: Decimal,
    high: Decimal,
    low: Decimal,
    volume: u64,
    turnover: Decimal,
    open_interest: Decimal,
}

impl WalkState {
    fn new(instrument: SimulatedInstrument) -> Self {
        let base = instrument.base_price;
        Self {
            instrument,
            last: base,
            high: base,
            low: base,
            volume: 0,
            turnover: Decimal::ZERO,
            open_interest: Decimal::from(10_000),
        }
    }

    fn tick_size(&self) -> Decimal {
        if self.instrument.base_price >= Decimal::from(10_000) {
            Decimal::from(10)
        } else {
            Decimal::ONE
        }
    }

    fn step(&mut self, rng: &mut impl Rng) -> TickEvent {
        let base = self.instrument.base_price;
        let band = base * Decimal::from(LIMIT_BAND_PERCENT) / Decimal::ONE_HUNDRED;
        let upper = base + band;
        let lower = base - band;

        let bps = rng.random_range(-MAX_STEP_BPS..=MAX_STEP_BPS);
        let tick_size = self.tick_size();
        let moved = self.last + base * Decimal::from(bps) / Decimal::from(10_000);
        self.last = ((moved / tick_size).round() * tick_size).clamp(lower, upper);
        self.high = self.high.max(self.last);
        self.low = self.low.min(self.last);

        let traded: u64 = rng.random_range(1..=200);
        self.volume += traded;
        self.turnover += self.last * Decimal::from(traded);
        self.open_interest += Decimal::from(rng.random_range(-20_i64..=20));

        let mut bids = [BookLevel::default(); BOOK_DEPTH];
        let mut asks = [BookLevel::default(); BOOK_DEPTH];
        for (level, offset) in (1..=BOOK_DEPTH).map(|n| Decimal::from(n) * tick_size).enumerate() {
            bids[level] = BookLevel::new(self.last - offset, rng.random_range(1..=100));
            asks[level] = BookLevel::new(self.last + offset, rng.random_range(1..=100));
        }

        let now = Utc::now();
        TickEvent::new(
            self.instrument.instrument_id.clone(),
            self.instrument.exchange_id.clone(),
            Quote {
                update_time: now.format("%H:%M:%S%.3f").to_string(),
                trading_day: Some(now.format("%Y%m%d").to_string()),
                last_price: self.last,
                pre_close_price: base,
                open_price: base,
                highest_price: self.high,
                lowest_price: self.low,
                upper_limit_price: upper,
                lower_limit_price: lower,
                volume: self.volume,
                turnover: self.turnover,
                open_interest: self.open_interest,
                bids,
                asks,
            },
        )
    }
}

/// Random-walk tick generator.
pub struct SimulatedFeed {
    instruments: Vec<WalkState>,
    tick_interval: Duration,
    events: FeedSender,
}

impl SimulatedFeed {
    /// Create a generator for `instruments`.
    #[must_use]
    pub fn new(
        instruments: Vec<SimulatedInstrument>,
        tick_interval: Duration,
        events: FeedSender,
    ) -> Self {
        Self {
            instruments: instruments.into_iter().map(WalkState::new).collect(),
            tick_interval,
            events,
        }
    }

    /// Emit ticks until cancelled or the receiver goes away.
    pub async fn run(mut self, cancel: CancellationToken) {
        if self.events.send(FeedEvent::Connected).await.is_err() {
            return;
        }
        tracing::info!(
            instruments = self.instruments.len(),
            tick_ms = self.tick_interval.as_millis(),
            "Simulated feed started"
        );

        let mut interval = tokio::time::interval(self.tick_interval.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let ticks: Vec<TickEvent> = {
                        let mut rng = rand::rng();
                        self.instruments.iter_mut().map(|walk| walk.step(&mut rng)).collect()
                    };
                    for tick in ticks {
                        if self.events.send(tick.into()).await.is_err() {
                            tracing::debug!("Feed receiver dropped, stopping simulated feed");
                            return;
                        }
                    }
                }
            }
        }

        let _ = self.events.send(FeedEvent::Disconnected).await;
        tracing::info!("Simulated feed stopped");
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn instrument() -> SimulatedInstrument {
        SimulatedInstrument {
            instrument_id: "rb2405".to_string(),
            exchange_id: "SHFE".to_string(),
            base_price: Decimal::from(3500),
        }
    }

    #[test]
    fn walk_stays_within_limits_and_builds_book() {
        let mut walk = WalkState::new(instrument());
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..5000 {
            let tick = walk.step(&mut rng);
            let quote = &tick.quote;

            assert!(quote.last_price <= quote.upper_limit_price);
            assert!(quote.last_price >= quote.lower_limit_price);
            assert!(quote.lowest_price <= quote.last_price);
            assert!(quote.highest_price >= quote.last_price);
            assert!(quote.bids.iter().all(|level| level.price < quote.last_price));
            assert!(quote.asks.iter().all(|level| level.price > quote.last_price));
            assert_eq!(quote.pre_close_price, Decimal::from(3500));
        }
    }

    #[test]
    fn volume_is_cumulative() {
        let mut walk = WalkState::new(instrument());
        let mut rng = StdRng::seed_from_u64(1);

        let first = walk.step(&mut rng).quote.volume;
        let second = walk.step(&mut rng).quote.volume;

        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn emits_connected_then_ticks() {
        let (tx, mut rx) = super::super::channel(64);
        let cancel = CancellationToken::new();
        let feed = SimulatedFeed::new(vec![instrument()], Duration::from_millis(100), tx);

        let task = tokio::spawn(feed.run(cancel.clone()));

        assert_eq!(rx.recv().await, Some(FeedEvent::Connected));
        match rx.recv().await {
            Some(FeedEvent::Tick(tick)) => assert_eq!(tick.instrument_id, "rb2405"),
            other => panic!("expected tick, got {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
