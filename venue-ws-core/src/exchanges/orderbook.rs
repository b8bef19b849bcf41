//! Order book state with sequence continuity checks

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use super::types::{BookLevels, OrderBookView};

/// Result of applying an incremental update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    /// `begin` did not match the cached sequence; the update was not applied
    Gap { expected: u64, received: u64 },
}

/// Order book keyed by exact decimal price
#[derive(Clone, Debug)]
pub struct OrderBook {
    pub symbol: String,
    pub bids: BTreeMap<Decimal, Decimal>,
    pub asks: BTreeMap<Decimal, Decimal>,
    pub sequence: Option<u64>,
    /// Milliseconds since the unix epoch of the last change
    pub timestamp: i64,
}

impl OrderBook {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: None,
            timestamp: 0,
        }
    }

    /// Builds a book from a full snapshot. Non-positive sizes are skipped.
    pub fn from_snapshot(
        symbol: impl Into<String>,
        bids: &BookLevels,
        asks: &BookLevels,
        sequence: Option<u64>,
    ) -> Self {
        let mut book = Self::new(symbol);
        apply_side(&mut book.bids, bids);
        apply_side(&mut book.asks, asks);
        book.sequence = sequence;
        book.touch();
        book
    }

    /// Applies a delta whose first change follows `begin`.
    ///
    /// When both the cached sequence and `begin` are known they must match,
    /// otherwise nothing is applied and the gap is reported.
    pub fn apply_delta(
        &mut self,
        begin: Option<u64>,
        sequence: Option<u64>,
        bids: &BookLevels,
        asks: &BookLevels,
    ) -> DeltaOutcome {
        if let (Some(expected), Some(received)) = (self.sequence, begin) {
            if expected != received {
                return DeltaOutcome::Gap { expected, received };
            }
        }

        apply_side(&mut self.bids, bids);
        apply_side(&mut self.asks, asks);
        if sequence.is_some() {
            self.sequence = sequence;
        }
        self.touch();
        DeltaOutcome::Applied
    }

    fn touch(&mut self) {
        self.timestamp = chrono::Utc::now().timestamp_millis();
    }

    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.iter().next_back().map(|(p, q)| (*p, *q))
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.iter().next().map(|(p, q)| (*p, *q))
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        let (bid, _) = self.best_bid()?;
        let (ask, _) = self.best_ask()?;
        Some((bid + ask) / Decimal::TWO)
    }

    /// Best bid strictly below best ask
    pub fn verify_integrity(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some((bid, _)), Some((ask, _))) => bid < ask,
            _ => true,
        }
    }

    /// Numeric view limited to `depth` levels per side
    pub fn view(&self, depth: usize) -> OrderBookView {
        let to_f64 = |(p, q): (&Decimal, &Decimal)| {
            (p.to_f64().unwrap_or_default(), q.to_f64().unwrap_or_default())
        };
        OrderBookView {
            bids: self.bids.iter().rev().take(depth).map(to_f64).collect(),
            asks: self.asks.iter().take(depth).map(to_f64).collect(),
            sequence: self.sequence,
            time: self.timestamp,
        }
    }
}

fn apply_side(side: &mut BTreeMap<Decimal, Decimal>, levels: &BookLevels) {
    for (price, size) in levels {
        if *size <= Decimal::ZERO {
            side.remove(price);
        } else {
            side.insert(*price, *size);
        }
    }
}
