//! Live state cache
//!
//! Last known market and account state for one connection. The connection's
//! receive loop is the only writer; any number of tasks may read concurrently.
//! Reads return owned copies, so a reader never observes a half-applied update.
//!
//! Readiness is tracked per `(kind, key)`: the first write for a key signals
//! it, and [`LiveStateCache::reset`] clears every signal so waiters block
//! again until fresh data arrives after a reconnect.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::orderbook::{DeltaOutcome, OrderBook};
use super::types::{
    BalanceEntry, BookLevels, Collateral, MarketKind, OpenOrderEntry, OrderBookView,
    PositionEntry, PriceEntry, VenueEvent,
};

/// Default depth returned by [`LiveStateCache::get_orderbook`]
pub const DEFAULT_BOOK_DEPTH: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadyKind {
    Price,
    SpotPrice,
    Orderbook,
    /// Keyed by symbol, or `""` for a full account snapshot
    Positions,
    OpenOrders,
    /// Keyed by asset, or `""` for any balance
    Balances,
    Collateral,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReadyKey {
    pub kind: ReadyKind,
    pub key: String,
}

impl ReadyKey {
    pub fn new(kind: ReadyKind, key: &str) -> Self {
        Self {
            kind,
            key: normalize_symbol(key),
        }
    }
}

/// What a single event did to the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheUpdate {
    Applied,
    /// The cached book for `symbol` was dropped after a sequence gap
    Gap {
        symbol: String,
        expected: u64,
        received: u64,
    },
    /// The event is not cache state (responses, errors, heartbeats)
    Ignored,
}

pub struct LiveStateCache {
    prices: DashMap<(MarketKind, String), PriceEntry>,
    books: DashMap<String, OrderBook>,
    /// Snapshot tables are swapped whole so readers never see a partial one
    positions: RwLock<HashMap<String, PositionEntry>>,
    open_orders: RwLock<HashMap<String, OpenOrderEntry>>,
    balances: DashMap<String, BalanceEntry>,
    collateral: RwLock<Option<Collateral>>,
    dex_collateral: RwLock<HashMap<String, Collateral>>,
    readiness: DashMap<ReadyKey, watch::Sender<bool>>,
    updates: AtomicU64,
}

impl Default for LiveStateCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveStateCache {
    pub fn new() -> Self {
        Self {
            prices: DashMap::new(),
            books: DashMap::new(),
            positions: RwLock::new(HashMap::new()),
            open_orders: RwLock::new(HashMap::new()),
            balances: DashMap::new(),
            collateral: RwLock::new(None),
            dex_collateral: RwLock::new(HashMap::new()),
            readiness: DashMap::new(),
            updates: AtomicU64::new(0),
        }
    }

    /// Applies one decoded venue event.
    pub fn apply(&self, event: VenueEvent) -> CacheUpdate {
        let update = match event {
            VenueEvent::PriceTick {
                market,
                symbol,
                value,
            } => {
                self.set_price(market, &symbol, value);
                CacheUpdate::Applied
            }
            VenueEvent::OrderbookSnapshot {
                symbol,
                bids,
                asks,
                sequence,
            } => {
                self.replace_orderbook(&symbol, &bids, &asks, sequence);
                CacheUpdate::Applied
            }
            VenueEvent::OrderbookDelta {
                symbol,
                begin_sequence,
                sequence,
                bids,
                asks,
            } => self.apply_orderbook_delta(&symbol, begin_sequence, sequence, &bids, &asks),
            VenueEvent::PositionUpdate(position) => {
                self.upsert_position(position);
                CacheUpdate::Applied
            }
            VenueEvent::PositionsSnapshot(positions) => {
                self.replace_positions(positions);
                CacheUpdate::Applied
            }
            VenueEvent::BalanceUpdate(balance) => {
                let key = normalize_symbol(&balance.asset);
                self.balances.insert(key.clone(), balance);
                self.mark_ready(ReadyKind::Balances, &key);
                self.mark_ready(ReadyKind::Balances, "");
                CacheUpdate::Applied
            }
            VenueEvent::CollateralUpdate(collateral) => {
                *self.collateral.write() = Some(collateral);
                self.mark_ready(ReadyKind::Collateral, "");
                CacheUpdate::Applied
            }
            VenueEvent::DexCollateralUpdate { dex, collateral } => {
                let dex = normalize_dex(&dex);
                self.dex_collateral.write().insert(dex.clone(), collateral);
                self.mark_ready(ReadyKind::Collateral, &dex);
                CacheUpdate::Applied
            }
            VenueEvent::OrderUpdate(order) => {
                self.merge_order(order);
                self.mark_ready(ReadyKind::OpenOrders, "");
                CacheUpdate::Applied
            }
            VenueEvent::OpenOrdersSnapshot(orders) => {
                let table: HashMap<String, OpenOrderEntry> = orders
                    .into_iter()
                    .filter(OpenOrderEntry::is_open)
                    .map(|order| (order.order_id.clone(), order))
                    .collect();
                *self.open_orders.write() = table;
                self.mark_ready(ReadyKind::OpenOrders, "");
                CacheUpdate::Applied
            }
            VenueEvent::RequestResponse { .. } | VenueEvent::Error { .. } | VenueEvent::Heartbeat => {
                CacheUpdate::Ignored
            }
        };

        if update == CacheUpdate::Applied {
            self.updates.fetch_add(1, Ordering::Relaxed);
        }
        update
    }

    pub fn set_price(&self, market: MarketKind, symbol: &str, value: Decimal) {
        let key = normalize_symbol(symbol);
        let kind = match market {
            MarketKind::Perp => ReadyKind::Price,
            MarketKind::Spot => ReadyKind::SpotPrice,
        };
        self.prices.insert(
            (market, key.clone()),
            PriceEntry {
                value,
                observed_at: Instant::now(),
            },
        );
        self.mark_ready(kind, &key);
    }

    fn replace_orderbook(&self, symbol: &str, bids: &BookLevels, asks: &BookLevels, sequence: Option<u64>) {
        let key = normalize_symbol(symbol);
        self.books
            .insert(key.clone(), OrderBook::from_snapshot(key.clone(), bids, asks, sequence));
        self.mark_ready(ReadyKind::Orderbook, &key);
    }

    fn apply_orderbook_delta(
        &self,
        symbol: &str,
        begin: Option<u64>,
        sequence: Option<u64>,
        bids: &BookLevels,
        asks: &BookLevels,
    ) -> CacheUpdate {
        let key = normalize_symbol(symbol);
        let update = match self.books.entry(key.clone()) {
            // No live book: the update is the snapshot
            Entry::Vacant(slot) => {
                slot.insert(OrderBook::from_snapshot(key.clone(), bids, asks, sequence));
                CacheUpdate::Applied
            }
            Entry::Occupied(mut slot) => match slot.get_mut().apply_delta(begin, sequence, bids, asks) {
                DeltaOutcome::Applied => CacheUpdate::Applied,
                DeltaOutcome::Gap { expected, received } => {
                    slot.remove();
                    CacheUpdate::Gap {
                        symbol: key.clone(),
                        expected,
                        received,
                    }
                }
            },
        };

        match &update {
            CacheUpdate::Applied => self.mark_ready(ReadyKind::Orderbook, &key),
            CacheUpdate::Gap { expected, received, .. } => {
                warn!(
                    "Orderbook gap for {}: expected begin {}, got {}; dropping book",
                    key, expected, received
                );
                self.clear_ready(ReadyKind::Orderbook, &key);
            }
            CacheUpdate::Ignored => {}
        }
        update
    }

    /// Drops a cached orderbook and its readiness, e.g. after unsubscribing.
    pub fn drop_orderbook(&self, symbol: &str) {
        let key = normalize_symbol(symbol);
        self.books.remove(&key);
        self.clear_ready(ReadyKind::Orderbook, &key);
    }

    fn upsert_position(&self, position: PositionEntry) {
        let key = normalize_symbol(&position.symbol);
        {
            let mut positions = self.positions.write();
            if position.is_flat() {
                positions.remove(&key);
            } else {
                positions.insert(key.clone(), position);
            }
        }
        self.mark_ready(ReadyKind::Positions, &key);
    }

    fn replace_positions(&self, snapshot: Vec<PositionEntry>) {
        let mut seen = Vec::with_capacity(snapshot.len());
        let mut table = HashMap::with_capacity(snapshot.len());
        for position in snapshot {
            let key = normalize_symbol(&position.symbol);
            seen.push(key.clone());
            if !position.is_flat() {
                table.insert(key, position);
            }
        }

        *self.positions.write() = table;
        for key in &seen {
            self.mark_ready(ReadyKind::Positions, key);
        }
        self.mark_ready(ReadyKind::Positions, "");
    }

    fn merge_order(&self, order: OpenOrderEntry) {
        let mut open_orders = self.open_orders.write();
        if order.is_open() {
            open_orders.insert(order.order_id.clone(), order);
        } else {
            debug!("Removing order {} with status {:?}", order.order_id, order.status);
            open_orders.remove(&order.order_id);
        }
    }

    pub fn get_price(&self, symbol: &str) -> Option<Decimal> {
        self.get_price_entry(MarketKind::Perp, symbol).map(|p| p.value)
    }

    pub fn get_spot_price(&self, symbol: &str) -> Option<Decimal> {
        self.get_price_entry(MarketKind::Spot, symbol).map(|p| p.value)
    }

    pub fn get_price_entry(&self, market: MarketKind, symbol: &str) -> Option<PriceEntry> {
        self.prices
            .get(&(market, normalize_symbol(symbol)))
            .map(|entry| *entry)
    }

    pub fn get_orderbook(&self, symbol: &str) -> Option<OrderBookView> {
        self.get_orderbook_depth(symbol, DEFAULT_BOOK_DEPTH)
    }

    pub fn get_orderbook_depth(&self, symbol: &str, depth: usize) -> Option<OrderBookView> {
        self.books
            .get(&normalize_symbol(symbol))
            .map(|book| book.view(depth))
    }

    pub fn get_position(&self, symbol: &str) -> Option<PositionEntry> {
        self.positions.read().get(&normalize_symbol(symbol)).cloned()
    }

    pub fn get_positions(&self) -> Vec<PositionEntry> {
        let mut positions: Vec<PositionEntry> = self.positions.read().values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Positions held on one perp dex, ordered by symbol
    pub fn get_positions_by_dex(&self, dex: &str) -> Vec<PositionEntry> {
        let dex = normalize_dex(dex);
        let mut positions: Vec<PositionEntry> = self
            .positions
            .read()
            .values()
            .filter(|p| p.dex.as_deref() == Some(dex.as_str()))
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    /// Open orders, optionally filtered by symbol, ordered by order id
    pub fn get_open_orders(&self, symbol: Option<&str>) -> Vec<OpenOrderEntry> {
        let wanted = symbol.map(normalize_symbol);
        let mut orders: Vec<OpenOrderEntry> = self
            .open_orders
            .read()
            .values()
            .filter(|o| match &wanted {
                Some(s) => normalize_symbol(&o.symbol) == *s,
                None => true,
            })
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.order_id.cmp(&b.order_id));
        orders
    }

    pub fn get_balance(&self, asset: &str) -> Option<BalanceEntry> {
        self.balances
            .get(&normalize_symbol(asset))
            .map(|b| b.value().clone())
    }

    /// Total balance value in `quote`, priced with cached spot prices.
    ///
    /// The quote asset counts at par. Other assets use the spot price of the
    /// asset itself, then of `ASSET/QUOTE`; assets with no known price are
    /// left out.
    pub fn get_spot_portfolio_value(&self, quote: &str) -> Decimal {
        let quote = normalize_symbol(quote);
        self.balances
            .iter()
            .filter_map(|balance| {
                let asset = balance.key();
                let price = if *asset == quote {
                    Some(Decimal::ONE)
                } else {
                    self.get_spot_price(asset)
                        .or_else(|| self.get_spot_price(&format!("{asset}/{quote}")))
                };
                price.map(|price| balance.value().total * price)
            })
            .sum()
    }

    pub fn get_collateral(&self) -> Option<Collateral> {
        self.collateral.read().clone()
    }

    pub fn get_collateral_by_dex(&self, dex: &str) -> Option<Collateral> {
        self.dex_collateral.read().get(&normalize_dex(dex)).cloned()
    }

    pub fn get_account_value_by_dex(&self, dex: &str) -> Option<Decimal> {
        self.get_collateral_by_dex(dex).map(|c| c.account_value)
    }

    /// Dexes with a collateral entry, sorted
    pub fn dex_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.dex_collateral.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Waits until data for `(kind, key)` has arrived since the last reset.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_ready(&self, kind: ReadyKind, key: &str, timeout: Duration) -> bool {
        let mut rx = self
            .readiness
            .entry(ReadyKey::new(kind, key))
            .or_insert_with(|| watch::channel(false).0)
            .subscribe();

        let outcome = tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await;
        matches!(outcome, Ok(Ok(_)))
    }

    pub fn is_ready(&self, kind: ReadyKind, key: &str) -> bool {
        self.readiness
            .get(&ReadyKey::new(kind, key))
            .map(|tx| *tx.borrow())
            .unwrap_or(false)
    }

    fn mark_ready(&self, kind: ReadyKind, key: &str) {
        self.readiness
            .entry(ReadyKey::new(kind, key))
            .or_insert_with(|| watch::channel(false).0)
            .send_if_modified(|ready| !std::mem::replace(ready, true));
    }

    fn clear_ready(&self, kind: ReadyKind, key: &str) {
        if let Some(tx) = self.readiness.get(&ReadyKey::new(kind, key)) {
            tx.send_replace(false);
        }
    }

    /// Clears every table and readiness signal.
    ///
    /// Existing waiters keep waiting for the next write instead of returning.
    /// Signals nobody is waiting on are dropped.
    pub fn reset(&self) {
        self.prices.clear();
        self.books.clear();
        self.positions.write().clear();
        self.open_orders.write().clear();
        self.balances.clear();
        *self.collateral.write() = None;
        self.dex_collateral.write().clear();
        self.readiness.retain(|_, tx| {
            tx.send_replace(false);
            tx.receiver_count() > 0
        });
    }

    pub fn readiness_len(&self) -> usize {
        self.readiness.len()
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

fn normalize_dex(dex: &str) -> String {
    dex.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::types::{PositionSide, Side};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn snapshot_event() -> VenueEvent {
        VenueEvent::OrderbookDelta {
            symbol: "BTC".into(),
            begin_sequence: None,
            sequence: Some(5),
            bids: vec![(dec!(100), dec!(1)), (dec!(99), dec!(2))],
            asks: vec![(dec!(101), dec!(1))],
        }
    }

    #[test]
    fn test_first_delta_acts_as_snapshot_then_applies() {
        let cache = LiveStateCache::new();
        assert_eq!(cache.apply(snapshot_event()), CacheUpdate::Applied);

        let update = cache.apply(VenueEvent::OrderbookDelta {
            symbol: "btc".into(),
            begin_sequence: Some(5),
            sequence: Some(6),
            bids: vec![(dec!(99), dec!(0))],
            asks: vec![(dec!(101), dec!(2))],
        });
        assert_eq!(update, CacheUpdate::Applied);

        let book = cache.get_orderbook("BTC").unwrap();
        assert_eq!(book.bids, vec![(100.0, 1.0)]);
        assert_eq!(book.asks, vec![(101.0, 2.0)]);
        assert_eq!(book.sequence, Some(6));
    }

    #[tokio::test]
    async fn test_gap_drops_book_and_readiness() {
        let cache = LiveStateCache::new();
        cache.apply(snapshot_event());
        assert!(cache.is_ready(ReadyKind::Orderbook, "BTC"));

        let update = cache.apply(VenueEvent::OrderbookDelta {
            symbol: "BTC".into(),
            begin_sequence: Some(7),
            sequence: Some(8),
            bids: vec![],
            asks: vec![(dec!(102), dec!(1))],
        });
        assert_eq!(
            update,
            CacheUpdate::Gap {
                symbol: "BTC".into(),
                expected: 5,
                received: 7
            }
        );
        assert!(cache.get_orderbook("BTC").is_none());
        assert!(!cache.wait_ready(ReadyKind::Orderbook, "BTC", Duration::from_millis(20)).await);

        // The next update rebuilds the book from scratch
        cache.apply(VenueEvent::OrderbookDelta {
            symbol: "BTC".into(),
            begin_sequence: Some(8),
            sequence: Some(9),
            bids: vec![(dec!(98), dec!(1))],
            asks: vec![],
        });
        assert!(cache.wait_ready(ReadyKind::Orderbook, "BTC", Duration::from_millis(20)).await);
        assert_eq!(cache.get_orderbook("BTC").unwrap().bids, vec![(98.0, 1.0)]);
    }

    #[test]
    fn test_zero_size_position_is_removed() {
        let cache = LiveStateCache::new();
        cache.apply(VenueEvent::PositionUpdate(PositionEntry::from_signed("ETH", dec!(2))));
        assert_eq!(cache.get_position("eth").unwrap().side, PositionSide::Long);

        cache.apply(VenueEvent::PositionUpdate(PositionEntry::from_signed("ETH", Decimal::ZERO)));
        assert!(cache.get_position("ETH").is_none());
        assert!(cache.is_ready(ReadyKind::Positions, "ETH"));
    }

    #[test]
    fn test_positions_snapshot_replaces_table() {
        let cache = LiveStateCache::new();
        cache.apply(VenueEvent::PositionUpdate(PositionEntry::from_signed("ETH", dec!(2))));
        cache.apply(VenueEvent::PositionsSnapshot(vec![
            PositionEntry::from_signed("BTC", dec!(-1)),
            PositionEntry::from_signed("SOL", Decimal::ZERO),
        ]));

        let positions = cache.get_positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTC");
        assert!(cache.is_ready(ReadyKind::Positions, ""));
    }

    #[test]
    fn test_open_orders_merge_and_filter() {
        let cache = LiveStateCache::new();
        let order = |id: &str, symbol: &str, status: &str| OpenOrderEntry {
            order_id: id.into(),
            symbol: symbol.into(),
            side: Side::Sell,
            price: dec!(10),
            size: dec!(1),
            status: status.into(),
        };

        cache.apply(VenueEvent::OpenOrdersSnapshot(vec![
            order("1", "BTC", "open"),
            order("2", "ETH", "open"),
            order("3", "BTC", "cancelled"),
        ]));
        assert_eq!(cache.get_open_orders(None).len(), 2);

        cache.apply(VenueEvent::OrderUpdate(order("4", "BTC", "pending")));
        cache.apply(VenueEvent::OrderUpdate(order("1", "BTC", "filled")));

        let btc: Vec<String> = cache
            .get_open_orders(Some("btc"))
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        assert_eq!(btc, vec!["4"]);
    }

    #[tokio::test]
    async fn test_reset_clears_readiness_for_waiters() {
        let cache = Arc::new(LiveStateCache::new());
        cache.set_price(MarketKind::Perp, "BTC", dec!(50000));
        assert!(cache.wait_ready(ReadyKind::Price, "BTC", Duration::from_millis(10)).await);

        cache.reset();
        assert!(cache.get_price("BTC").is_none());
        assert!(!cache.wait_ready(ReadyKind::Price, "BTC", Duration::from_millis(20)).await);

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_ready(ReadyKind::Price, "btc", Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        cache.set_price(MarketKind::Perp, "BTC", dec!(50100));
        assert!(waiter.await.unwrap());
    }

    #[test]
    fn test_spot_and_perp_prices_are_separate() {
        let cache = LiveStateCache::new();
        cache.apply(VenueEvent::PriceTick {
            market: MarketKind::Spot,
            symbol: "PURR/USDC".into(),
            value: dec!(0.2),
        });
        assert!(cache.get_price("PURR/USDC").is_none());
        assert_eq!(cache.get_spot_price("purr/usdc"), Some(dec!(0.2)));
    }

    #[test]
    fn test_collateral_and_balances() {
        let cache = LiveStateCache::new();
        assert!(cache.get_collateral().is_none());
        cache.apply(VenueEvent::CollateralUpdate(Collateral {
            total_collateral: dec!(1000),
            ..Default::default()
        }));
        cache.apply(VenueEvent::BalanceUpdate(BalanceEntry {
            asset: "usdc".into(),
            total: dec!(88.5),
            available: None,
        }));

        assert_eq!(cache.get_collateral().unwrap().total_collateral, dec!(1000));
        assert_eq!(cache.get_balance("USDC").unwrap().total, dec!(88.5));
        assert!(cache.is_ready(ReadyKind::Balances, "USDC"));
        assert_eq!(cache.update_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_readers_never_see_torn_prices() {
        let cache = Arc::new(LiveStateCache::new());
        let old = dec!(50000.123456789);
        let new = dec!(61000.987654321);
        cache.set_price(MarketKind::Perp, "BTC", old);

        let writer = {
            let cache = cache.clone();
            tokio::spawn(async move {
                for i in 0..2_000 {
                    let value = if i % 2 == 0 { new } else { old };
                    cache.apply(VenueEvent::PriceTick {
                        market: MarketKind::Perp,
                        symbol: "BTC".into(),
                        value,
                    });
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let readers: Vec<_> = (0..100)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let value = cache.get_price("BTC").unwrap();
                        assert!(value == old || value == new, "torn read: {value}");
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.await.unwrap();
        }
        writer.await.unwrap();
    }

    #[test]
    fn test_snapshot_reads_are_never_partial() {
        let cache = LiveStateCache::new();
        let snapshot = || {
            VenueEvent::PositionsSnapshot(vec![
                PositionEntry::from_signed("BTC", dec!(1)),
                PositionEntry::from_signed("ETH", dec!(-2)),
            ])
        };
        let order = |id: &str| OpenOrderEntry {
            order_id: id.into(),
            symbol: "BTC".into(),
            side: Side::Buy,
            price: dec!(10),
            size: dec!(1),
            status: "open".into(),
        };
        cache.apply(snapshot());
        cache.apply(VenueEvent::OpenOrdersSnapshot(vec![order("1"), order("2")]));

        let done = std::sync::atomic::AtomicBool::new(false);
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for _ in 0..20_000 {
                    cache.apply(snapshot());
                    cache.apply(VenueEvent::OpenOrdersSnapshot(vec![order("1"), order("2")]));
                }
                done.store(true, Ordering::SeqCst);
            });

            let mut reads = 0u64;
            while !done.load(Ordering::SeqCst) || reads < 1_000 {
                assert_eq!(cache.get_positions().len(), 2);
                assert!(cache.get_position("ETH").is_some());
                assert_eq!(cache.get_open_orders(None).len(), 2);
                reads += 1;
            }
        });
    }

    #[test]
    fn test_dex_scoped_positions_and_collateral() {
        let cache = LiveStateCache::new();
        cache.apply(VenueEvent::PositionsSnapshot(vec![
            PositionEntry::from_signed("BTC", dec!(1)).with_dex("hl"),
            PositionEntry::from_signed("xyz:XYZ100", dec!(-3)).with_dex("xyz"),
        ]));
        cache.apply(VenueEvent::DexCollateralUpdate {
            dex: "XYZ".into(),
            collateral: Collateral {
                account_value: dec!(250),
                ..Default::default()
            },
        });
        cache.apply(VenueEvent::DexCollateralUpdate {
            dex: "hl".into(),
            collateral: Collateral {
                account_value: dec!(1000),
                ..Default::default()
            },
        });

        let xyz = cache.get_positions_by_dex("xyz");
        assert_eq!(xyz.len(), 1);
        assert_eq!(xyz[0].symbol, "xyz:XYZ100");
        assert_eq!(cache.get_positions_by_dex(" HL ").len(), 1);
        assert!(cache.get_positions_by_dex("flx").is_empty());

        assert_eq!(cache.get_account_value_by_dex("xyz"), Some(dec!(250)));
        assert_eq!(cache.get_account_value_by_dex("flx"), None);
        assert_eq!(cache.dex_keys(), vec!["hl", "xyz"]);
        assert!(cache.is_ready(ReadyKind::Collateral, "xyz"));

        cache.reset();
        assert!(cache.get_collateral_by_dex("hl").is_none());
        assert!(cache.dex_keys().is_empty());
    }

    #[test]
    fn test_spot_portfolio_value() {
        let cache = LiveStateCache::new();
        let balance = |asset: &str, total| {
            VenueEvent::BalanceUpdate(BalanceEntry {
                asset: asset.into(),
                total,
                available: None,
            })
        };
        cache.apply(balance("USDC", dec!(100)));
        cache.apply(balance("HYPE", dec!(2)));
        cache.apply(balance("PURR", dec!(10)));
        cache.apply(balance("UNKNOWN", dec!(5)));
        cache.set_price(MarketKind::Spot, "HYPE", dec!(25));
        cache.set_price(MarketKind::Spot, "PURR/USDC", dec!(0.2));

        assert_eq!(cache.get_spot_portfolio_value("usdc"), dec!(152));
    }

    #[tokio::test]
    async fn test_reset_drops_unwatched_readiness() {
        let cache = Arc::new(LiveStateCache::new());
        for i in 0..50 {
            assert!(!cache.wait_ready(ReadyKind::Price, &format!("COIN{i}"), Duration::from_millis(1)).await);
        }
        assert_eq!(cache.readiness_len(), 50);

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.wait_ready(ReadyKind::Price, "BTC", Duration::from_secs(5)).await })
        };
        while !cache.readiness.contains_key(&ReadyKey::new(ReadyKind::Price, "BTC")) {
            tokio::task::yield_now().await;
        }

        cache.reset();
        assert_eq!(cache.readiness_len(), 1);

        cache.set_price(MarketKind::Perp, "BTC", dec!(1));
        assert!(waiter.await.unwrap());
    }
}
