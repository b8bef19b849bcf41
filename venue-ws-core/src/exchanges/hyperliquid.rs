//! Hyperliquid websocket adapter

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use super::adapter::{SharedSigner, VenueAdapter};
use super::errors::{ExchangeError, ExchangeResult};
use super::types::{
    BalanceEntry, BookLevels, ChannelDescriptor, Collateral, MarketKind, OpenOrderEntry, PositionEntry, Side,
    VenueEvent,
};

pub const ALL_MIDS: &str = "allMids";
pub const L2_BOOK: &str = "l2Book";
pub const CLEARINGHOUSE_STATE: &str = "allDexsClearinghouseState";
pub const SPOT_STATE: &str = "spotState";
pub const OPEN_ORDERS: &str = "openOrders";

/// Key of the main perp dex, which the venue reports as `""`
pub const MAIN_DEX: &str = "hl";

/// A spot pair referenced as `@<index>` in mids and orders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotPair {
    pub base: String,
    pub quote: String,
}

impl SpotPair {
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().trim().to_uppercase(),
            quote: quote.as_ref().trim().to_uppercase(),
        }
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.base, self.quote)
    }
}

#[derive(Debug, Default)]
struct MetaState {
    primed: bool,
    dex_order: Vec<String>,
    spot_pairs: HashMap<u32, SpotPair>,
}

/// Venue metadata shared by every adapter handed the same `Arc`.
///
/// Loaded once per process: the first [`HyperliquidMeta::prime`] wins and
/// later calls are ignored, so clients created later on a pool see the same
/// dex order and spot pair table.
#[derive(Debug, Default)]
pub struct HyperliquidMeta {
    state: RwLock<MetaState>,
}

impl HyperliquidMeta {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the dex order and `@<index>` spot pair table. Returns `false`
    /// when metadata was already primed.
    pub fn prime<I, S>(&self, dex_order: I, spot_pairs: HashMap<u32, SpotPair>) -> bool
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.write();
        if state.primed {
            debug!("[hyperliquid] Metadata already primed");
            return false;
        }

        let mut order: Vec<String> = Vec::new();
        for dex in dex_order {
            let dex = dex.as_ref().trim().to_lowercase();
            if !dex.is_empty() && !order.contains(&dex) {
                order.push(dex);
            }
        }
        if order.is_empty() {
            order.push(MAIN_DEX.to_string());
        }

        state.dex_order = order;
        state.spot_pairs = spot_pairs;
        state.primed = true;
        true
    }

    pub fn is_primed(&self) -> bool {
        self.state.read().primed
    }

    /// Replaces the spot pair table regardless of priming
    pub fn set_spot_pairs(&self, pairs: HashMap<u32, SpotPair>) {
        self.state.write().spot_pairs = pairs;
    }

    pub fn spot_pair(&self, index: u32) -> Option<SpotPair> {
        self.state.read().spot_pairs.get(&index).cloned()
    }

    pub fn dex_order(&self) -> Vec<String> {
        self.state.read().dex_order.clone()
    }
}

/// Hyperliquid protocol adapter.
///
/// Perp mids arrive keyed by coin; spot mids arrive either as `BASE/QUOTE` or
/// as `@<pair index>`, which needs the spot pair table from venue metadata.
pub struct HyperliquidAdapter {
    address: Option<String>,
    dexes: Vec<String>,
    meta: Arc<HyperliquidMeta>,
    signer: Option<SharedSigner>,
}

impl Default for HyperliquidAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl HyperliquidAdapter {
    pub fn new() -> Self {
        Self {
            address: None,
            dexes: Vec::new(),
            meta: Arc::new(HyperliquidMeta::new()),
            signer: None,
        }
    }

    /// Enables the account channels for `address`
    pub fn with_address(mut self, address: impl AsRef<str>) -> Self {
        let address = address.as_ref().trim().to_lowercase();
        self.address = (!address.is_empty()).then_some(address);
        self
    }

    /// Shares venue metadata with other adapters
    pub fn with_meta(mut self, meta: Arc<HyperliquidMeta>) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta(&self) -> &Arc<HyperliquidMeta> {
        &self.meta
    }

    /// Builder dexes whose mids are subscribed next to the main dex
    pub fn with_dexes<I, S>(mut self, dexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.dexes = dexes
            .into_iter()
            .map(|d| d.as_ref().trim().to_lowercase())
            .filter(|d| !d.is_empty() && d != "hl")
            .collect();
        self
    }

    pub fn with_signer(mut self, signer: SharedSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Installs the `@<index>` spot pair table loaded from venue metadata
    pub fn set_spot_pairs(&self, pairs: HashMap<u32, SpotPair>) {
        self.meta.set_spot_pairs(pairs);
    }

    fn spot_pair(&self, coin: &str) -> Option<SpotPair> {
        let index: u32 = coin.strip_prefix('@')?.parse().ok()?;
        self.meta.spot_pair(index)
    }

    /// Builder dexes to follow: the explicit list, else the primed dex order
    fn builder_dexes(&self) -> Vec<String> {
        if !self.dexes.is_empty() {
            return self.dexes.clone();
        }
        self.meta
            .dex_order()
            .into_iter()
            .filter(|dex| dex != MAIN_DEX)
            .collect()
    }

    fn account(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String> {
        descriptor
            .account
            .clone()
            .or_else(|| self.address.clone())
            .ok_or_else(|| ExchangeError::InvalidConfig {
                details: format!("{} needs a user address", descriptor.kind),
            })
    }

    fn subscription(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<Value> {
        let mut subscription = json!({ "type": descriptor.kind });
        match descriptor.kind.as_str() {
            ALL_MIDS => {
                if let Some(dex) = &descriptor.dex {
                    subscription["dex"] = json!(dex);
                }
            }
            L2_BOOK => {
                let coin = descriptor.symbol.as_deref().ok_or_else(|| ExchangeError::InvalidConfig {
                    details: "l2Book needs a coin".to_string(),
                })?;
                subscription["coin"] = json!(wire_coin(coin));
            }
            CLEARINGHOUSE_STATE | SPOT_STATE => {
                subscription["user"] = json!(self.account(descriptor)?);
            }
            OPEN_ORDERS => {
                subscription["user"] = json!(self.account(descriptor)?);
                subscription["dex"] = json!("ALL_DEXS");
            }
            _ => {
                if let Some(account) = &descriptor.account {
                    subscription["user"] = json!(account);
                }
                if let Some(dex) = &descriptor.dex {
                    subscription["dex"] = json!(dex);
                }
                if let Some(symbol) = &descriptor.symbol {
                    subscription["coin"] = json!(wire_coin(symbol));
                }
            }
        }
        Ok(subscription)
    }

    fn decode_mids(&self, data: Value) -> ExchangeResult<Vec<VenueEvent>> {
        let mids: AllMidsData = serde_json::from_value(data)?;
        let mut events = Vec::with_capacity(mids.mids.len());

        for (key, raw) in mids.mids {
            let Ok(value) = Decimal::from_str(raw.trim()) else {
                continue;
            };
            let key = key.trim();
            if key.starts_with('@') {
                // Unknown pair indexes wait for the metadata table
                if let Some(pair) = self.spot_pair(key) {
                    push_spot(&mut events, &pair, value);
                }
            } else if let Some((base, quote)) = key.split_once('/') {
                push_spot(&mut events, &SpotPair::new(base, quote), value);
            } else if !key.is_empty() {
                events.push(VenueEvent::PriceTick {
                    market: MarketKind::Perp,
                    symbol: key.to_uppercase(),
                    value,
                });
            }
        }
        Ok(events)
    }

    fn decode_book(data: Value) -> ExchangeResult<Vec<VenueEvent>> {
        let book: L2BookData = serde_json::from_value(data)?;
        let mut sides = book.levels.into_iter();
        let bids = levels(sides.next().unwrap_or_default())?;
        let asks = levels(sides.next().unwrap_or_default())?;
        Ok(vec![VenueEvent::OrderbookSnapshot {
            symbol: book.coin.to_uppercase(),
            bids,
            asks,
            sequence: None,
        }])
    }

    fn decode_clearinghouse(data: Value) -> ExchangeResult<Vec<VenueEvent>> {
        let state: AllDexsClearinghouseData = serde_json::from_value(data)?;
        let mut positions = Vec::new();
        let mut per_dex = Vec::with_capacity(state.clearinghouse_states.len());
        let mut totals = MarginTotals::default();

        for (dex, ch) in state.clearinghouse_states {
            let dex = match dex.trim() {
                "" => MAIN_DEX.to_string(),
                other => other.to_lowercase(),
            };
            let margin = MarginTotals {
                account_value: decimal("accountValue", &ch.margin_summary.account_value)?,
                margin_used: decimal("totalMarginUsed", &ch.margin_summary.total_margin_used)?,
                notional: decimal("totalNtlPos", &ch.margin_summary.total_ntl_pos)?,
                withdrawable: decimal("withdrawable", &ch.withdrawable)?,
            };
            totals.add(&margin);
            per_dex.push(VenueEvent::DexCollateralUpdate {
                dex: dex.clone(),
                collateral: margin.collateral(),
            });

            for asset in ch.asset_positions {
                let raw = asset.position.clone();
                let position: HlPosition = serde_json::from_value(asset.position)?;
                let mut entry = PositionEntry::from_signed(position.coin.to_uppercase(), decimal("szi", &position.szi)?)
                    .with_dex(&dex);
                if entry.is_flat() {
                    continue;
                }
                entry.entry_price = position.entry_px.as_deref().and_then(|v| Decimal::from_str(v).ok());
                entry.unrealized_pnl = position.unrealized_pnl.as_deref().and_then(|v| Decimal::from_str(v).ok());
                entry.raw = raw;
                positions.push(entry);
            }
        }

        let mut events = vec![VenueEvent::PositionsSnapshot(positions)];
        events.extend(per_dex);
        events.push(VenueEvent::CollateralUpdate(totals.collateral()));
        Ok(events)
    }

    fn decode_spot_state(data: Value) -> ExchangeResult<Vec<VenueEvent>> {
        let state: SpotStateData = serde_json::from_value(data)?;
        state
            .spot_state
            .balances
            .into_iter()
            .map(|b| {
                let total = decimal("total", &b.total)?;
                let hold = match b.hold.as_deref() {
                    Some(hold) => decimal("hold", hold)?,
                    None => Decimal::ZERO,
                };
                Ok(VenueEvent::BalanceUpdate(BalanceEntry {
                    asset: b.coin.to_uppercase(),
                    total,
                    available: Some(total - hold),
                }))
            })
            .collect()
    }

    fn decode_open_orders(&self, data: Value) -> ExchangeResult<Vec<VenueEvent>> {
        let data: OpenOrdersData = serde_json::from_value(data)?;
        let mut orders = Vec::with_capacity(data.orders.len());
        for order in data.orders {
            let symbol = if order.coin.starts_with('@') {
                match self.spot_pair(&order.coin) {
                    Some(pair) => pair.name(),
                    None => {
                        debug!("[hyperliquid] Skipping order {} on unmapped pair {}", order.oid, order.coin);
                        continue;
                    }
                }
            } else {
                order.coin.to_uppercase()
            };
            orders.push(OpenOrderEntry {
                order_id: order.oid.to_string(),
                symbol,
                side: if order.side == "A" { Side::Sell } else { Side::Buy },
                price: decimal("limitPx", &order.limit_px)?,
                size: decimal("sz", &order.sz)?,
                status: "open".to_string(),
            });
        }
        Ok(vec![VenueEvent::OpenOrdersSnapshot(orders)])
    }

    fn decode_post(data: Value) -> ExchangeResult<Vec<VenueEvent>> {
        let post: PostData = serde_json::from_value(data)?;
        let result = match post.response.kind.as_str() {
            "error" => Err(text_of(&post.response.payload)),
            _ => match post.response.payload.get("status").and_then(Value::as_str) {
                Some("err") => Err(text_of(&post.response.payload["response"])),
                _ => Ok(post.response.payload),
            },
        };
        Ok(vec![VenueEvent::RequestResponse { id: post.id, result }])
    }
}

impl VenueAdapter for HyperliquidAdapter {
    fn name(&self) -> &str {
        "hyperliquid"
    }

    fn build_ping_frame(&self) -> Option<String> {
        Some(json!({ "method": "ping" }).to_string())
    }

    fn build_subscribe_frame(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String> {
        Ok(json!({ "method": "subscribe", "subscription": self.subscription(descriptor)? }).to_string())
    }

    fn build_unsubscribe_frame(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String> {
        Ok(json!({ "method": "unsubscribe", "subscription": self.subscription(descriptor)? }).to_string())
    }

    /// `action` payloads are signed before sending; `info` payloads go as-is.
    fn build_request_frame(&self, id: u64, request_type: &str, payload: &Value) -> ExchangeResult<String> {
        let payload = match request_type {
            "action" => {
                let signer = self.signer.as_ref().ok_or_else(|| ExchangeError::InvalidConfig {
                    details: "hyperliquid actions need a signer".to_string(),
                })?;
                signer.sign(payload)?
            }
            "info" => payload.clone(),
            other => {
                return Err(ExchangeError::Unsupported {
                    operation: format!("hyperliquid {other} request"),
                })
            }
        };
        Ok(json!({
            "method": "post",
            "id": id,
            "request": { "type": request_type, "payload": payload },
        })
        .to_string())
    }

    fn decode(&self, frame: &str) -> ExchangeResult<Vec<VenueEvent>> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        match envelope.channel.as_str() {
            ALL_MIDS => self.decode_mids(envelope.data),
            L2_BOOK => Self::decode_book(envelope.data),
            CLEARINGHOUSE_STATE => Self::decode_clearinghouse(envelope.data),
            SPOT_STATE => Self::decode_spot_state(envelope.data),
            OPEN_ORDERS => self.decode_open_orders(envelope.data),
            "post" => Self::decode_post(envelope.data),
            "pong" => Ok(vec![VenueEvent::Heartbeat]),
            "error" => Ok(vec![VenueEvent::Error {
                message: text_of(&envelope.data),
            }]),
            "subscriptionResponse" => Ok(Vec::new()),
            other => {
                debug!("[hyperliquid] Ignoring channel {}", other);
                Ok(Vec::new())
            }
        }
    }

    fn baseline_channels(&self) -> Vec<ChannelDescriptor> {
        let mut channels = vec![ChannelDescriptor::new(ALL_MIDS)];
        channels.extend(
            self.builder_dexes()
                .iter()
                .map(|dex| ChannelDescriptor::new(ALL_MIDS).with_dex(dex)),
        );
        if let Some(address) = &self.address {
            for kind in [CLEARINGHOUSE_STATE, SPOT_STATE, OPEN_ORDERS] {
                channels.push(ChannelDescriptor::new(kind).with_account(address));
            }
        }
        channels
    }

    fn orderbook_channel(&self, symbol: &str) -> Option<ChannelDescriptor> {
        Some(ChannelDescriptor::new(L2_BOOK).with_symbol(symbol))
    }

    fn orderbook_symbol(&self, descriptor: &ChannelDescriptor) -> Option<String> {
        (descriptor.kind == L2_BOOK).then(|| descriptor.symbol.clone()).flatten()
    }
}

/// Builder-dex coins are sent as `dex:COIN` with a lowercase dex prefix
fn wire_coin(symbol: &str) -> String {
    match symbol.split_once(':') {
        Some((dex, coin)) => format!("{}:{}", dex.to_lowercase(), coin),
        None => symbol.to_string(),
    }
}

/// Margin figures of one dex, or summed over all of them
#[derive(Debug, Default)]
struct MarginTotals {
    account_value: Decimal,
    margin_used: Decimal,
    notional: Decimal,
    withdrawable: Decimal,
}

impl MarginTotals {
    fn add(&mut self, other: &MarginTotals) {
        self.account_value += other.account_value;
        self.margin_used += other.margin_used;
        self.notional += other.notional;
        self.withdrawable += other.withdrawable;
    }

    fn collateral(&self) -> Collateral {
        let ratio = |numerator: Decimal| {
            if self.account_value.is_zero() {
                Decimal::ZERO
            } else {
                numerator / self.account_value
            }
        };
        Collateral {
            total_collateral: self.account_value,
            available_collateral: self.withdrawable,
            portfolio_value: self.account_value,
            account_value: self.account_value,
            leverage: ratio(self.notional),
            margin_usage: ratio(self.margin_used),
            buying_power: self.withdrawable,
        }
    }
}

fn push_spot(events: &mut Vec<VenueEvent>, pair: &SpotPair, value: Decimal) {
    events.push(VenueEvent::PriceTick {
        market: MarketKind::Spot,
        symbol: pair.name(),
        value,
    });
    if pair.quote == "USDC" {
        events.push(VenueEvent::PriceTick {
            market: MarketKind::Spot,
            symbol: pair.base.clone(),
            value,
        });
    }
}

fn levels(raw: Vec<HlLevel>) -> ExchangeResult<BookLevels> {
    raw.into_iter()
        .map(|level| Ok((decimal("px", &level.px)?, decimal("sz", &level.sz)?)))
        .collect()
}

fn decimal(field: &str, raw: &str) -> ExchangeResult<Decimal> {
    Decimal::from_str(raw.trim()).map_err(|e| ExchangeError::Parse(format!("{field}={raw:?}: {e}")))
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    channel: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
struct AllMidsData {
    mids: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct L2BookData {
    coin: String,
    levels: Vec<Vec<HlLevel>>,
}

#[derive(Debug, Deserialize)]
struct HlLevel {
    px: String,
    sz: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AllDexsClearinghouseData {
    clearinghouse_states: Vec<(String, ClearinghouseState)>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearinghouseState {
    margin_summary: MarginSummary,
    #[serde(default)]
    asset_positions: Vec<AssetPosition>,
    #[serde(default = "zero")]
    withdrawable: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarginSummary {
    account_value: String,
    #[serde(default = "zero")]
    total_ntl_pos: String,
    #[serde(default = "zero")]
    total_margin_used: String,
}

#[derive(Debug, Deserialize)]
struct AssetPosition {
    position: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HlPosition {
    coin: String,
    szi: String,
    entry_px: Option<String>,
    unrealized_pnl: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpotStateData {
    spot_state: SpotBalances,
}

#[derive(Debug, Deserialize)]
struct SpotBalances {
    #[serde(default)]
    balances: Vec<HlBalance>,
}

#[derive(Debug, Deserialize)]
struct HlBalance {
    coin: String,
    total: String,
    hold: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenOrdersData {
    #[serde(default)]
    orders: Vec<HlOrder>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HlOrder {
    coin: String,
    side: String,
    limit_px: String,
    sz: String,
    oid: u64,
}

#[derive(Debug, Deserialize)]
struct PostData {
    id: u64,
    response: PostResponse,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

fn zero() -> String {
    "0".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::cache::LiveStateCache;
    use crate::exchanges::types::PositionSide;
    use rust_decimal_macros::dec;

    fn adapter() -> HyperliquidAdapter {
        let adapter = HyperliquidAdapter::new()
            .with_address("0xABCdef")
            .with_dexes(["xyz"]);
        adapter.set_spot_pairs(HashMap::from([(107, SpotPair::new("hype", "usdc"))]));
        adapter
    }

    fn price(events: &[VenueEvent], market: MarketKind, symbol: &str) -> Option<Decimal> {
        events.iter().find_map(|e| match e {
            VenueEvent::PriceTick { market: m, symbol: s, value } if *m == market && s == symbol => Some(*value),
            _ => None,
        })
    }

    #[test]
    fn test_subscribe_frames() {
        let adapter = adapter();
        let frame = adapter
            .build_subscribe_frame(&ChannelDescriptor::new(OPEN_ORDERS).with_account("0xABCdef"))
            .unwrap();
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["method"], "subscribe");
        assert_eq!(frame["subscription"]["type"], "openOrders");
        assert_eq!(frame["subscription"]["user"], "0xabcdef");
        assert_eq!(frame["subscription"]["dex"], "ALL_DEXS");

        let frame = adapter
            .build_unsubscribe_frame(&ChannelDescriptor::new(L2_BOOK).with_symbol("xyz:xyz100"))
            .unwrap();
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["method"], "unsubscribe");
        assert_eq!(frame["subscription"]["coin"], "xyz:XYZ100");

        assert!(HyperliquidAdapter::new()
            .build_subscribe_frame(&ChannelDescriptor::new(SPOT_STATE))
            .is_err());
    }

    #[test]
    fn test_baseline_channels() {
        let channels = adapter().baseline_channels();
        let kinds: Vec<_> = channels.iter().map(|c| c.to_string()).collect();
        assert_eq!(
            kinds,
            vec![
                "allMids",
                "allMids:xyz",
                "allDexsClearinghouseState:0xabcdef",
                "spotState:0xabcdef",
                "openOrders:0xabcdef",
            ]
        );
        assert_eq!(HyperliquidAdapter::new().baseline_channels().len(), 1);
    }

    #[test]
    fn test_decode_all_mids() {
        let frame = r#"{"channel":"allMids","data":{"mids":{"BTC":"97000.5","PURR/USDC":"0.21","@107":"25.1","@999":"1.0","xyz:XYZ100":"10"}}}"#;
        let events = adapter().decode(frame).unwrap();

        assert_eq!(price(&events, MarketKind::Perp, "BTC"), Some(dec!(97000.5)));
        assert_eq!(price(&events, MarketKind::Perp, "XYZ:XYZ100"), Some(dec!(10)));
        assert_eq!(price(&events, MarketKind::Spot, "PURR/USDC"), Some(dec!(0.21)));
        assert_eq!(price(&events, MarketKind::Spot, "PURR"), Some(dec!(0.21)));
        assert_eq!(price(&events, MarketKind::Spot, "HYPE"), Some(dec!(25.1)));
        assert_eq!(price(&events, MarketKind::Perp, "@999"), None);
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn test_decode_l2_book() {
        let frame = r#"{"channel":"l2Book","data":{"coin":"ETH","time":1700000000000,"levels":[[{"px":"2500.1","sz":"3","n":2}],[{"px":"2500.2","sz":"1.5","n":1}]]}}"#;
        let events = adapter().decode(frame).unwrap();
        assert_eq!(
            events,
            vec![VenueEvent::OrderbookSnapshot {
                symbol: "ETH".into(),
                bids: vec![(dec!(2500.1), dec!(3))],
                asks: vec![(dec!(2500.2), dec!(1.5))],
                sequence: None,
            }]
        );
    }

    #[test]
    fn test_decode_clearinghouse_state() {
        let frame = r#"{"channel":"allDexsClearinghouseState","data":{"user":"0xabcdef","clearinghouseStates":[
            ["",{"marginSummary":{"accountValue":"1000","totalNtlPos":"2000","totalMarginUsed":"250"},"withdrawable":"600",
                 "assetPositions":[{"position":{"coin":"BTC","szi":"-0.5","entryPx":"97000","unrealizedPnl":"12.5"}},
                                   {"position":{"coin":"ETH","szi":"0.0"}}]}],
            ["xyz",{"marginSummary":{"accountValue":"0"},"withdrawable":"0","assetPositions":[]}]]}}"#;
        let events = adapter().decode(frame).unwrap();

        let VenueEvent::PositionsSnapshot(positions) = &events[0] else {
            panic!("expected positions snapshot, got {:?}", events[0]);
        };
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "BTC");
        assert_eq!(positions[0].dex.as_deref(), Some("hl"));
        assert_eq!(positions[0].side, PositionSide::Short);
        assert_eq!(positions[0].size, dec!(0.5));
        assert_eq!(positions[0].entry_price, Some(dec!(97000)));

        let dexes: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                VenueEvent::DexCollateralUpdate { dex, .. } => Some(dex.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(dexes, vec!["hl", "xyz"]);

        let Some(VenueEvent::CollateralUpdate(collateral)) = events.last() else {
            panic!("expected collateral, got {:?}", events.last());
        };
        assert_eq!(collateral.account_value, dec!(1000));
        assert_eq!(collateral.available_collateral, dec!(600));
        assert_eq!(collateral.leverage, dec!(2));
        assert_eq!(collateral.margin_usage, dec!(0.25));
    }

    #[test]
    fn test_per_dex_state_reaches_cache() {
        let frame = r#"{"channel":"allDexsClearinghouseState","data":{"clearinghouseStates":[
            ["",{"marginSummary":{"accountValue":"1000","totalMarginUsed":"100"},"withdrawable":"900",
                 "assetPositions":[{"position":{"coin":"BTC","szi":"0.1"}}]}],
            ["xyz",{"marginSummary":{"accountValue":"300","totalMarginUsed":"150"},"withdrawable":"150",
                 "assetPositions":[{"position":{"coin":"xyz:XYZ100","szi":"-4"}}]}]]}}"#;
        let cache = LiveStateCache::new();
        for event in adapter().decode(frame).unwrap() {
            cache.apply(event);
        }

        assert_eq!(cache.get_account_value_by_dex("hl"), Some(dec!(1000)));
        assert_eq!(cache.get_account_value_by_dex("xyz"), Some(dec!(300)));
        assert_eq!(cache.get_collateral_by_dex("xyz").unwrap().margin_usage, dec!(0.5));
        assert_eq!(cache.get_collateral().unwrap().account_value, dec!(1300));

        let xyz = cache.get_positions_by_dex("xyz");
        assert_eq!(xyz.len(), 1);
        assert_eq!(xyz[0].symbol, "XYZ:XYZ100");
        assert_eq!(xyz[0].side, PositionSide::Short);
        assert_eq!(cache.get_positions_by_dex("hl")[0].symbol, "BTC");
    }

    #[test]
    fn test_shared_meta_is_primed_once() {
        let meta = Arc::new(HyperliquidMeta::new());
        assert!(meta.prime(["HL", "xyz", "xyz", "flx"], HashMap::from([(107, SpotPair::new("hype", "usdc"))])));
        assert!(!meta.prime(["hl"], HashMap::new()));
        assert_eq!(meta.dex_order(), vec!["hl", "xyz", "flx"]);

        let first = HyperliquidAdapter::new().with_meta(meta.clone());
        let second = HyperliquidAdapter::new().with_meta(meta.clone());
        let kinds: Vec<String> = second.baseline_channels().iter().map(|c| c.to_string()).collect();
        assert_eq!(kinds, vec!["allMids", "allMids:xyz", "allMids:flx"]);

        let events = first.decode(r#"{"channel":"allMids","data":{"mids":{"@107":"25"}}}"#).unwrap();
        assert_eq!(price(&events, MarketKind::Spot, "HYPE/USDC"), Some(dec!(25)));

        // A table installed through one adapter is visible to the other
        first.set_spot_pairs(HashMap::from([(5, SpotPair::new("purr", "usdc"))]));
        let events = second.decode(r#"{"channel":"allMids","data":{"mids":{"@5":"0.2"}}}"#).unwrap();
        assert_eq!(price(&events, MarketKind::Spot, "PURR"), Some(dec!(0.2)));
    }

    #[test]
    fn test_decode_spot_state_and_orders() {
        let adapter = adapter();
        let events = adapter
            .decode(r#"{"channel":"spotState","data":{"user":"0xabcdef","spotState":{"balances":[{"coin":"USDC","token":0,"total":"88.5","hold":"8.5"}]}}}"#)
            .unwrap();
        assert_eq!(
            events,
            vec![VenueEvent::BalanceUpdate(BalanceEntry {
                asset: "USDC".into(),
                total: dec!(88.5),
                available: Some(dec!(80.0)),
            })]
        );

        let events = adapter
            .decode(r#"{"channel":"openOrders","data":{"orders":[
                {"coin":"BTC","side":"B","limitPx":"90000","sz":"0.1","oid":11},
                {"coin":"@107","side":"A","limitPx":"30","sz":"2","oid":12},
                {"coin":"@5","side":"A","limitPx":"1","sz":"1","oid":13}]}}"#)
            .unwrap();
        let VenueEvent::OpenOrdersSnapshot(orders) = &events[0] else {
            panic!("expected open orders");
        };
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[1].symbol, "HYPE/USDC");
        assert_eq!(orders[1].side, Side::Sell);
    }

    #[test]
    fn test_post_round_trip_uses_signer() {
        let signer: SharedSigner = Arc::new(|action: &Value| -> ExchangeResult<Value> {
            Ok(json!({"action": action, "signature": "0xsig"}))
        });
        let adapter = HyperliquidAdapter::new().with_signer(signer);

        let frame = adapter.build_request_frame(7, "action", &json!({"type": "cancel"})).unwrap();
        let frame: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["method"], "post");
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["request"]["payload"]["signature"], "0xsig");

        assert!(HyperliquidAdapter::new()
            .build_request_frame(1, "action", &json!({}))
            .is_err());

        let ok = adapter
            .decode(r#"{"channel":"post","data":{"id":7,"response":{"type":"action","payload":{"status":"ok","response":{"type":"cancel"}}}}}"#)
            .unwrap();
        assert!(matches!(&ok[0], VenueEvent::RequestResponse { id: 7, result: Ok(_) }));

        let err = adapter
            .decode(r#"{"channel":"post","data":{"id":8,"response":{"type":"error","payload":"bad nonce"}}}"#)
            .unwrap();
        assert_eq!(
            err,
            vec![VenueEvent::RequestResponse {
                id: 8,
                result: Err("bad nonce".into())
            }]
        );
    }

    #[test]
    fn test_decode_control_frames() {
        let adapter = adapter();
        assert_eq!(adapter.decode(r#"{"channel":"pong"}"#).unwrap(), vec![VenueEvent::Heartbeat]);
        assert_eq!(
            adapter
                .decode(r#"{"channel":"error","data":"Already subscribed: {\"type\":\"allMids\"}"}"#)
                .unwrap()
                .len(),
            1
        );
        assert!(adapter.decode(r#"{"channel":"trades","data":[]}"#).unwrap().is_empty());
        assert!(adapter.decode("{not json").is_err());
    }

    #[test]
    fn test_orderbook_channel_mapping() {
        let adapter = adapter();
        let channel = adapter.orderbook_channel("eth").unwrap();
        assert_eq!(adapter.orderbook_symbol(&channel).as_deref(), Some("ETH"));
        assert_eq!(adapter.orderbook_symbol(&ChannelDescriptor::new(ALL_MIDS)), None);
    }
}
