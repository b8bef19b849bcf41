//! Lighter websocket adapter

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::debug;

use super::adapter::{SharedTokenSource, VenueAdapter};
use super::errors::{ExchangeError, ExchangeResult};
use super::types::{
    decimal_from_json, BalanceEntry, BookLevels, ChannelDescriptor, Collateral, MarketKind, OpenOrderEntry,
    PositionEntry, PositionSide, Side, VenueEvent,
};

pub const MARKET_STATS: &str = "market_stats";
pub const SPOT_MARKET_STATS: &str = "spot_market_stats";
pub const ORDER_BOOK: &str = "order_book";
pub const USER_STATS: &str = "user_stats";
pub const ACCOUNT_ALL: &str = "account_all";
pub const ACCOUNT_ALL_ORDERS: &str = "account_all_orders";
pub const ACCOUNT_ALL_POSITIONS: &str = "account_all_positions";

/// Symbol to market id mapping loaded from venue metadata
#[derive(Debug, Clone, Default)]
pub struct MarketTable {
    by_symbol: HashMap<String, u32>,
    by_id: HashMap<u32, String>,
}

impl MarketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl AsRef<str>, market_id: u32) {
        let symbol = symbol.as_ref().trim().to_uppercase();
        self.by_id.insert(market_id, symbol.clone());
        self.by_symbol.insert(symbol, market_id);
    }

    pub fn market_id(&self, symbol: &str) -> Option<u32> {
        self.by_symbol.get(&symbol.trim().to_uppercase()).copied()
    }

    pub fn symbol(&self, market_id: u32) -> Option<&str> {
        self.by_id.get(&market_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl<S: AsRef<str>> FromIterator<(S, u32)> for MarketTable {
    fn from_iter<I: IntoIterator<Item = (S, u32)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (symbol, id) in iter {
            table.insert(symbol, id);
        }
        table
    }
}

/// Lighter protocol adapter.
///
/// Lighter has no application-level ping; a silent socket is caught by the
/// receive idle timeout. Private order and tx channels carry an auth token
/// that is fetched fresh every time a frame is built.
pub struct LighterAdapter {
    account: Option<String>,
    markets: RwLock<MarketTable>,
    token: Option<SharedTokenSource>,
}

impl Default for LighterAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LighterAdapter {
    pub fn new() -> Self {
        Self {
            account: None,
            markets: RwLock::new(MarketTable::new()),
            token: None,
        }
    }

    pub fn with_account(mut self, account: impl AsRef<str>) -> Self {
        let account = account.as_ref().trim().to_lowercase();
        self.account = (!account.is_empty()).then_some(account);
        self
    }

    pub fn with_markets(self, markets: MarketTable) -> Self {
        *self.markets.write() = markets;
        self
    }

    pub fn with_token_source(mut self, token: SharedTokenSource) -> Self {
        self.token = Some(token);
        self
    }

    pub fn set_markets(&self, markets: MarketTable) {
        *self.markets.write() = markets;
    }

    pub fn market_id(&self, symbol: &str) -> Option<u32> {
        self.markets.read().market_id(symbol)
    }

    fn symbol_for(&self, market_id: u32) -> Option<String> {
        self.markets.read().symbol(market_id).map(str::to_string)
    }

    /// Wire channel name, `<kind>/<suffix>`
    fn channel_name(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String> {
        let kind = descriptor.kind.as_str();
        let suffix = match kind {
            MARKET_STATS | SPOT_MARKET_STATS | ORDER_BOOK => match &descriptor.symbol {
                Some(symbol) => self
                    .market_id(symbol)
                    .ok_or_else(|| ExchangeError::InvalidConfig {
                        details: format!("unknown lighter market {symbol}"),
                    })?
                    .to_string(),
                None if kind != ORDER_BOOK => "all".to_string(),
                None => {
                    return Err(ExchangeError::InvalidConfig {
                        details: "order_book needs a symbol".to_string(),
                    })
                }
            },
            _ => descriptor
                .account
                .clone()
                .or_else(|| self.account.clone())
                .ok_or_else(|| ExchangeError::InvalidConfig {
                    details: format!("{kind} needs an account index"),
                })?,
        };
        Ok(format!("{kind}/{suffix}"))
    }

    fn decode_market_stats(&self, body: &Value, market: MarketKind, keys: &[&str]) -> Vec<VenueEvent> {
        let mut events = Vec::new();
        let mut push = |market_id: u32, stats: &Value| {
            let Some(symbol) = self.symbol_for(market_id) else {
                return;
            };
            if let Some(value) = keys.iter().find_map(|key| decimal_from_json(&stats[*key])) {
                events.push(VenueEvent::PriceTick {
                    market,
                    symbol,
                    value,
                });
            }
        };

        match body {
            Value::Object(map) if map.contains_key("market_id") => {
                if let Some(id) = as_market_id(&body["market_id"]) {
                    push(id, body);
                }
            }
            Value::Object(map) => {
                for (key, stats) in map {
                    if let Ok(id) = key.parse() {
                        push(id, stats);
                    }
                }
            }
            _ => {}
        }
        events
    }

    fn decode_order_book(&self, channel: &str, body: Value) -> ExchangeResult<Vec<VenueEvent>> {
        let market_id: u32 = channel_suffix(channel)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::Parse(format!("bad order book channel {channel}")))?;
        let Some(symbol) = self.symbol_for(market_id) else {
            debug!("[lighter] Book update for unmapped market {}", market_id);
            return Ok(Vec::new());
        };

        let book: LighterBook = serde_json::from_value(body)?;
        Ok(vec![VenueEvent::OrderbookDelta {
            symbol,
            begin_sequence: book.begin_nonce,
            sequence: book.nonce,
            bids: levels(&book.bids),
            asks: levels(&book.asks),
        }])
    }

    fn decode_positions(&self, positions: &Map<String, Value>) -> Vec<PositionEntry> {
        let mut entries = Vec::new();
        for (key, raw) in positions {
            let symbol = raw["symbol"]
                .as_str()
                .filter(|s| !s.is_empty())
                .map(str::to_uppercase)
                .or_else(|| key.parse().ok().and_then(|id| self.symbol_for(id)));
            let (Some(symbol), Some(size)) = (symbol, decimal_from_json(&raw["position"])) else {
                continue;
            };
            let size = size.abs();
            if size.is_zero() {
                continue;
            }
            let side = if raw["sign"].as_i64() == Some(-1) {
                PositionSide::Short
            } else {
                PositionSide::Long
            };
            entries.push(PositionEntry {
                symbol,
                dex: None,
                side,
                size,
                entry_price: decimal_from_json(&raw["avg_entry_price"]),
                unrealized_pnl: decimal_from_json(&raw["unrealized_pnl"]),
                raw: raw.clone(),
            });
        }
        entries
    }

    fn decode_account_all(&self, msg: &Value) -> Vec<VenueEvent> {
        let mut events = Vec::new();
        if let Some(positions) = msg["positions"].as_object() {
            events.push(VenueEvent::PositionsSnapshot(self.decode_positions(positions)));
        }

        let assets: Vec<&Value> = match &msg["assets"] {
            Value::Object(map) => map.values().collect(),
            Value::Array(list) => list.iter().collect(),
            _ => Vec::new(),
        };
        for asset in assets {
            let (Some(symbol), Some(total)) = (asset["symbol"].as_str(), decimal_from_json(&asset["balance"])) else {
                continue;
            };
            let locked = decimal_from_json(&asset["locked_balance"]).unwrap_or_default();
            events.push(VenueEvent::BalanceUpdate(BalanceEntry {
                asset: symbol.to_uppercase(),
                total,
                available: Some(total - locked),
            }));
        }
        events
    }

    fn decode_orders(&self, msg: &Value) -> Vec<VenueEvent> {
        let Some(by_market) = msg["orders"].as_object() else {
            return Vec::new();
        };

        let mut events = Vec::new();
        for (key, orders) in by_market {
            let orders: Vec<&Value> = match orders {
                Value::Array(list) => list.iter().collect(),
                Value::Null => Vec::new(),
                single => vec![single],
            };
            for order in orders {
                let Some(order_id) = id_string(&order["order_index"]) else {
                    continue;
                };
                let market_id = as_market_id(&order["market_index"]).or_else(|| key.parse().ok());
                let Some(symbol) = market_id.and_then(|id| self.symbol_for(id)) else {
                    continue;
                };
                let size = decimal_from_json(&order["remaining_base_amount"])
                    .or_else(|| decimal_from_json(&order["initial_base_amount"]))
                    .unwrap_or_default();
                events.push(VenueEvent::OrderUpdate(OpenOrderEntry {
                    order_id,
                    symbol,
                    side: if order["is_ask"].as_bool().unwrap_or(false) {
                        Side::Sell
                    } else {
                        Side::Buy
                    },
                    price: decimal_from_json(&order["price"]).unwrap_or_default(),
                    size,
                    status: order["status"].as_str().unwrap_or_default().to_string(),
                }));
            }
        }
        events
    }
}

impl VenueAdapter for LighterAdapter {
    fn name(&self) -> &str {
        "lighter"
    }

    fn build_subscribe_frame(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String> {
        let channel = self.channel_name(descriptor)?;
        let mut frame = json!({ "type": "subscribe", "channel": channel });
        if channel.contains("orders") || channel.contains("tx") {
            if let Some(token) = self.token.as_ref().and_then(|t| t.token()) {
                frame["auth"] = json!(token);
            }
        }
        Ok(frame.to_string())
    }

    fn build_unsubscribe_frame(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String> {
        Ok(json!({ "type": "unsubscribe", "channel": self.channel_name(descriptor)? }).to_string())
    }

    fn decode(&self, frame: &str) -> ExchangeResult<Vec<VenueEvent>> {
        let msg: Value = match serde_json::from_str(frame) {
            Ok(msg) => msg,
            // Plain-text session greeting
            Err(_) if frame.trim().to_lowercase().starts_with("connection established") => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let channel = msg["channel"].as_str().unwrap_or_default();
        let kind = msg["type"].as_str().unwrap_or_default();

        if kind == "pong" || channel == "pong" {
            return Ok(vec![VenueEvent::Heartbeat]);
        }
        if kind == "connected" {
            return Ok(Vec::new());
        }
        if kind == "error" || msg.get("error").is_some() {
            let message = match &msg["error"] {
                Value::Null => msg.to_string(),
                Value::String(s) => s.clone(),
                Value::Object(e) => e
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| msg["error"].to_string()),
                other => other.to_string(),
            };
            return Ok(vec![VenueEvent::Error { message }]);
        }

        let prefix = channel.split(':').next().unwrap_or_default();
        let events = match prefix {
            MARKET_STATS => self.decode_market_stats(
                &msg["market_stats"],
                MarketKind::Perp,
                &["mark_price", "last_trade_price", "index_price"],
            ),
            SPOT_MARKET_STATS => self.decode_market_stats(
                &msg["spot_market_stats"],
                MarketKind::Spot,
                &["mid_price", "last_trade_price"],
            ),
            ORDER_BOOK => return self.decode_order_book(channel, msg["order_book"].clone()),
            USER_STATS => match msg.get("stats") {
                Some(stats) if !stats.is_null() => {
                    let stats: LighterStats = serde_json::from_value(stats.clone())?;
                    vec![VenueEvent::CollateralUpdate(stats.into())]
                }
                _ => Vec::new(),
            },
            ACCOUNT_ALL => self.decode_account_all(&msg),
            ACCOUNT_ALL_POSITIONS => match msg["positions"].as_object() {
                Some(positions) => self
                    .decode_positions(positions)
                    .into_iter()
                    .map(VenueEvent::PositionUpdate)
                    .collect(),
                None => Vec::new(),
            },
            ACCOUNT_ALL_ORDERS => self.decode_orders(&msg),
            _ => {
                debug!("[lighter] Ignoring channel {:?} type {:?}", channel, kind);
                Vec::new()
            }
        };
        Ok(events)
    }

    fn baseline_channels(&self) -> Vec<ChannelDescriptor> {
        let mut channels = vec![
            ChannelDescriptor::new(MARKET_STATS),
            ChannelDescriptor::new(SPOT_MARKET_STATS),
        ];
        if let Some(account) = &self.account {
            channels.push(ChannelDescriptor::new(USER_STATS).with_account(account));
            channels.push(ChannelDescriptor::new(ACCOUNT_ALL).with_account(account));
            if self.token.is_some() {
                channels.push(ChannelDescriptor::new(ACCOUNT_ALL_ORDERS).with_account(account));
            }
        }
        channels
    }

    fn orderbook_channel(&self, symbol: &str) -> Option<ChannelDescriptor> {
        self.market_id(symbol)
            .map(|_| ChannelDescriptor::new(ORDER_BOOK).with_symbol(symbol))
    }

    fn orderbook_symbol(&self, descriptor: &ChannelDescriptor) -> Option<String> {
        (descriptor.kind == ORDER_BOOK).then(|| descriptor.symbol.clone()).flatten()
    }
}

fn channel_suffix(channel: &str) -> Option<&str> {
    channel.split_once(':').map(|(_, suffix)| suffix)
}

fn as_market_id(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn levels(raw: &[LighterLevel]) -> BookLevels {
    raw.iter()
        .filter_map(|level| Some((decimal_from_json(&level.price)?, decimal_from_json(&level.size)?)))
        .collect()
}

#[derive(Debug, Deserialize)]
struct LighterBook {
    begin_nonce: Option<u64>,
    nonce: Option<u64>,
    #[serde(default)]
    asks: Vec<LighterLevel>,
    #[serde(default)]
    bids: Vec<LighterLevel>,
}

#[derive(Debug, Deserialize)]
struct LighterLevel {
    price: Value,
    size: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LighterStats {
    collateral: Value,
    available_balance: Value,
    portfolio_value: Value,
    leverage: Value,
    margin_usage: Value,
    buying_power: Value,
}

impl From<LighterStats> for Collateral {
    fn from(stats: LighterStats) -> Self {
        let field = |v: &Value| decimal_from_json(v).unwrap_or(Decimal::ZERO);
        let portfolio_value = field(&stats.portfolio_value);
        Collateral {
            total_collateral: field(&stats.collateral),
            available_collateral: field(&stats.available_balance),
            portfolio_value,
            account_value: portfolio_value,
            leverage: field(&stats.leverage),
            margin_usage: field(&stats.margin_usage),
            buying_power: field(&stats.buying_power),
        }
    }
}
