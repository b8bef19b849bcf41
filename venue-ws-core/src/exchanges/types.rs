//! Exchange data types

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Identifies one subscribable stream on a venue.
///
/// Fields are normalized on construction: the account and dex are lowercased,
/// the symbol uppercased, and all of them trimmed. Empty optional fields are
/// stored as `None`, so two descriptors compare equal iff every populated field
/// matches after normalization.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawChannelDescriptor")]
pub struct ChannelDescriptor {
    pub kind: String,
    pub account: Option<String>,
    pub symbol: Option<String>,
    pub dex: Option<String>,
}

impl ChannelDescriptor {
    pub fn new(kind: impl AsRef<str>) -> Self {
        Self {
            kind: kind.as_ref().trim().to_string(),
            account: None,
            symbol: None,
            dex: None,
        }
    }

    pub fn with_account(mut self, account: impl AsRef<str>) -> Self {
        self.account = normalized(account.as_ref(), str::to_lowercase);
        self
    }

    pub fn with_symbol(mut self, symbol: impl AsRef<str>) -> Self {
        self.symbol = normalized(symbol.as_ref(), str::to_uppercase);
        self
    }

    pub fn with_dex(mut self, dex: impl AsRef<str>) -> Self {
        self.dex = normalized(dex.as_ref(), str::to_lowercase);
        self
    }
}

#[derive(Deserialize)]
struct RawChannelDescriptor {
    kind: String,
    #[serde(default)]
    account: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    dex: Option<String>,
}

impl From<RawChannelDescriptor> for ChannelDescriptor {
    fn from(raw: RawChannelDescriptor) -> Self {
        let mut descriptor = ChannelDescriptor::new(raw.kind);
        if let Some(account) = raw.account {
            descriptor = descriptor.with_account(account);
        }
        if let Some(symbol) = raw.symbol {
            descriptor = descriptor.with_symbol(symbol);
        }
        if let Some(dex) = raw.dex {
            descriptor = descriptor.with_dex(dex);
        }
        descriptor
    }
}

fn normalized(raw: &str, case: fn(&str) -> String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(case(trimmed))
    }
}

impl fmt::Display for ChannelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        for part in [&self.dex, &self.account, &self.symbol].into_iter().flatten() {
            write!(f, ":{part}")?;
        }
        Ok(())
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl ConnectionState {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

/// Perp vs spot price tables
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketKind {
    Perp,
    Spot,
}

/// Order side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn multiplier(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
    Flat,
}

/// Last observed price for one symbol
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriceEntry {
    pub value: Decimal,
    pub observed_at: Instant,
}

/// One side of an order book update, as `(price, size)` pairs.
///
/// A non-positive size removes the level.
pub type BookLevels = Vec<(Decimal, Decimal)>;

/// Read-time view of a cached order book
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderBookView {
    /// Price descending
    pub bids: Vec<(f64, f64)>,
    /// Price ascending
    pub asks: Vec<(f64, f64)>,
    pub sequence: Option<u64>,
    /// Milliseconds since the unix epoch
    pub time: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionEntry {
    pub symbol: String,
    /// Sub-venue the position lives on, for venues with several perp dexes
    #[serde(default)]
    pub dex: Option<String>,
    pub side: PositionSide,
    /// Absolute size, never negative
    pub size: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl PositionEntry {
    /// Builds an entry from a signed size, deriving side and absolute size.
    pub fn from_signed(symbol: impl Into<String>, signed_size: Decimal) -> Self {
        let side = if signed_size > Decimal::ZERO {
            PositionSide::Long
        } else if signed_size < Decimal::ZERO {
            PositionSide::Short
        } else {
            PositionSide::Flat
        };
        Self {
            symbol: symbol.into(),
            dex: None,
            side,
            size: signed_size.abs(),
            entry_price: None,
            unrealized_pnl: None,
            raw: serde_json::Value::Null,
        }
    }

    pub fn with_dex(mut self, dex: impl AsRef<str>) -> Self {
        self.dex = normalized(dex.as_ref(), str::to_lowercase);
        self
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero() || self.side == PositionSide::Flat
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenOrderEntry {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub status: String,
}

impl OpenOrderEntry {
    /// Open, pending, partially filled and status-less orders stay on the book.
    pub fn is_open(&self) -> bool {
        matches!(
            self.status.trim().to_lowercase().as_str(),
            "" | "open" | "pending" | "partially_filled"
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub asset: String,
    pub total: Decimal,
    pub available: Option<Decimal>,
}

/// Account-level collateral summary
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Collateral {
    pub total_collateral: Decimal,
    pub available_collateral: Decimal,
    pub portfolio_value: Decimal,
    pub account_value: Decimal,
    pub leverage: Decimal,
    pub margin_usage: Decimal,
    pub buying_power: Decimal,
}

/// Decoded venue message. Adapters translate each inbound frame into zero or
/// more of these once, at the dispatch boundary.
#[derive(Clone, Debug, PartialEq)]
pub enum VenueEvent {
    PriceTick {
        market: MarketKind,
        symbol: String,
        value: Decimal,
    },
    /// Replaces the cached book wholesale
    OrderbookSnapshot {
        symbol: String,
        bids: BookLevels,
        asks: BookLevels,
        sequence: Option<u64>,
    },
    /// Incremental update; the first one for a symbol acts as a snapshot
    OrderbookDelta {
        symbol: String,
        begin_sequence: Option<u64>,
        sequence: Option<u64>,
        bids: BookLevels,
        asks: BookLevels,
    },
    /// A flat position removes the cached entry
    PositionUpdate(PositionEntry),
    /// Replaces every cached position for the account
    PositionsSnapshot(Vec<PositionEntry>),
    BalanceUpdate(BalanceEntry),
    CollateralUpdate(Collateral),
    /// Collateral of one sub-venue (perp dex) of the account
    DexCollateralUpdate {
        dex: String,
        collateral: Collateral,
    },
    OrderUpdate(OpenOrderEntry),
    OpenOrdersSnapshot(Vec<OpenOrderEntry>),
    RequestResponse {
        id: u64,
        result: Result<serde_json::Value, String>,
    },
    Error {
        message: String,
    },
    Heartbeat,
}

impl VenueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PriceTick { .. } => "price_tick",
            Self::OrderbookSnapshot { .. } => "orderbook_snapshot",
            Self::OrderbookDelta { .. } => "orderbook_delta",
            Self::PositionUpdate(_) => "position_update",
            Self::PositionsSnapshot(_) => "positions_snapshot",
            Self::BalanceUpdate(_) => "balance_update",
            Self::CollateralUpdate(_) => "collateral_update",
            Self::DexCollateralUpdate { .. } => "dex_collateral_update",
            Self::OrderUpdate(_) => "order_update",
            Self::OpenOrdersSnapshot(_) => "open_orders_snapshot",
            Self::RequestResponse { .. } => "request_response",
            Self::Error { .. } => "error",
            Self::Heartbeat => "heartbeat",
        }
    }
}

/// Parses a venue number that may arrive as a JSON string or number.
pub fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    use std::str::FromStr;

    match value {
        serde_json::Value::String(s) => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .ok(),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Decimal::from(i))
            } else {
                Decimal::from_str(&n.to_string())
                    .or_else(|_| Decimal::from_scientific(&n.to_string()))
                    .ok()
            }
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::HashSet;

    #[test]
    fn test_descriptor_normalization() {
        let a = ChannelDescriptor::new("l2Book").with_symbol(" btc ").with_account("0xABC");
        let b = ChannelDescriptor::new("l2Book").with_symbol("BTC").with_account("0xabc ");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_empty_fields_are_unpopulated() {
        let a = ChannelDescriptor::new("allMids").with_dex("");
        let b = ChannelDescriptor::new("allMids");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "allMids");
        assert_eq!(
            ChannelDescriptor::new("l2Book").with_dex("XYZ").with_symbol("eth").to_string(),
            "l2Book:xyz:ETH"
        );
    }

    #[test]
    fn test_deserialized_descriptor_is_normalized() {
        let parsed: ChannelDescriptor =
            serde_json::from_str(r#"{"kind":" l2Book ","account":"0xABC","symbol":" btc ","dex":""}"#).unwrap();
        assert_eq!(
            parsed,
            ChannelDescriptor::new("l2Book").with_account("0xabc").with_symbol("BTC")
        );

        let minimal: ChannelDescriptor = serde_json::from_str(r#"{"kind":"allMids"}"#).unwrap();
        assert_eq!(minimal, ChannelDescriptor::new("allMids"));

        let round_trip: ChannelDescriptor = serde_json::from_value(serde_json::to_value(&parsed).unwrap()).unwrap();
        assert_eq!(round_trip, parsed);
    }

    #[test]
    fn test_position_from_signed_size() {
        let short = PositionEntry::from_signed("ETH", dec!(-1.5));
        assert_eq!(short.side, PositionSide::Short);
        assert_eq!(short.size, dec!(1.5));
        assert!(PositionEntry::from_signed("ETH", Decimal::ZERO).is_flat());
        assert_eq!(
            PositionEntry::from_signed("xyz:XYZ100", dec!(1)).with_dex(" XYZ ").dex.as_deref(),
            Some("xyz")
        );
    }

    #[test]
    fn test_open_order_status() {
        let mut order = OpenOrderEntry {
            order_id: "1".into(),
            symbol: "BTC".into(),
            side: Side::Buy,
            price: dec!(100),
            size: dec!(1),
            status: "Partially_Filled".into(),
        };
        assert!(order.is_open());
        order.status = "filled".into();
        assert!(!order.is_open());
    }

    #[test]
    fn test_decimal_from_json() {
        assert_eq!(decimal_from_json(&serde_json::json!("101.25")), Some(dec!(101.25)));
        assert_eq!(decimal_from_json(&serde_json::json!(42)), Some(dec!(42)));
        assert_eq!(decimal_from_json(&serde_json::json!(0.5)), Some(dec!(0.5)));
        assert_eq!(decimal_from_json(&serde_json::json!(null)), None);
        assert_eq!(decimal_from_json(&serde_json::json!("abc")), None);
    }
}
