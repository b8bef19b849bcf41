//! Venue Monitor
//!
//! Connects to one venue through the shared connection pool, subscribes to
//! the requested order books and periodically logs the live state cache.
//!
//! Configuration comes from the environment:
//! - `VENUE`: `hyperliquid` (default) or `lighter`
//! - `<PREFIX>_WS_URL` and the other `VenueSettings` variables, where the
//!   prefix is `HL` or `LIGHTER`
//! - `MONITOR_SYMBOLS`: comma separated symbols, default `BTC,ETH`
//! - `LIGHTER_MARKETS`: `SYMBOL:id` pairs for Lighter, e.g. `ETH:0,BTC:1`
//! - `LIGHTER_AUTH_TOKEN`: optional token for private Lighter channels

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

use venue_ws_core::exchanges::{StaticToken, VenueAdapter};
use venue_ws_core::{
    AcquireMeta, ConnectionPool, HyperliquidAdapter, HyperliquidMeta, LighterAdapter, MarketTable, PooledConnection, ReadyKind,
    VenueSettings,
};

const REPORT_INTERVAL: Duration = Duration::from_secs(10);
const READY_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let venue = std::env::var("VENUE").unwrap_or_else(|_| "hyperliquid".to_string());
    let symbols = parse_symbols(&std::env::var("MONITOR_SYMBOLS").unwrap_or_else(|_| "BTC,ETH".to_string()));
    info!("🚀 Starting venue monitor for {} ({})", venue, symbols.join(", "));

    let (settings, adapter) = build_venue(&venue)?;
    let pool = ConnectionPool::new(settings.pool.clone(), settings.websocket.clone())?;

    let channels = symbols
        .iter()
        .filter_map(|symbol| adapter.orderbook_channel(symbol))
        .collect::<Vec<_>>();
    let meta = AcquireMeta::new(adapter.clone()).with_channels(channels);

    let lease = pool
        .acquire(&settings.ws_url, settings.account.as_deref(), meta)
        .await
        .with_context(|| format!("failed to connect to {}", settings.ws_url))?;
    info!("✅ Connected to {} (socket {})", settings.ws_url, lease.key());

    for symbol in &symbols {
        if lease.wait_ready(ReadyKind::Orderbook, symbol, READY_TIMEOUT).await {
            info!("📈 {} order book ready", symbol);
        } else {
            warn!("No {} order book within {:?}", symbol, READY_TIMEOUT);
        }
    }

    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => report(&lease, &symbols),
            result = signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("🛑 Shutting down");
    pool.release(&lease).await;
    pool.shutdown_all().await;
    info!("✅ Venue monitor stopped");
    Ok(())
}

fn build_venue(venue: &str) -> Result<(VenueSettings, Arc<dyn VenueAdapter>)> {
    match venue.trim().to_lowercase().as_str() {
        "hyperliquid" | "hl" => {
            let settings = VenueSettings::from_env("HL")?;
            let meta = Arc::new(HyperliquidMeta::new());
            if let Ok(dexes) = std::env::var("HL_DEXES") {
                meta.prime(parse_symbols(&dexes), HashMap::new());
            }
            let mut adapter = HyperliquidAdapter::new().with_meta(meta);
            if let Some(account) = &settings.account {
                adapter = adapter.with_address(account);
            }
            Ok((settings, Arc::new(adapter)))
        }
        "lighter" => {
            let settings = VenueSettings::from_env("LIGHTER")?;
            let markets = parse_market_table(&std::env::var("LIGHTER_MARKETS").unwrap_or_default())?;
            let mut adapter = LighterAdapter::new().with_markets(markets);
            if let Some(account) = &settings.account {
                adapter = adapter.with_account(account);
            }
            if let Ok(token) = std::env::var("LIGHTER_AUTH_TOKEN") {
                adapter = adapter.with_token_source(Arc::new(StaticToken(token)));
            }
            Ok((settings, Arc::new(adapter)))
        }
        other => bail!("unsupported venue {other:?}, expected hyperliquid or lighter"),
    }
}

fn report(lease: &PooledConnection, symbols: &[String]) {
    let cache = lease.cache();
    for symbol in symbols {
        let book = cache.get_orderbook_depth(symbol, 1);
        let summary = serde_json::json!({
            "symbol": symbol,
            "price": cache.get_price(symbol).map(|p| p.to_string()),
            "spot": cache.get_spot_price(symbol).map(|p| p.to_string()),
            "best_bid": book.as_ref().and_then(|b| b.bids.first().map(|l| l.0)),
            "best_ask": book.as_ref().and_then(|b| b.asks.first().map(|l| l.0)),
            "position": cache.get_position(symbol).map(|p| format!("{:?} {}", p.side, p.size)),
        });
        info!("📊 {}", summary);
    }

    let metrics = lease.metrics();
    info!(
        "📡 state={:?} messages={} parse_errors={} reconnects={} gaps={} open_orders={}",
        lease.state(),
        metrics.messages_received,
        metrics.parse_errors,
        metrics.reconnection_count,
        metrics.data_gaps,
        cache.get_open_orders(None).len()
    );
    if let Some(collateral) = cache.get_collateral() {
        info!(
            "💰 account_value={} available={} margin_usage={}",
            collateral.account_value, collateral.available_collateral, collateral.margin_usage
        );
    }
    for dex in cache.dex_keys() {
        if let Some(value) = cache.get_account_value_by_dex(&dex) {
            info!("💰 dex={} account_value={} positions={}", dex, value, cache.get_positions_by_dex(&dex).len());
        }
    }
    let spot_value = cache.get_spot_portfolio_value("USDC");
    if !spot_value.is_zero() {
        info!("💰 spot_value={} USDC", spot_value);
    }
}

fn parse_symbols(raw: &str) -> Vec<String> {
    let mut symbols = Vec::new();
    for symbol in raw.split(',').map(|s| s.trim().to_uppercase()) {
        if !symbol.is_empty() && !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    symbols
}

fn parse_market_table(raw: &str) -> Result<MarketTable> {
    let mut table = MarketTable::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (symbol, id) = pair
            .split_once(':')
            .ok_or_else(|| anyhow!("market entry {pair:?} must look like SYMBOL:id"))?;
        let id: u32 = id
            .trim()
            .parse()
            .with_context(|| format!("market id in {pair:?} is not a number"))?;
        table.insert(symbol, id);
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_parse_symbols() {
        assert_eq!(parse_symbols(" btc, ETH,,btc "), vec!["BTC", "ETH"]);
        assert!(parse_symbols("").is_empty());
    }

    #[test]
    fn test_parse_market_table() {
        let table = assert_ok!(parse_market_table("ETH:0, btc:1"));
        assert_eq!(table.market_id("BTC"), Some(1));
        assert_eq!(table.symbol(0), Some("ETH"));
        assert!(assert_ok!(parse_market_table("")).is_empty());
        assert_err!(parse_market_table("ETH"));
        assert_err!(parse_market_table("ETH:zero"));
    }

    #[test]
    fn test_unknown_venue_is_rejected() {
        assert!(build_venue("binance").is_err());
    }
}
