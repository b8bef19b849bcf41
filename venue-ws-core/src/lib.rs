//! Venue WebSocket Core
//!
//! Resilient, venue-agnostic websocket plumbing for trading venues: lazy
//! connect with rate-limit backoff, keepalive, reconnect with subscription
//! replay, a live state cache with readiness signalling, request/response
//! correlation and a shared connection pool.

pub mod config;
pub mod exchanges;

pub use config::{normalize_ws_url, PoolConfig, VenueSettings, WebSocketConfig};
pub use exchanges::{
    AcquireMeta, ChannelDescriptor, Connection, ConnectionPool, ConnectionState, ExchangeError, ExchangeResult,
    HyperliquidAdapter, HyperliquidMeta, LighterAdapter, LiveStateCache, MarketKind, MarketTable, PooledConnection,
    ReadyKind, VenueAdapter, VenueEvent,
};
