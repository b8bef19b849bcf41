//! Venue websocket connectivity
//!
//! [`Connection`] is the resilient socket; [`ConnectionPool`] shares sockets
//! between subscribers; [`VenueAdapter`] implementations translate each
//! venue's protocol into [`VenueEvent`]s that land in the [`LiveStateCache`].

pub mod adapter;
pub mod backoff;
pub mod cache;
pub mod errors;
pub mod hyperliquid;
pub mod lighter;
pub mod orderbook;
pub mod pending;
pub mod pool;
pub mod subscription;
pub mod transport;
pub mod types;
pub mod websocket;

pub use adapter::{ActionSigner, SharedSigner, SharedTokenSource, StaticToken, TokenSource, VenueAdapter};
pub use backoff::{BackoffPolicy, Jitter};
pub use cache::{CacheUpdate, LiveStateCache, ReadyKey, ReadyKind};
pub use errors::{ErrorKind, ExchangeError, ExchangeResult};
pub use hyperliquid::{HyperliquidAdapter, HyperliquidMeta, SpotPair};
pub use lighter::{LighterAdapter, MarketTable};
pub use orderbook::{DeltaOutcome, OrderBook};
pub use pending::{PendingTicket, RequestCorrelator};
pub use pool::{AcquireMeta, ConnectionPool, PoolKey, PooledConnection};
pub use subscription::SubscriptionRegistry;
pub use transport::{Connector, Frame, Transport, TungsteniteConnector};
pub use types::{
    BalanceEntry, ChannelDescriptor, Collateral, ConnectionState, MarketKind, OpenOrderEntry, OrderBookView,
    PositionEntry, PositionSide, PriceEntry, Side, VenueEvent,
};
pub use websocket::{Connection, StreamMetrics};
