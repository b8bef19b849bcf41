//! Venue adapter interface
//!
//! The connection engine is venue agnostic. Everything a venue does
//! differently (frame shapes, keepalive payloads, message schemas) lives
//! behind [`VenueAdapter`].

use serde_json::Value;
use std::sync::Arc;

use super::errors::{ExchangeError, ExchangeResult};
use super::types::{ChannelDescriptor, VenueEvent};

/// Translates between the engine and one venue's websocket protocol
pub trait VenueAdapter: Send + Sync + 'static {
    /// Short venue name used in logs
    fn name(&self) -> &str;

    /// Keepalive payload. `None` relies on transport-level pings.
    fn build_ping_frame(&self) -> Option<String> {
        None
    }

    fn build_subscribe_frame(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String>;

    fn build_unsubscribe_frame(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<String>;

    /// Frame for a correlated request. Venues without request support keep
    /// the default.
    fn build_request_frame(&self, id: u64, request_type: &str, payload: &Value) -> ExchangeResult<String> {
        let _ = (id, payload);
        Err(ExchangeError::Unsupported {
            operation: format!("{} requests on {}", request_type, self.name()),
        })
    }

    /// Decodes one text frame into zero or more typed events.
    fn decode(&self, frame: &str) -> ExchangeResult<Vec<VenueEvent>>;

    /// Channels every new connection subscribes to
    fn baseline_channels(&self) -> Vec<ChannelDescriptor> {
        Vec::new()
    }

    /// Frames sent right after every (re)connect, before subscriptions are
    /// replayed
    fn on_connect_frames(&self) -> ExchangeResult<Vec<String>> {
        Ok(Vec::new())
    }

    /// The orderbook channel carrying `symbol`, used for gap resubscription
    fn orderbook_channel(&self, symbol: &str) -> Option<ChannelDescriptor> {
        let _ = symbol;
        None
    }

    /// Symbol whose cached book a channel feeds, if it is an orderbook channel
    fn orderbook_symbol(&self, descriptor: &ChannelDescriptor) -> Option<String> {
        let _ = descriptor;
        None
    }
}

/// Turns an action into a signed, sendable payload
pub trait ActionSigner: Send + Sync {
    fn sign(&self, action: &Value) -> ExchangeResult<Value>;
}

impl<F> ActionSigner for F
where
    F: Fn(&Value) -> ExchangeResult<Value> + Send + Sync,
{
    fn sign(&self, action: &Value) -> ExchangeResult<Value> {
        self(action)
    }
}

/// Supplies a current bearer token for private channels
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// A fixed token that never refreshes
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

pub type SharedSigner = Arc<dyn ActionSigner>;
pub type SharedTokenSource = Arc<dyn TokenSource>;
