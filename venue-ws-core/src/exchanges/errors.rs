//! Exchange error types

use std::time::Duration;
use thiserror::Error;

/// Custom result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors surfaced by connections, the pool and venue adapters
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Rate limited on handshake, retry after {retry_after:?}")]
    RateLimit { retry_after: Option<Duration> },

    #[error("Handshake rejected with status {status}: {message}")]
    Handshake { status: u16, message: String },

    #[error("Gave up connecting after {attempts} attempts")]
    ConnectAttemptsExhausted { attempts: u32 },

    #[error("Parse error: {0}")]
    Parse(String),

    /// The venue answered a request with an explicit error payload.
    #[error("Request rejected: {message}")]
    Request { message: String },

    /// No response arrived in time. The request may still have been executed
    /// by the venue, so this is an unknown outcome rather than a failure.
    #[error("Request {id} timed out after {waited:?}, outcome unknown")]
    RequestTimeout { id: u64, waited: Duration },

    #[error("Connection closed")]
    Closed,

    #[error("Unsupported operation: {operation}")]
    Unsupported { operation: String },

    #[error("Invalid config: {details}")]
    InvalidConfig { details: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Recoverable,
    Fatal,
    RateLimit,
}

impl ExchangeError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::Parse(_) => ErrorKind::Recoverable,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Handshake { .. }
            | Self::ConnectAttemptsExhausted { .. }
            | Self::Closed
            | Self::Unsupported { .. }
            | Self::InvalidConfig { .. } => ErrorKind::Fatal,
            // Not retried automatically: the caller owns retry policy for requests
            Self::Request { .. } | Self::RequestTimeout { .. } | Self::Internal { .. } => {
                ErrorKind::Fatal
            }
        }
    }

    pub fn should_retry(&self) -> bool {
        matches!(self.kind(), ErrorKind::Recoverable | ErrorKind::RateLimit)
    }

    /// True for errors that leave the request outcome undetermined.
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<anyhow::Error> for ExchangeError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<url::ParseError> for ExchangeError {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidConfig {
            details: format!("invalid endpoint url: {err}"),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ExchangeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;

        match err {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                if status == 429 {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    Self::RateLimit { retry_after }
                } else {
                    let message = response
                        .body()
                        .as_ref()
                        .map(|body| String::from_utf8_lossy(body).into_owned())
                        .unwrap_or_default();
                    Self::Handshake { status, message }
                }
            }
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::connection("websocket closed")
            }
            other => Self::connection(other.to_string()),
        }
    }
}

/// Parses a `Retry-After` header given in (possibly fractional) seconds.
pub(crate) fn parse_retry_after(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
