//! Duplex socket abstraction
//!
//! A [`Connector`] opens one socket and hands back its two halves. The
//! connection driver owns both halves, so the sink only ever has one writer.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::errors::{ExchangeError, ExchangeResult};

/// One websocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> ExchangeResult<()>;
    async fn close(&mut self) -> ExchangeResult<()>;
}

#[async_trait]
pub trait FrameStream: Send {
    /// `None` once the peer has gone away
    async fn next_frame(&mut self) -> Option<ExchangeResult<Frame>>;
}

/// Both halves of an open socket
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Performs the handshake. A 429 rejection surfaces as
    /// [`ExchangeError::RateLimit`], any other rejection as
    /// [`ExchangeError::Handshake`].
    async fn connect(&self, url: &str) -> ExchangeResult<Transport>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connector backed by `tokio-tungstenite`
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> ExchangeResult<Transport> {
        let url = Url::parse(url)?;
        let (ws, response) = connect_async(url).await?;
        debug!("Handshake completed with status {}", response.status());

        let (sink, stream) = ws.split();
        Ok(Transport {
            sink: Box::new(TungsteniteSink(sink)),
            stream: Box::new(TungsteniteStream(stream)),
        })
    }
}

struct TungsteniteSink(SplitSink<WsStream, Message>);

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send(&mut self, frame: Frame) -> ExchangeResult<()> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close => Message::Close(None),
        };
        self.0.send(message).await.map_err(ExchangeError::from)
    }

    async fn close(&mut self) -> ExchangeResult<()> {
        self.0.close().await.map_err(ExchangeError::from)
    }
}

struct TungsteniteStream(SplitStream<WsStream>);

#[async_trait]
impl FrameStream for TungsteniteStream {
    async fn next_frame(&mut self) -> Option<ExchangeResult<Frame>> {
        let message = match self.0.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(e.into())),
        };
        Some(Ok(match message {
            Message::Text(text) => Frame::Text(text),
            Message::Binary(data) => Frame::Binary(data),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(_) => Frame::Close,
            Message::Frame(raw) => Frame::Binary(raw.into_data()),
        }))
    }
}

/// Channel-backed connector for driving connections in tests
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    /// Server side of one accepted mock socket
    pub(crate) struct MockSession {
        pub outbound: mpsc::UnboundedReceiver<Frame>,
        pub inbound: mpsc::UnboundedSender<ExchangeResult<Frame>>,
        pub fail_sends: Arc<AtomicBool>,
        pub closed: Arc<AtomicBool>,
    }

    impl MockSession {
        pub fn push_text(&self, text: impl Into<String>) {
            let _ = self.inbound.send(Ok(Frame::Text(text.into())));
        }

        /// Text frames written by the client so far
        pub fn drain_text(&mut self) -> Vec<String> {
            let mut frames = Vec::new();
            while let Ok(frame) = self.outbound.try_recv() {
                if let Frame::Text(text) = frame {
                    frames.push(text);
                }
            }
            frames
        }

        /// Waits for the next text frame written by the client
        pub async fn next_text(&mut self) -> Option<String> {
            while let Some(frame) = self.outbound.recv().await {
                if let Frame::Text(text) = frame {
                    return Some(text);
                }
            }
            None
        }
    }

    pub(crate) struct MockConnector {
        sessions: mpsc::UnboundedSender<MockSession>,
        failures: Mutex<VecDeque<ExchangeError>>,
        connects: AtomicUsize,
    }

    pub(crate) struct MockServer {
        pub sessions: mpsc::UnboundedReceiver<MockSession>,
    }

    impl MockServer {
        pub async fn accept(&mut self) -> MockSession {
            self.sessions.recv().await.expect("connector dropped")
        }
    }

    impl MockConnector {
        pub fn new() -> (Arc<Self>, MockServer) {
            let (tx, rx) = mpsc::unbounded_channel();
            let connector = Arc::new(Self {
                sessions: tx,
                failures: Mutex::new(VecDeque::new()),
                connects: AtomicUsize::new(0),
            });
            (connector, MockServer { sessions: rx })
        }

        /// Queues handshake failures returned by the next connect attempts
        pub fn fail_next(&self, error: ExchangeError) {
            self.failures.lock().push_back(error);
        }

        pub fn connect_count(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Connector for MockConnector {
        async fn connect(&self, _url: &str) -> ExchangeResult<Transport> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(error) = self.failures.lock().pop_front() {
                return Err(error);
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let fail_sends = Arc::new(AtomicBool::new(false));
            let closed = Arc::new(AtomicBool::new(false));

            let _ = self.sessions.send(MockSession {
                outbound: out_rx,
                inbound: in_tx,
                fail_sends: fail_sends.clone(),
                closed: closed.clone(),
            });

            Ok(Transport {
                sink: Box::new(MockSink {
                    tx: out_tx,
                    fail_sends,
                    closed,
                }),
                stream: Box::new(MockStream { rx: in_rx }),
            })
        }
    }

    struct MockSink {
        tx: mpsc::UnboundedSender<Frame>,
        fail_sends: Arc<AtomicBool>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameSink for MockSink {
        async fn send(&mut self, frame: Frame) -> ExchangeResult<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(ExchangeError::connection("mock send failure"));
            }
            self.tx
                .send(frame)
                .map_err(|_| ExchangeError::connection("mock peer gone"))
        }

        async fn close(&mut self) -> ExchangeResult<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockStream {
        rx: mpsc::UnboundedReceiver<ExchangeResult<Frame>>,
    }

    #[async_trait]
    impl FrameStream for MockStream {
        async fn next_frame(&mut self) -> Option<ExchangeResult<Frame>> {
            self.rx.recv().await
        }
    }
}
