//! Resilient venue websocket connection
//!
//! A [`Connection`] owns one physical socket through a driver task. The
//! driver is the socket's only reader and only writer: callers hand it
//! commands over a channel, which keeps frames in call order and makes every
//! send queue behind an in-progress reconnect instead of racing it.
//!
//! When the socket dies (read error, idle timeout, keepalive failures) the
//! driver clears the live state cache, fails in-flight requests, reconnects
//! with backoff and replays the subscription registry in insertion order.

use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::adapter::VenueAdapter;
use super::cache::{CacheUpdate, LiveStateCache, ReadyKind};
use super::errors::{ExchangeError, ExchangeResult};
use super::pending::RequestCorrelator;
use super::subscription::SubscriptionRegistry;
use super::transport::{Connector, Frame, Transport, TungsteniteConnector};
use super::types::{ChannelDescriptor, ConnectionState, VenueEvent};
use crate::config::WebSocketConfig;

/// Stream health metrics
#[derive(Debug, Clone, Default)]
pub struct StreamMetrics {
    pub messages_received: u64,
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub connection_errors: u64,
    pub reconnection_count: u64,
    pub last_message_time: Option<Instant>,
    pub data_gaps: u64,
}

/// Internal commands handled by the driver task
enum Command {
    Send {
        frame: Frame,
        ack: oneshot::Sender<ExchangeResult<()>>,
    },
    Subscribe {
        descriptor: ChannelDescriptor,
        ack: oneshot::Sender<ExchangeResult<()>>,
    },
    Unsubscribe {
        descriptor: ChannelDescriptor,
        ack: oneshot::Sender<ExchangeResult<()>>,
    },
}

struct Runtime {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

/// State shared between the connection handle and its driver task
struct Shared {
    id: String,
    url: String,
    config: WebSocketConfig,
    adapter: Arc<dyn VenueAdapter>,
    connector: Arc<dyn Connector>,
    state: parking_lot::RwLock<ConnectionState>,
    registry: SubscriptionRegistry,
    cache: LiveStateCache,
    correlator: Arc<RequestCorrelator>,
    metrics: parking_lot::Mutex<StreamMetrics>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Moves to `next` unless the connection was closed. Returns `false` if
    /// the connection is closed.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = next;
        true
    }

    async fn write(&self, transport: &mut Transport, frame: Frame) -> ExchangeResult<()> {
        match timeout(self.config.send_timeout, transport.sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::connection(format!(
                "send timed out after {:?}",
                self.config.send_timeout
            ))),
        }
    }

    /// Opens a socket, retrying rate-limit rejections with backoff.
    ///
    /// A handshake timeout also consumes an attempt. Any other failure is
    /// returned immediately.
    async fn open_with_backoff(&self) -> ExchangeResult<Transport> {
        let policy = self.config.rate_limit_backoff();
        let max_attempts = self.config.connect_max_attempts;

        for attempt in 0..max_attempts {
            let last_attempt = attempt + 1 >= max_attempts;
            match timeout(self.config.connect_timeout, self.connector.connect(&self.url)).await {
                Ok(Ok(transport)) => return Ok(transport),
                Ok(Err(ExchangeError::RateLimit { retry_after })) => {
                    if last_attempt {
                        break;
                    }
                    let delay = policy.delay_with_hint(attempt, retry_after);
                    warn!(
                        "[{}:{}] Rate limited on connect (attempt {}/{}), retrying in {:?}",
                        self.adapter.name(),
                        self.id,
                        attempt + 1,
                        max_attempts,
                        delay
                    );
                    sleep(delay).await;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    if last_attempt {
                        break;
                    }
                    warn!(
                        "[{}:{}] Connect timed out after {:?} (attempt {}/{})",
                        self.adapter.name(),
                        self.id,
                        self.config.connect_timeout,
                        attempt + 1,
                        max_attempts
                    );
                    sleep(policy.base_delay(0)).await;
                }
            }
        }

        error!(
            "[{}:{}] Giving up on {} after {} attempts",
            self.adapter.name(),
            self.id,
            self.url,
            max_attempts
        );
        Err(ExchangeError::ConnectAttemptsExhausted {
            attempts: max_attempts,
        })
    }

    /// Sends connect-time frames, then replays the registry in order.
    async fn prime_session(
        &self,
        transport: &mut Transport,
        sent: &mut HashSet<ChannelDescriptor>,
    ) -> ExchangeResult<()> {
        sent.clear();
        for frame in self.adapter.on_connect_frames()? {
            self.write(transport, Frame::Text(frame)).await?;
        }

        for descriptor in self.registry.list_in_order() {
            match self.adapter.build_subscribe_frame(&descriptor) {
                Ok(frame) => {
                    self.write(transport, Frame::Text(frame)).await?;
                    sent.insert(descriptor);
                }
                Err(e) => warn!(
                    "[{}:{}] Cannot build subscribe frame for {}: {}",
                    self.adapter.name(),
                    self.id,
                    descriptor,
                    e
                ),
            }
        }
        Ok(())
    }
}

/// One resilient websocket connection to a venue endpoint
pub struct Connection {
    shared: Arc<Shared>,
    connect_lock: tokio::sync::Mutex<()>,
    runtime: parking_lot::Mutex<Option<Runtime>>,
}

impl Connection {
    pub fn new(url: impl Into<String>, adapter: Arc<dyn VenueAdapter>, config: WebSocketConfig) -> Self {
        Self::with_connector(url, adapter, config, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(
        url: impl Into<String>,
        adapter: Arc<dyn VenueAdapter>,
        config: WebSocketConfig,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: nanoid::nanoid!(8),
                url: url.into(),
                config,
                adapter,
                connector,
                state: parking_lot::RwLock::new(ConnectionState::Disconnected),
                registry: SubscriptionRegistry::new(),
                cache: LiveStateCache::new(),
                correlator: Arc::new(RequestCorrelator::new()),
                metrics: parking_lot::Mutex::new(StreamMetrics::default()),
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            runtime: parking_lot::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn venue(&self) -> &str {
        self.shared.adapter.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn cache(&self) -> &LiveStateCache {
        &self.shared.cache
    }

    pub fn subscriptions(&self) -> Vec<ChannelDescriptor> {
        self.shared.registry.list_in_order()
    }

    pub fn metrics(&self) -> StreamMetrics {
        self.shared.metrics.lock().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.correlator.pending_count()
    }

    pub async fn wait_ready(&self, kind: ReadyKind, key: &str, timeout: Duration) -> bool {
        self.shared.cache.wait_ready(kind, key, timeout).await
    }

    /// Opens the socket and starts the driver. No-op when already running.
    ///
    /// Rate-limit rejections are retried with backoff up to the configured
    /// attempt budget; any other handshake failure is returned as-is.
    pub async fn connect(&self) -> ExchangeResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.runtime.lock().is_some() {
            return Ok(());
        }
        if !self.shared.transition(ConnectionState::Connecting) {
            return Err(ExchangeError::Closed);
        }
        let mut connecting = ConnectingGuard {
            shared: &self.shared,
            armed: true,
        };

        info!(
            "[{}:{}] Connecting to {}",
            self.venue(),
            self.id(),
            self.url()
        );
        let mut transport = self.shared.open_with_backoff().await?;
        let mut sent = HashSet::new();
        if let Err(e) = self.shared.prime_session(&mut transport, &mut sent).await {
            let _ = timeout(self.shared.config.close_timeout, transport.sink.close()).await;
            return Err(e);
        }

        if !self.shared.transition(ConnectionState::Connected) {
            let _ = timeout(self.shared.config.close_timeout, transport.sink.close()).await;
            return Err(ExchangeError::Closed);
        }
        connecting.armed = false;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let driver = Driver {
            shared: self.shared.clone(),
            commands: commands_rx,
            shutdown: shutdown_rx,
            sent,
        };
        let task = tokio::spawn(driver.run(transport));

        *self.runtime.lock() = Some(Runtime {
            commands: commands_tx,
            shutdown: Some(shutdown_tx),
            task,
        });
        info!("[{}:{}] ✅ Connected", self.venue(), self.id());
        Ok(())
    }

    fn command_sender(&self) -> ExchangeResult<Option<mpsc::UnboundedSender<Command>>> {
        if self.state() == ConnectionState::Closed {
            return Err(ExchangeError::Closed);
        }
        Ok(self.runtime.lock().as_ref().map(|rt| rt.commands.clone()))
    }

    /// Connects lazily and hands a command to the driver.
    async fn submit(
        &self,
        make: impl FnOnce(oneshot::Sender<ExchangeResult<()>>) -> Command,
    ) -> ExchangeResult<()> {
        let commands = match self.command_sender()? {
            Some(commands) => commands,
            None => {
                self.connect().await?;
                self.command_sender()?.ok_or(ExchangeError::Closed)?
            }
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        commands.send(make(ack_tx)).map_err(|_| ExchangeError::Closed)?;
        ack_rx.await.map_err(|_| ExchangeError::Closed)?
    }

    /// Sends one text frame, connecting first if needed.
    pub async fn send(&self, text: impl Into<String>) -> ExchangeResult<()> {
        let frame = Frame::Text(text.into());
        self.submit(|ack| Command::Send { frame, ack }).await
    }

    /// Registers the channel and subscribes to it. Already registered
    /// channels are left alone.
    pub async fn subscribe(&self, descriptor: ChannelDescriptor) -> ExchangeResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(ExchangeError::Closed);
        }
        if !self.shared.registry.add(descriptor.clone()) {
            debug!("[{}:{}] Already subscribed to {}", self.venue(), self.id(), descriptor);
            return Ok(());
        }
        self.submit(|ack| Command::Subscribe { descriptor, ack }).await
    }

    /// Unregisters the channel and unsubscribes from it. Unknown channels are
    /// left alone.
    pub async fn unsubscribe(&self, descriptor: &ChannelDescriptor) -> ExchangeResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(ExchangeError::Closed);
        }
        if !self.shared.registry.remove(descriptor) {
            return Ok(());
        }
        if let Some(symbol) = self.shared.adapter.orderbook_symbol(descriptor) {
            self.shared.cache.drop_orderbook(&symbol);
        }

        // Nothing was sent on a socket that never opened
        match self.command_sender()? {
            Some(commands) => {
                let (ack_tx, ack_rx) = oneshot::channel();
                commands
                    .send(Command::Unsubscribe {
                        descriptor: descriptor.clone(),
                        ack: ack_tx,
                    })
                    .map_err(|_| ExchangeError::Closed)?;
                ack_rx.await.map_err(|_| ExchangeError::Closed)?
            }
            None => Ok(()),
        }
    }

    /// Issues a correlated request and waits for its response.
    ///
    /// A [`ExchangeError::RequestTimeout`] means the outcome is unknown: the
    /// venue may still have executed the request.
    pub async fn post(&self, request_type: &str, payload: Value, timeout: Duration) -> ExchangeResult<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        let ticket = self.shared.correlator.register();
        let frame = self
            .shared
            .adapter
            .build_request_frame(ticket.id(), request_type, &payload)?;

        match tokio::time::timeout_at(deadline, self.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(ExchangeError::RequestTimeout {
                    id: ticket.id(),
                    waited: timeout,
                })
            }
        }
        debug!(
            "[{}:{}] Posted {} request {}",
            self.venue(),
            self.id(),
            request_type,
            ticket.id()
        );
        ticket.wait_until(deadline).await
    }

    /// [`Connection::post`] with the configured default timeout
    pub async fn post_default(&self, request_type: &str, payload: Value) -> ExchangeResult<Value> {
        let timeout = self.shared.config.request_timeout;
        self.post(request_type, payload, timeout).await
    }

    /// Stops the driver and closes the socket. Idempotent.
    pub async fn close(&self) -> ExchangeResult<()> {
        let previous = std::mem::replace(&mut *self.shared.state.write(), ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return Ok(());
        }

        let runtime = self.runtime.lock().take();
        if let Some(mut runtime) = runtime {
            if let Some(shutdown) = runtime.shutdown.take() {
                let _ = shutdown.send(());
            }
            // The driver closes the socket within close_timeout
            let grace = self.shared.config.close_timeout + Duration::from_millis(500);
            if timeout(grace, &mut runtime.task).await.is_err() {
                warn!(
                    "[{}:{}] Driver did not stop within {:?}, aborting",
                    self.venue(),
                    self.id(),
                    grace
                );
                runtime.task.abort();
            }
        }

        self.shared.cache.reset();
        self.shared.correlator.fail_all(ExchangeError::Closed);
        info!("[{}:{}] Closed", self.venue(), self.id());
        Ok(())
    }
}

/// Resets `Connecting` to `Disconnected` if a connect attempt bails out or
/// is cancelled.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state.write();
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Disconnected;
            }
        }
    }
}

enum SessionEnd {
    Shutdown,
    Lost(String),
    Recycle,
}

/// Owns the socket halves for the lifetime of the connection
struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    shutdown: oneshot::Receiver<()>,
    /// Channels subscribed on the current socket
    sent: HashSet<ChannelDescriptor>,
}

impl Driver {
    async fn run(mut self, mut transport: Transport) {
        loop {
            match self.session(&mut transport).await {
                SessionEnd::Shutdown => {
                    let _ = timeout(self.shared.config.close_timeout, transport.sink.close()).await;
                    break;
                }
                SessionEnd::Lost(reason) => {
                    self.shared.metrics.lock().connection_errors += 1;
                    warn!(
                        "[{}:{}] Connection lost: {}",
                        self.shared.adapter.name(),
                        self.shared.id,
                        reason
                    );
                }
                SessionEnd::Recycle => {
                    info!(
                        "[{}:{}] Recycling connection",
                        self.shared.adapter.name(),
                        self.shared.id
                    );
                }
            }

            match self.reconnect(transport).await {
                Some(fresh) => transport = fresh,
                None => break,
            }
        }

        self.shared.correlator.fail_all(ExchangeError::Closed);
        debug!(
            "[{}:{}] Driver stopped",
            self.shared.adapter.name(),
            self.shared.id
        );
    }

    async fn session(&mut self, transport: &mut Transport) -> SessionEnd {
        let config = self.shared.config.clone();
        let mut keepalive = config.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let recycle_at = config
            .force_reconnect_interval
            .map(|d| tokio::time::Instant::now() + d);
        let mut last_recv = tokio::time::Instant::now();
        let mut ping_failures = 0u32;

        loop {
            let idle_deadline = config.recv_idle_timeout.map(|t| last_recv + t);

            tokio::select! {
                biased;

                _ = &mut self.shutdown => return SessionEnd::Shutdown,

                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Err(e) = self.handle_command(transport, command).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => return SessionEnd::Shutdown,
                },

                frame = transport.stream.next_frame() => match frame {
                    Some(Ok(Frame::Close)) => return SessionEnd::Lost("close frame received".into()),
                    Some(Ok(frame)) => {
                        last_recv = tokio::time::Instant::now();
                        ping_failures = 0;
                        if let Err(e) = self.handle_frame(transport, frame).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".into()),
                },

                _ = tick(&mut keepalive) => {
                    let frame = match self.shared.adapter.build_ping_frame() {
                        Some(text) => Frame::Text(text),
                        None => Frame::Ping(Vec::new()),
                    };
                    match self.shared.write(transport, frame).await {
                        Ok(()) => ping_failures = 0,
                        Err(e) => {
                            ping_failures += 1;
                            warn!(
                                "[{}:{}] Ping failed ({}/{}): {}",
                                self.shared.adapter.name(),
                                self.shared.id,
                                ping_failures,
                                config.ping_fail_threshold,
                                e
                            );
                            if ping_failures >= config.ping_fail_threshold {
                                return SessionEnd::Lost(format!("{} consecutive ping failures", ping_failures));
                            }
                        }
                    }
                }

                _ = sleep_until_opt(idle_deadline) => {
                    return SessionEnd::Lost(format!("no traffic for {:?}", config.recv_idle_timeout.unwrap_or_default()));
                }

                _ = sleep_until_opt(recycle_at) => return SessionEnd::Recycle,
            }
        }
    }

    /// Returns an error only when the socket itself failed.
    async fn handle_command(&mut self, transport: &mut Transport, command: Command) -> ExchangeResult<()> {
        match command {
            Command::Send { frame, ack } => {
                let result = self.shared.write(transport, frame).await;
                let _ = ack.send(result.clone());
                result
            }
            Command::Subscribe { descriptor, ack } => {
                // Already sent by the replay that followed this socket's connect
                if self.sent.contains(&descriptor) || !self.shared.registry.contains(&descriptor) {
                    let _ = ack.send(Ok(()));
                    return Ok(());
                }
                let frame = match self.shared.adapter.build_subscribe_frame(&descriptor) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = ack.send(Err(e));
                        return Ok(());
                    }
                };
                debug!(
                    "[{}:{}] Subscribing to {}",
                    self.shared.adapter.name(),
                    self.shared.id,
                    descriptor
                );
                let result = self.shared.write(transport, Frame::Text(frame)).await;
                if result.is_ok() {
                    self.sent.insert(descriptor);
                }
                // The registry entry survives a failed write and is replayed
                let _ = ack.send(Ok(()));
                result
            }
            Command::Unsubscribe { descriptor, ack } => {
                if !self.sent.remove(&descriptor) {
                    let _ = ack.send(Ok(()));
                    return Ok(());
                }
                let frame = match self.shared.adapter.build_unsubscribe_frame(&descriptor) {
                    Ok(frame) => frame,
                    Err(e) => {
                        let _ = ack.send(Err(e));
                        return Ok(());
                    }
                };
                let result = self.shared.write(transport, Frame::Text(frame)).await;
                let _ = ack.send(Ok(()));
                result
            }
        }
    }

    async fn handle_frame(&mut self, transport: &mut Transport, frame: Frame) -> ExchangeResult<()> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!("[{}:{}] Ignoring binary frame", self.shared.adapter.name(), self.shared.id);
                    return Ok(());
                }
            },
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close => return Ok(()),
        };

        {
            let mut metrics = self.shared.metrics.lock();
            metrics.messages_received += 1;
            metrics.last_message_time = Some(Instant::now());
        }

        let events = match self.shared.adapter.decode(&text) {
            Ok(events) => events,
            Err(e) => {
                self.shared.metrics.lock().parse_errors += 1;
                warn!(
                    "[{}:{}] Skipping frame ({}): {}",
                    self.shared.adapter.name(),
                    self.shared.id,
                    e,
                    truncate(&text, 200)
                );
                return Ok(());
            }
        };
        self.shared.metrics.lock().messages_parsed += 1;

        for event in events {
            self.apply_event(transport, event).await?;
        }
        Ok(())
    }

    async fn apply_event(&mut self, transport: &mut Transport, event: VenueEvent) -> ExchangeResult<()> {
        match event {
            VenueEvent::RequestResponse { id, result } => {
                let outcome = result.map_err(|message| ExchangeError::Request { message });
                self.shared.correlator.resolve(id, outcome);
            }
            VenueEvent::Error { message } => {
                if message.contains("Already subscribed") {
                    debug!("[{}:{}] {}", self.shared.adapter.name(), self.shared.id, message);
                } else {
                    error!(
                        "[{}:{}] Venue error: {}",
                        self.shared.adapter.name(),
                        self.shared.id,
                        message
                    );
                }
            }
            VenueEvent::Heartbeat => {}
            event => {
                if let CacheUpdate::Gap { symbol, .. } = self.shared.cache.apply(event) {
                    self.shared.metrics.lock().data_gaps += 1;
                    if self.shared.config.resubscribe_on_gap {
                        self.resubscribe_orderbook(transport, &symbol).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn resubscribe_orderbook(&mut self, transport: &mut Transport, symbol: &str) -> ExchangeResult<()> {
        let Some(descriptor) = self.shared.adapter.orderbook_channel(symbol) else {
            return Ok(());
        };
        if !self.shared.registry.contains(&descriptor) {
            return Ok(());
        }

        info!(
            "[{}:{}] Resubscribing {} after gap",
            self.shared.adapter.name(),
            self.shared.id,
            descriptor
        );
        let unsubscribe = self.shared.adapter.build_unsubscribe_frame(&descriptor)?;
        let subscribe = self.shared.adapter.build_subscribe_frame(&descriptor)?;
        self.shared.write(transport, Frame::Text(unsubscribe)).await?;
        self.shared.write(transport, Frame::Text(subscribe)).await?;
        self.sent.insert(descriptor);
        Ok(())
    }

    /// Replaces a dead socket. Returns `None` once shutdown is requested.
    async fn reconnect(&mut self, mut dead: Transport) -> Option<Transport> {
        if !self.shared.transition(ConnectionState::Reconnecting) {
            return None;
        }
        self.shared.metrics.lock().reconnection_count += 1;

        let _ = timeout(self.shared.config.close_timeout, dead.sink.close()).await;
        drop(dead);

        // Stale state must not outlive the socket that produced it
        self.shared.cache.reset();
        self.shared
            .correlator
            .fail_all(ExchangeError::connection("connection lost before response"));
        self.sent.clear();

        let policy = self.shared.config.reconnect_backoff();
        let mut attempt = 0u32;
        let mut hint: Option<Duration> = None;

        loop {
            let delay = policy.delay_with_hint(attempt, hint.take());
            tokio::select! {
                biased;
                _ = &mut self.shutdown => return None,
                _ = sleep(delay) => {}
            }

            let result = tokio::select! {
                biased;
                _ = &mut self.shutdown => return None,
                result = timeout(self.shared.config.connect_timeout, self.shared.connector.connect(&self.shared.url)) => result,
            };

            match result {
                Ok(Ok(mut transport)) => match self.shared.prime_session(&mut transport, &mut self.sent).await {
                    Ok(()) => {
                        if !self.shared.transition(ConnectionState::Connected) {
                            let _ = timeout(self.shared.config.close_timeout, transport.sink.close()).await;
                            return None;
                        }
                        info!(
                            "[{}:{}] ✅ Reconnected after {} attempt(s), replayed {} subscription(s)",
                            self.shared.adapter.name(),
                            self.shared.id,
                            attempt + 1,
                            self.sent.len()
                        );
                        return Some(transport);
                    }
                    Err(e) => warn!(
                        "[{}:{}] Replay failed on fresh socket: {}",
                        self.shared.adapter.name(),
                        self.shared.id,
                        e
                    ),
                },
                Ok(Err(ExchangeError::RateLimit { retry_after })) => {
                    warn!(
                        "[{}:{}] Rate limited while reconnecting",
                        self.shared.adapter.name(),
                        self.shared.id
                    );
                    hint = retry_after;
                }
                Ok(Err(e)) => warn!(
                    "[{}:{}] Reconnect attempt {} failed: {}",
                    self.shared.adapter.name(),
                    self.shared.id,
                    attempt + 1,
                    e
                ),
                Err(_) => warn!(
                    "[{}:{}] Reconnect attempt {} timed out",
                    self.shared.adapter.name(),
                    self.shared.id,
                    attempt + 1
                ),
            }
            attempt = attempt.saturating_add(1);
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn sleep_until_opt(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut cut: String = text.chars().take(max_chars).collect();
        cut.push('…');
        cut
    }
}
