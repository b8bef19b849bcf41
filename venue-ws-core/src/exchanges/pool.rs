//! Shared connection pool
//!
//! Physical sockets are keyed by `(endpoint, account, socket_index)`. Each
//! socket serves up to `subscribers_per_socket` logical subscribers; the pool
//! opens a new socket index once every existing one for the account is full.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::adapter::VenueAdapter;
use super::errors::{ExchangeError, ExchangeResult};
use super::transport::{Connector, TungsteniteConnector};
use super::types::{ChannelDescriptor, ConnectionState};
use super::websocket::Connection;
use crate::config::{normalize_ws_url, PoolConfig, WebSocketConfig};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub endpoint: String,
    pub account: Option<String>,
    pub socket_index: usize,
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}",
            self.account.as_deref().unwrap_or("public"),
            self.socket_index,
            self.endpoint
        )
    }
}

/// What a new subscriber needs from its socket
pub struct AcquireMeta {
    pub adapter: Arc<dyn VenueAdapter>,
    /// Subscribed in addition to the adapter's baseline channels
    pub channels: Vec<ChannelDescriptor>,
}

impl AcquireMeta {
    pub fn new(adapter: Arc<dyn VenueAdapter>) -> Self {
        Self {
            adapter,
            channels: Vec::new(),
        }
    }

    pub fn with_channels(mut self, channels: impl IntoIterator<Item = ChannelDescriptor>) -> Self {
        self.channels.extend(channels);
        self
    }
}

struct PoolEntry {
    connection: Arc<Connection>,
    ref_count: usize,
}

/// A subscriber's share of a pooled socket.
///
/// Hand it back with [`ConnectionPool::release`]; releasing the same lease
/// twice is a no-op.
pub struct PooledConnection {
    key: PoolKey,
    connection: Arc<Connection>,
    released: AtomicBool,
}

impl PooledConnection {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn socket_index(&self) -> usize {
        self.key.socket_index
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("key", &self.key)
            .field("connection", &self.connection.id())
            .field("released", &self.is_released())
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    websocket: WebSocketConfig,
    connector: Arc<dyn Connector>,
    entries: Mutex<HashMap<PoolKey, PoolEntry>>,
    /// Serializes first connects so a burst of acquires does not trip the
    /// venue's handshake rate limit
    connect_gate: Semaphore,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, websocket: WebSocketConfig) -> ExchangeResult<Self> {
        Self::with_connector(config, websocket, Arc::new(TungsteniteConnector))
    }

    pub fn with_connector(
        config: PoolConfig,
        websocket: WebSocketConfig,
        connector: Arc<dyn Connector>,
    ) -> ExchangeResult<Self> {
        config.validate()?;
        websocket.validate()?;
        Ok(Self {
            config,
            websocket,
            connector,
            entries: Mutex::new(HashMap::new()),
            connect_gate: Semaphore::new(1),
        })
    }

    /// Returns a connected socket with the baseline and requested channels
    /// subscribed, sharing an existing socket when it has spare capacity.
    ///
    /// Dropping the returned future before it completes gives the slot back.
    pub async fn acquire(
        &self,
        endpoint: &str,
        account: Option<&str>,
        meta: AcquireMeta,
    ) -> ExchangeResult<PooledConnection> {
        let endpoint = normalize_ws_url(endpoint)?;
        let account = account
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty());
        let reservation = self.reserve(endpoint, account, &meta.adapter);

        if let Err(e) = self.prepare(&reservation.connection, &meta).await {
            warn!("[pool] Acquire on {} failed: {}", reservation.key, e);
            reservation.cancel().await;
            return Err(e);
        }

        let (key, connection) = reservation.into_parts();
        debug!("[pool] Acquired {} ({})", key, connection.id());
        Ok(PooledConnection {
            key,
            connection,
            released: AtomicBool::new(false),
        })
    }

    /// Claims a slot on the lowest socket index with spare capacity,
    /// creating the entry if needed. Entries whose connection was closed
    /// behind the pool's back are replaced.
    fn reserve(
        &self,
        endpoint: String,
        account: Option<String>,
        adapter: &Arc<dyn VenueAdapter>,
    ) -> Reservation<'_> {
        let capacity = self.config.subscribers_per_socket;
        let mut entries = self.entries.lock();
        let mut socket_index = 0;

        loop {
            let key = PoolKey {
                endpoint: endpoint.clone(),
                account: account.clone(),
                socket_index,
            };
            let closed = entries
                .get(&key)
                .map_or(false, |entry| entry.connection.state() == ConnectionState::Closed);
            if closed {
                warn!("[pool] Evicting closed socket {}", key);
                entries.remove(&key);
            }

            match entries.get_mut(&key) {
                Some(entry) if entry.ref_count < capacity => {
                    entry.ref_count += 1;
                    let connection = entry.connection.clone();
                    return Reservation::new(self, key, connection);
                }
                Some(_) => socket_index += 1,
                None => {
                    let connection = Arc::new(Connection::with_connector(
                        &endpoint,
                        adapter.clone(),
                        self.websocket.clone(),
                        self.connector.clone(),
                    ));
                    info!("[pool] Opening socket {}", key);
                    entries.insert(
                        key.clone(),
                        PoolEntry {
                            connection: connection.clone(),
                            ref_count: 1,
                        },
                    );
                    return Reservation::new(self, key, connection);
                }
            }
        }
    }

    async fn prepare(&self, connection: &Connection, meta: &AcquireMeta) -> ExchangeResult<()> {
        if connection.state() != ConnectionState::Connected {
            let _permit = self
                .connect_gate
                .acquire()
                .await
                .map_err(|_| ExchangeError::Closed)?;
            connection.connect().await?;
        }

        for descriptor in meta.adapter.baseline_channels().into_iter().chain(meta.channels.iter().cloned()) {
            connection.subscribe(descriptor).await?;
        }
        Ok(())
    }

    /// Returns the lease's slot. The socket closes when its last subscriber
    /// leaves.
    pub async fn release(&self, lease: &PooledConnection) {
        if lease.released.swap(true, Ordering::SeqCst) {
            debug!("[pool] Lease on {} already released", lease.key);
            return;
        }
        self.release_slot(&lease.key, &lease.connection).await;
    }

    async fn release_slot(&self, key: &PoolKey, connection: &Arc<Connection>) {
        if let Some(connection) = self.take_slot(key, connection) {
            info!("[pool] Closing idle socket {}", key);
            if let Err(e) = connection.close().await {
                warn!("[pool] Error closing {}: {}", key, e);
            }
        }
    }

    /// Drops one reference and hands back the connection once it is unused.
    fn take_slot(&self, key: &PoolKey, connection: &Arc<Connection>) -> Option<Arc<Connection>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if Arc::ptr_eq(&entry.connection, connection) => {
                entry.ref_count = entry.ref_count.saturating_sub(1);
                if entry.ref_count == 0 {
                    entries.remove(key).map(|entry| entry.connection)
                } else {
                    None
                }
            }
            // The socket was replaced or shut down after this lease was taken
            _ => {
                debug!("[pool] Ignoring stale release for {}", key);
                None
            }
        }
    }

    /// Closes every pooled socket. Outstanding leases become stale.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(PoolKey, PoolEntry)> = self.entries.lock().drain().collect();
        if drained.is_empty() {
            return;
        }

        info!("[pool] Shutting down {} socket(s)", drained.len());
        for (key, entry) in drained {
            if let Err(e) = entry.connection.close().await {
                warn!("[pool] Error closing {}: {}", key, e);
            }
        }
    }

    pub fn socket_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn ref_count(&self, key: &PoolKey) -> Option<usize> {
        self.entries.lock().get(key).map(|entry| entry.ref_count)
    }

    pub fn keys(&self) -> Vec<PoolKey> {
        let mut keys: Vec<PoolKey> = self.entries.lock().keys().cloned().collect();
        keys.sort_by(|a, b| {
            (&a.endpoint, &a.account, a.socket_index).cmp(&(&b.endpoint, &b.account, b.socket_index))
        });
        keys
    }
}

/// A claimed slot whose acquire has not finished yet.
///
/// Dropped without [`Reservation::into_parts`], it returns the slot to the
/// pool and closes the socket if nobody else uses it.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    key: PoolKey,
    connection: Arc<Connection>,
    armed: bool,
}

impl<'a> Reservation<'a> {
    fn new(pool: &'a ConnectionPool, key: PoolKey, connection: Arc<Connection>) -> Self {
        Self {
            pool,
            key,
            connection,
            armed: true,
        }
    }

    fn into_parts(mut self) -> (PoolKey, Arc<Connection>) {
        self.armed = false;
        (self.key.clone(), self.connection.clone())
    }

    async fn cancel(mut self) {
        self.armed = false;
        self.pool.release_slot(&self.key, &self.connection).await;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("[pool] Acquire on {} abandoned, returning slot", self.key);
        let Some(connection) = self.pool.take_slot(&self.key, &self.connection) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let key = self.key.clone();
                handle.spawn(async move {
                    if let Err(e) = connection.close().await {
                        warn!("[pool] Error closing {}: {}", key, e);
                    }
                });
            }
            Err(_) => debug!("[pool] No runtime to close {}", self.key),
        }
    }
}
