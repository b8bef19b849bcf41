//! Request/response correlation over a shared socket

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::debug;

use super::errors::{ExchangeError, ExchangeResult};

/// Outcome delivered to a waiting request
pub type RequestOutcome = ExchangeResult<serde_json::Value>;

struct PendingRequest {
    issued_at: Instant,
    tx: oneshot::Sender<RequestOutcome>,
}

/// Tracks in-flight requests by id.
///
/// Ids increase monotonically and are never reused, so a late response for an
/// expired request can never resolve a newer one.
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: DashMap<u64, PendingRequest>,
}

impl Default for RequestCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
        }
    }

    /// Allocates an id and registers a pending request for it.
    ///
    /// The returned ticket removes the entry when dropped, so a caller that
    /// is cancelled mid-wait cannot leak it.
    pub fn register(self: &Arc<Self>) -> PendingTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                issued_at: Instant::now(),
                tx,
            },
        );
        PendingTicket {
            id,
            rx: Some(rx),
            owner: Arc::clone(self),
        }
    }

    /// Completes the request with `id`. Returns `false` for unknown ids.
    pub fn resolve(&self, id: u64, outcome: RequestOutcome) -> bool {
        match self.pending.remove(&id) {
            Some((_, request)) => {
                debug!(
                    "Resolved request {} after {:?}",
                    id,
                    request.issued_at.elapsed()
                );
                // The waiter may have gone away between removal and send
                let _ = request.tx.send(outcome);
                true
            }
            None => {
                debug!("Dropping response for unknown request {}", id);
                false
            }
        }
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Fails every pending request, e.g. when the socket goes away.
    pub fn fail_all(&self, error: ExchangeError) {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, request)) = self.pending.remove(&id) {
                let _ = request.tx.send(Err(error.clone()));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Handle for one registered request
pub struct PendingTicket {
    id: u64,
    rx: Option<oneshot::Receiver<RequestOutcome>>,
    owner: Arc<RequestCorrelator>,
}

impl PendingTicket {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the response until `deadline`.
    ///
    /// On expiry the entry is removed and a [`ExchangeError::RequestTimeout`]
    /// is returned; the venue may still execute the request.
    pub async fn wait_until(mut self, deadline: tokio::time::Instant) -> RequestOutcome {
        let started = tokio::time::Instant::now();
        let rx = self.rx.take().ok_or_else(|| ExchangeError::Internal {
            message: format!("request {} awaited twice", self.id),
        })?;

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ExchangeError::Closed),
            Err(_) => {
                self.owner.cancel(self.id);
                Err(ExchangeError::RequestTimeout {
                    id: self.id,
                    waited: started.elapsed(),
                })
            }
        }
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        self.owner.cancel(self.id);
    }
}
