//! Outstanding request table.
//!
//! Every request id maps to one [`PendingCall`] holding the sending half of a
//! oneshot. Fulfillment moves the sender out of the map, so a call can be
//! completed at most once no matter how many paths race to complete it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::LspError;

/// How long a timed-out id is remembered so its late response is recognized.
pub const LATE_RESPONSE_GRACE: Duration = Duration::from_secs(60);

type Completion = oneshot::Sender<Result<Value, LspError>>;

/// An in-flight request awaiting its response.
#[derive(Debug)]
pub struct PendingCall {
    method: &'static str,
    tx: Completion,
    created: Instant,
}

/// What became of an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fulfillment {
    Delivered,
    /// The call had already timed out; the response was discarded.
    Late,
    /// No call with this id was ever pending, or it was cancelled.
    Unknown,
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<u64, PendingCall>,
    expired: HashMap<u64, Instant>,
    closed: Option<String>,
}

impl Inner {
    fn prune_expired(&mut self, now: Instant) {
        self.expired
            .retain(|_, at| now.saturating_duration_since(*at) < LATE_RESPONSE_GRACE);
    }
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    inner: Mutex<Inner>,
}

impl RequestRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the map half-updated:
        // every critical section is a single insert/remove.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `id` and hand back the handle its caller awaits.
    ///
    /// Fails with `SessionClosed` once the registry has been closed, so no
    /// call registered after process death can hang.
    pub fn register(
        self: &Arc<Self>,
        id: u64,
        method: &'static str,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle, LspError> {
        let (tx, rx) = oneshot::channel();
        let created = Instant::now();
        let deadline = timeout.map(|t| created + t);

        let mut inner = self.lock();
        if let Some(reason) = &inner.closed {
            return Err(LspError::SessionClosed(reason.clone()));
        }
        inner.prune_expired(created);
        let previous = inner.pending.insert(
            id,
            PendingCall {
                method,
                tx,
                created,
            },
        );
        debug_assert!(previous.is_none(), "request id {id} reused while pending");
        drop(inner);

        Ok(ResponseHandle {
            id,
            method,
            timeout,
            deadline,
            rx,
            registry: Arc::clone(self),
            settled: false,
        })
    }

    /// Complete call `id` with `result`.
    pub fn fulfill(&self, id: u64, result: Result<Value, LspError>) -> Fulfillment {
        let mut inner = self.lock();
        if let Some(call) = inner.pending.remove(&id) {
            drop(inner);
            tracing::trace!(
                id,
                method = call.method,
                elapsed_ms = call.created.elapsed().as_millis(),
                "Response delivered"
            );
            // The receiver may have been dropped concurrently; that is a
            // cancellation that lost the race, not an error.
            let _ = call.tx.send(result);
            return Fulfillment::Delivered;
        }
        let now = Instant::now();
        inner.prune_expired(now);
        if inner.expired.remove(&id).is_some() {
            Fulfillment::Late
        } else {
            Fulfillment::Unknown
        }
    }

    /// Fail call `id` with `Cancelled`. Returns whether it was still pending.
    pub fn cancel(&self, id: u64, reason: &str) -> bool {
        let call = self.lock().pending.remove(&id);
        match call {
            Some(call) => {
                tracing::debug!(id, method = call.method, reason, "Request cancelled");
                let _ = call.tx.send(Err(LspError::Cancelled(reason.to_string())));
                true
            }
            None => false,
        }
    }

    /// Close the registry and fail every pending call with `SessionClosed`.
    ///
    /// Later `register` calls fail immediately. Idempotent: the first reason
    /// wins.
    pub fn close_all(&self, reason: &str) {
        let drained: Vec<(u64, PendingCall)> = {
            let mut inner = self.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_string());
            }
            inner.expired.clear();
            inner.pending.drain().collect()
        };
        if !drained.is_empty() {
            tracing::debug!(count = drained.len(), reason, "Failing pending requests");
        }
        for (_, call) in drained {
            let _ = call
                .tx
                .send(Err(LspError::SessionClosed(reason.to_string())));
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Remove a call whose caller gave up waiting and remember its id for
    /// the grace period. Returns `false` if a response got there first.
    fn expire(&self, id: u64) -> bool {
        let mut inner = self.lock();
        if inner.pending.remove(&id).is_some() {
            inner.expired.insert(id, Instant::now());
            true
        } else {
            false
        }
    }
}

/// The caller's side of a pending call.
///
/// Dropping the handle before the call settles cancels it.
#[derive(Debug)]
pub struct ResponseHandle {
    id: u64,
    method: &'static str,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<Result<Value, LspError>>,
    registry: Arc<RequestRegistry>,
    settled: bool,
}

impl ResponseHandle {
    /// Await the response, or the deadline given at registration.
    pub async fn wait(mut self) -> Result<Value, LspError> {
        let outcome = match self.deadline {
            Some(deadline) => {
                tokio::time::timeout_at(deadline.into(), &mut self.rx)
                    .await
                    .ok()
            }
            None => Some((&mut self.rx).await),
        };
        self.settled = true;

        match outcome {
            Some(Ok(result)) => result,
            Some(Err(_)) => Err(LspError::SessionClosed(
                "response channel dropped".to_string(),
            )),
            None => {
                if !self.registry.expire(self.id) {
                    // Fulfilled between the timer firing and the removal.
                    if let Ok(result) = self.rx.try_recv() {
                        return result;
                    }
                }
                let after = self.timeout.unwrap_or_default();
                tracing::debug!(id = self.id, method = self.method, "Request timed out");
                Err(LspError::Timeout {
                    method: self.method,
                    after,
                })
            }
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.cancel(self.id, "caller dropped the request");
        }
    }
}
