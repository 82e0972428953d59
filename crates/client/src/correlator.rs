//! Correlation of in-flight requests with the responses the receive loop reads.
//!
//! Each outstanding request owns one entry keyed by its `guid`. The receive
//! loop hands responses over with a non-blocking `oneshot` send; the waiting
//! caller enforces its own deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};
use verdict_core::VerdictError;

use crate::protocol::VerdictResponse;

pub type Reply = Result<VerdictResponse, VerdictError>;

/// Stand-in deadline for timeouts too large to add to the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Absolute deadline `timeout` from now, saturating instead of overflowing.
#[must_use]
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

/// Which responses complete an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The first response for the id.
    Any,
    /// The first response whose verdict is not `Unknown`; `Unknown` ones are dropped.
    Final,
}

struct Entry {
    ticket: u64,
    expect: Expect,
    tx: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<String, Entry>,
    next_ticket: u64,
    closed: bool,
}

#[derive(Default)]
pub struct Correlator {
    inner: Mutex<Inner>,
}

impl Correlator {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in the response for `guid`.
    ///
    /// # Errors
    ///
    /// `InvalidState` if `guid` is already pending, `ConnectionClosed` once
    /// [`Correlator::fail_all`] has run.
    pub fn register(
        self: &Arc<Self>,
        guid: &str,
        deadline: Instant,
        expect: Expect,
    ) -> Result<PendingRequest, VerdictError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(VerdictError::ConnectionClosed);
        }
        if inner.pending.contains_key(guid) {
            return Err(VerdictError::InvalidState("correlation id already in flight"));
        }

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        let (tx, rx) = oneshot::channel();
        inner
            .pending
            .insert(guid.to_string(), Entry { ticket, expect, tx });
        trace!(guid, ?expect, pending = inner.pending.len(), "registered pending request");
        drop(inner);

        Ok(PendingRequest {
            guid: guid.to_string(),
            ticket,
            deadline,
            rx,
            correlator: Arc::clone(self),
        })
    }

    /// Hand `resp` to the request waiting on its `guid`.
    ///
    /// Returns false when nobody was waiting (late, duplicate, or timed out).
    pub fn resolve(&self, resp: VerdictResponse) -> bool {
        let mut inner = self.inner.lock();
        let Some(expect) = inner.pending.get(&resp.guid).map(|e| e.expect) else {
            drop(inner);
            debug!(guid = %resp.guid, "no pending request for response");
            return false;
        };
        if expect == Expect::Final && resp.verdict.is_unknown() {
            drop(inner);
            debug!(guid = %resp.guid, "dropping unknown verdict, waiting for final");
            return false;
        }
        let Some(entry) = inner.pending.remove(&resp.guid) else {
            return false;
        };
        drop(inner);

        // The waiter may have given up between lookup and send.
        entry.tx.send(Ok(resp)).is_ok()
    }

    /// Fail every pending request and refuse new registrations.
    pub fn fail_all(&self, error: impl Fn() -> VerdictError) {
        let drained: Vec<(String, Entry)> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing all pending requests");
        }
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(error()));
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn remove(&self, guid: &str, ticket: u64) {
        let mut inner = self.inner.lock();
        if inner.pending.get(guid).is_some_and(|e| e.ticket == ticket) {
            inner.pending.remove(guid);
        }
    }
}

/// Caller side of one registered request. Dropping it withdraws the registration.
pub struct PendingRequest {
    guid: String,
    ticket: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Reply>,
    correlator: Arc<Correlator>,
}

impl PendingRequest {
    /// Wait for the response or the deadline, whichever comes first.
    pub async fn wait(mut self) -> Reply {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(VerdictError::ConnectionClosed),
            Err(_) => {
                debug!(guid = %self.guid, "request timed out");
                Err(VerdictError::Timeout)
            }
        }
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.correlator.remove(&self.guid, self.ticket);
    }
}
