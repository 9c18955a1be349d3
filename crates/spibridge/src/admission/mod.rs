//! Ticket-ordered admission to the shared backing device.
//!
//! Every operation takes a ticket from a monotonic counter and waits until the
//! serving counter reaches it and the ownership affinity policy allows it.
//! Timeouts and cancellations never give up a place in line: they are recorded
//! while waiting and surfaced once the ticket reaches the head, at which point
//! the ticket is retired instead of granted. The serving counter therefore
//! advances by exactly one per issued ticket, in order, with no gaps.
//!
//! Waiters share one condition variable and every retirement wakes all of them.
//! That is O(waiters) per retirement, which is fine for endpoint counts in the
//! tens to low hundreds.

mod affinity;
mod cancel;

use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use affinity::OwnershipAffinity;
pub use cancel::CancelHandle;

use crate::error::{BridgeError, Result};

/// Arrival-order number for one pending operation. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticket(u64);

impl Ticket {
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(u64);

impl CallerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "caller-{}", self.0)
    }
}

/// Failure recorded while waiting, surfaced once the ticket is at the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeferredFailure {
    Timeout,
    Cancelled,
}

impl DeferredFailure {
    fn into_error(self) -> BridgeError {
        match self {
            Self::Timeout => BridgeError::Timeout,
            Self::Cancelled => BridgeError::Cancelled,
        }
    }
}

#[derive(Debug)]
struct QueueState {
    next_ticket: u64,
    serving: u64,
    waiting: usize,
    affinity: OwnershipAffinity,
}

/// Point-in-time view of the queue counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub next_ticket: u64,
    pub serving: u64,
    pub waiting: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<CallerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_remaining_ms: Option<u64>,
}

impl QueueSnapshot {
    /// Tickets issued but not yet retired.
    pub fn outstanding(&self) -> u64 {
        self.next_ticket - self.serving
    }
}

/// Fair ticket scheduler for one backing device.
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    wake: Condvar,
    timeout: Option<Duration>,
    debug: bool,
}

impl fmt::Debug for AdmissionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("timeout", &self.timeout)
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl AdmissionQueue {
    /// `timeout` of `None` waits forever; a zero `hold` disables affinity.
    pub fn new(timeout: Option<Duration>, hold: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState {
                next_ticket: 0,
                serving: 0,
                waiting: 0,
                affinity: OwnershipAffinity::new(hold),
            }),
            wake: Condvar::new(),
            timeout: timeout.filter(|t| !t.is_zero()),
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // The state is only mutated with plain integer updates, so a poisoned
        // lock still holds consistent counters.
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Admission queue lock poisoned - recovering state");
            poisoned.into_inner()
        })
    }

    /// Take a ticket and block until it is granted.
    ///
    /// On `Ok` the caller owns the ticket and must pass it to [`exit`](Self::exit)
    /// exactly once. On `Err` the ticket has already been retired.
    pub fn enter(&self, caller: CallerId, cancel: Option<&CancellationToken>) -> Result<Ticket> {
        let mut state = self.lock();
        let ticket = Ticket(state.next_ticket);
        state.next_ticket += 1;
        if self.debug {
            tracing::debug!(%ticket, %caller, serving = state.serving, "ticket acquired");
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut failure: Option<DeferredFailure> = None;
        let mut queued = false;

        let outcome = loop {
            let now = Instant::now();

            if failure.is_none() {
                if cancel.is_some_and(CancellationToken::is_cancelled) {
                    failure = Some(DeferredFailure::Cancelled);
                } else if deadline.is_some_and(|d| now >= d) {
                    failure = Some(DeferredFailure::Timeout);
                }
                if let Some(f) = failure
                    && self.debug
                {
                    tracing::debug!(%ticket, %caller, failure = ?f, "failure deferred until head of queue");
                }
            }

            let at_head = state.serving == ticket.0;
            if at_head && self.affinity_allows(&mut state, caller, now) {
                if let Some(f) = failure {
                    self.retire(&mut state, ticket);
                    break Err(f.into_error());
                }
                if state.affinity.is_enabled() {
                    state.affinity.touch(caller, now);
                    if self.debug {
                        tracing::debug!(%ticket, %caller, "ownership touched");
                    }
                }
                if self.debug {
                    tracing::debug!(%ticket, %caller, "ticket granted");
                }
                break Ok(ticket);
            }

            // Sleep until a retirement, an interrupt, the deadline (while it can
            // still fire), or the expiry of an ownership grant blocking the head.
            let mut wake_at = if failure.is_none() { deadline } else { None };
            if at_head && let Some(expiry) = state.affinity.blocked_until(caller, now) {
                wake_at = Some(wake_at.map_or(expiry, |w| w.min(expiry)));
            }

            if !queued {
                state.waiting += 1;
                queued = true;
            }
            state = match wake_at {
                Some(at) => {
                    let (guard, _) = self
                        .wake
                        .wait_timeout(state, at.saturating_duration_since(now))
                        .unwrap_or_else(PoisonError::into_inner);
                    guard
                }
                None => self.wake.wait(state).unwrap_or_else(PoisonError::into_inner),
            };
        };

        if queued {
            state.waiting -= 1;
        }
        outcome
    }

    fn affinity_allows(&self, state: &mut QueueState, caller: CallerId, now: Instant) -> bool {
        let held_by = state.affinity.owner();
        let allowed = state.affinity.allows(caller, now);
        if self.debug
            && let Some(owner) = held_by
            && state.affinity.owner().is_none()
        {
            tracing::debug!(%owner, %caller, "ownership expired");
        }
        allowed
    }

    /// Take a ticket and return a permit that retires it on drop.
    pub fn admit(
        &self,
        caller: CallerId,
        cancel: Option<&CancellationToken>,
    ) -> Result<AdmissionPermit<'_>> {
        let ticket = self.enter(caller, cancel)?;
        Ok(AdmissionPermit {
            queue: self,
            ticket,
            caller,
        })
    }

    /// Retire `ticket`. A no-op unless it is the ticket being served.
    pub fn exit(&self, ticket: Ticket) {
        let mut state = self.lock();
        if !self.retire(&mut state, ticket) {
            tracing::warn!(%ticket, serving = state.serving, "exit for a ticket that is not being served");
        }
    }

    fn retire(&self, state: &mut QueueState, ticket: Ticket) -> bool {
        if state.serving != ticket.0 {
            return false;
        }
        state.serving += 1;
        self.wake.notify_all();
        if self.debug {
            tracing::debug!(%ticket, serving = state.serving, "ticket retired");
        }
        true
    }

    /// Clear the ownership grant if `caller` holds it (session close).
    pub fn release_ownership(&self, caller: CallerId) {
        let mut state = self.lock();
        if state.affinity.release(caller) {
            self.wake.notify_all();
            if self.debug {
                tracing::debug!(%caller, "ownership released");
            }
        }
    }

    /// Wake every waiter so it re-checks its cancellation token.
    pub fn interrupt(&self) {
        let _state = self.lock();
        self.wake.notify_all();
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.lock();
        let now = Instant::now();
        QueueSnapshot {
            next_ticket: state.next_ticket,
            serving: state.serving,
            waiting: state.waiting,
            owner: state.affinity.owner(),
            owner_remaining_ms: state
                .affinity
                .remaining(now)
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        }
    }
}

/// A granted ticket. Retires the ticket when dropped, whatever the operation's outcome.
#[must_use = "dropping the permit immediately releases the admission"]
#[derive(Debug)]
pub struct AdmissionPermit<'a> {
    queue: &'a AdmissionQueue,
    ticket: Ticket,
    caller: CallerId,
}

impl AdmissionPermit<'_> {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn caller(&self) -> CallerId {
        self.caller
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        self.queue.exit(self.ticket);
    }
}
