//! Ownership affinity: a short window after each grant during which only the
//! most recently admitted caller may be granted again.
//!
//! The window delays (never skips) a head-of-queue ticket that belongs to a
//! different caller, even while the backing device is idle. That costs strict
//! wait-time fairness in exchange for letting one caller finish a multi-step
//! exchange without another caller's transfer landing in between.

use std::time::{Duration, Instant};

use super::CallerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OwnershipGrant {
    owner: CallerId,
    expires_at: Instant,
}

/// Time-bounded preference for the most recently granted caller.
///
/// Not synchronized on its own; the admission queue keeps it under its state lock.
#[derive(Debug)]
pub struct OwnershipAffinity {
    hold: Duration,
    grant: Option<OwnershipGrant>,
}

impl OwnershipAffinity {
    pub fn new(hold: Duration) -> Self {
        Self { hold, grant: None }
    }

    pub fn is_enabled(&self) -> bool {
        !self.hold.is_zero()
    }

    pub fn hold(&self) -> Duration {
        self.hold
    }

    /// Record a grant to `caller`. No-op when affinity is disabled.
    pub fn touch(&mut self, caller: CallerId, now: Instant) {
        if !self.is_enabled() {
            self.grant = None;
            return;
        }
        self.grant = Some(OwnershipGrant {
            owner: caller,
            expires_at: now + self.hold,
        });
    }

    /// Whether `caller` may be granted now. Clears an expired grant.
    pub fn allows(&mut self, caller: CallerId, now: Instant) -> bool {
        match self.grant {
            None => true,
            Some(grant) if grant.owner == caller => true,
            Some(grant) if now >= grant.expires_at => {
                self.grant = None;
                true
            }
            Some(_) => false,
        }
    }

    /// Drop the grant if `caller` holds it. Returns true if a grant was cleared.
    pub fn release(&mut self, caller: CallerId) -> bool {
        if self.grant.is_some_and(|g| g.owner == caller) {
            self.grant = None;
            return true;
        }
        false
    }

    /// Instant at which the current grant stops blocking `caller`, if it does.
    pub fn blocked_until(&self, caller: CallerId, now: Instant) -> Option<Instant> {
        self.grant
            .filter(|g| g.owner != caller && now < g.expires_at)
            .map(|g| g.expires_at)
    }

    pub fn owner(&self) -> Option<CallerId> {
        self.grant.map(|g| g.owner)
    }

    /// Remaining window of the current grant, zero if expired.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.grant
            .map(|g| g.expires_at.saturating_duration_since(now))
    }
}
