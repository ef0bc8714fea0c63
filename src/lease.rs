//! Time-bounded leader lease.
//!
//! A leader that renewed its lease within the last `max_lease` window is
//! certain no other leader exists, so it may answer reads locally without a
//! quorum round. The lease owner lives on the peer executor; foreign readers
//! observe it only through the lock-free [`RemoteLease`] handle.
//!
//! `Suspect` is sticky: any event that could have let a concurrent leader
//! establish its own lease (leader transfer, committed prepare-merge) parks
//! the lease in `Suspect` until a proposal under the new term acknowledges
//! leadership again. While suspect, inspection always answers `Suspect`
//! no matter which timestamp is probed.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use std::time::Instant;

/// Monotonic anchor shared by every lease in the process, so bounds can be
/// published through a single atomic integer.
fn monotonic_zero() -> Instant {
    static ZERO: OnceLock<Instant> = OnceLock::new();
    *ZERO.get_or_init(Instant::now)
}

fn instant_to_nanos(t: Instant) -> u64 {
    t.saturating_duration_since(monotonic_zero()).as_nanos() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// The lease bound has not been reached.
    Valid,
    /// Leadership is in doubt; local reads are disabled until a new proposal
    /// confirms the term.
    Suspect,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Valid(Instant),
    Suspect(Instant),
    Expired,
}

/// The lease owned by the peer executor.
#[derive(Debug)]
pub struct Lease {
    bound: Bound,
    max_lease: Duration,
    remote: Option<RemoteLease>,
}

impl Lease {
    pub fn new(max_lease: Duration) -> Lease {
        Lease {
            bound: Bound::Expired,
            max_lease,
            remote: None,
        }
    }

    /// Renews the lease from a quorum-acknowledged send timestamp. Never
    /// shortens an existing bound, and never clears a suspect bound that
    /// reaches further than the renewal would.
    pub fn renew(&mut self, send_ts: Instant) {
        let bound = send_ts + self.max_lease;
        match self.bound {
            Bound::Suspect(b) | Bound::Valid(b) if bound <= b => return,
            _ => {}
        }
        self.bound = Bound::Valid(bound);
        if let Some(remote) = &self.remote {
            remote.renew(bound);
        }
    }

    /// Parks the lease in `Suspect` and immediately hides it from foreign
    /// readers.
    pub fn suspect(&mut self, send_ts: Instant) {
        self.expire_remote_lease();
        self.bound = Bound::Suspect(send_ts + self.max_lease);
    }

    /// Inspects the lease at `ts` (`None` means now).
    pub fn inspect(&self, ts: Option<Instant>) -> LeaseState {
        match self.bound {
            Bound::Suspect(_) => LeaseState::Suspect,
            Bound::Expired => LeaseState::Expired,
            Bound::Valid(bound) => {
                if ts.unwrap_or_else(Instant::now) < bound {
                    LeaseState::Valid
                } else {
                    LeaseState::Expired
                }
            }
        }
    }

    pub fn expire(&mut self) {
        self.expire_remote_lease();
        self.bound = Bound::Expired;
    }

    pub fn expire_remote_lease(&mut self) {
        if let Some(remote) = self.remote.take() {
            remote.expire();
        }
    }

    /// Returns a freshly published [`RemoteLease`] for `term`, or `None` when
    /// one is already live for that term. A remote lease of an older term
    /// must have been expired before the term changed.
    pub fn maybe_new_remote_lease(&mut self, term: u64) -> Option<RemoteLease> {
        if let Some(remote) = &self.remote {
            if remote.term() == term {
                return None;
            }
            unreachable!("the remote lease must be expired before the term changes");
        }
        let expired_time = match self.bound {
            Bound::Valid(t) => instant_to_nanos(t),
            _ => 0,
        };
        let remote = RemoteLease {
            expired_time: Arc::new(AtomicU64::new(expired_time)),
            term,
        };
        self.remote = Some(remote.clone());
        Some(remote)
    }
}

/// Lock-free view of a [`Lease`] for foreign reader threads.
///
/// The owner publishes the bound monotonically through an atomic; an expired
/// handle stays expired forever, a new leadership round publishes a new
/// handle instead.
#[derive(Debug, Clone)]
pub struct RemoteLease {
    expired_time: Arc<AtomicU64>,
    term: u64,
}

impl RemoteLease {
    pub fn inspect(&self, ts: Option<Instant>) -> LeaseState {
        let bound = self.expired_time.load(Ordering::Acquire);
        if bound == 0 {
            return LeaseState::Expired;
        }
        if instant_to_nanos(ts.unwrap_or_else(Instant::now)) < bound {
            LeaseState::Valid
        } else {
            LeaseState::Expired
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    fn renew(&self, bound: Instant) {
        self.expired_time
            .store(instant_to_nanos(bound), Ordering::Release);
    }

    fn expire(&self) {
        self.expired_time.store(0, Ordering::Release);
    }
}
