//! Select which peer serves the current fetch session.

use commonware_cryptography::PublicKey;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};

/// Maintains the preferred-replica set for a fetch session and rotates
/// the current source on failure.
///
/// Demotion removes a source from the preferred set for the remainder of
/// the session; as long as one correct peer remains preferred, a single
/// bad source cannot stall progress. Once the set is exhausted the caller
/// restarts the summaries phase with a fresh set.
pub struct Selector<P: PublicKey> {
    preferred: Vec<P>,
    current: Option<P>,
    retransmissions: HashMap<P, u32>,
    last_send: Option<SystemTime>,
}

impl<P: PublicKey> Selector<P> {
    /// Create a selector with an initial preferred set.
    pub fn new(preferred: Vec<P>) -> Self {
        Self {
            preferred,
            current: None,
            retransmissions: HashMap::new(),
            last_send: None,
        }
    }

    /// The current source, if one is selected.
    pub fn current(&self) -> Option<&P> {
        self.current.as_ref()
    }

    /// Number of peers still eligible.
    pub fn len_preferred(&self) -> usize {
        self.preferred.len()
    }

    /// Whether the preferred set is exhausted.
    pub fn is_exhausted(&self) -> bool {
        self.preferred.is_empty() && self.current.is_none()
    }

    /// Select a source, demoting the current one first if `demote_current`
    /// is set. Returns `None` when the preferred set is exhausted.
    pub fn pick<R: Rng>(&mut self, rng: &mut R, demote_current: bool) -> Option<&P> {
        if demote_current {
            if let Some(current) = self.current.take() {
                self.retransmissions.remove(&current);
            }
        }
        if self.current.is_none() {
            let next = self.preferred.choose(rng)?.clone();
            self.preferred.retain(|p| *p != next);
            self.current = Some(next);
            self.last_send = None;
        }
        self.current.as_ref()
    }

    /// Record that a request was (re)sent to the current source at `now`.
    /// Returns the retransmission count for that source.
    pub fn on_send(&mut self, now: SystemTime) -> u32 {
        self.last_send = Some(now);
        let Some(current) = &self.current else {
            return 0;
        };
        let count = self.retransmissions.entry(current.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Record a valid reply from `peer`, resetting its retransmission
    /// count and the send clock.
    ///
    /// Replies from peers other than the current source are ignored.
    pub fn on_good_reply(&mut self, peer: &P, now: SystemTime) {
        if self.current.as_ref() != Some(peer) {
            return;
        }
        self.retransmissions.insert(peer.clone(), 0);
        self.last_send = Some(now);
    }

    /// Whether the current source has gone `timeout` without a valid
    /// reply since the last send.
    pub fn has_timed_out(&self, now: SystemTime, timeout: Duration) -> bool {
        let Some(last_send) = self.last_send else {
            return false;
        };
        self.current.is_some()
            && now
                .duration_since(last_send)
                .map(|elapsed| elapsed >= timeout)
                .unwrap_or(false)
    }
}
