//! Collect identical votes until a quorum of distinct voters agree.

use std::collections::HashMap;
use std::hash::Hash;

/// Collects votes on a value and declares a winner once `threshold`
/// distinct voters have submitted identical values.
///
/// With `threshold = f + 1`, at least one vote behind a complete
/// certificate comes from a correct replica, so a coalition of up to `f`
/// Byzantine voters cannot certify a fabricated value. Generic so it can
/// be reused outside state transfer.
pub struct Certificate<P: Eq + Hash + Clone, V: Eq + Clone> {
    threshold: usize,
    votes: Vec<(V, Vec<P>)>,
    complete: Option<usize>,
}

impl<P: Eq + Hash + Clone, V: Eq + Clone> Certificate<P, V> {
    /// Create a certificate requiring `threshold` matching votes.
    ///
    /// Panics if `threshold` is zero.
    pub fn new(threshold: usize) -> Self {
        assert!(threshold > 0);
        Self {
            threshold,
            votes: Vec::new(),
            complete: None,
        }
    }

    /// Record a vote. Returns `true` if this vote completed the
    /// certificate.
    ///
    /// A second vote from the same voter is rejected regardless of value,
    /// as is any vote after completion.
    pub fn add(&mut self, voter: P, value: V) -> bool {
        if self.complete.is_some() {
            return false;
        }
        if self
            .votes
            .iter()
            .any(|(_, voters)| voters.contains(&voter))
        {
            return false;
        }
        let entry = match self.votes.iter_mut().position(|(v, _)| *v == value) {
            Some(index) => &mut self.votes[index],
            None => {
                self.votes.push((value, Vec::new()));
                self.votes.last_mut().unwrap()
            }
        };
        entry.1.push(voter);
        if entry.1.len() >= self.threshold {
            self.complete = self
                .votes
                .iter()
                .position(|(_, voters)| voters.len() >= self.threshold);
            return true;
        }
        false
    }

    /// The certified value and its voters, if the certificate completed.
    pub fn completed(&self) -> Option<(&V, &[P])> {
        let index = self.complete?;
        let (value, voters) = &self.votes[index];
        Some((value, voters))
    }

    /// Number of votes recorded so far, across all values.
    pub fn len(&self) -> usize {
        self.votes.iter().map(|(_, voters)| voters.len()).sum()
    }

    /// Whether no votes have been recorded.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }
}

/// Tracks one [Certificate] per key, e.g. per checkpoint number.
pub struct Certificates<K: Ord + Eq + Hash + Copy, P: Eq + Hash + Clone, V: Eq + Clone> {
    threshold: usize,
    inner: HashMap<K, Certificate<P, V>>,
}

impl<K: Ord + Eq + Hash + Copy, P: Eq + Hash + Clone, V: Eq + Clone> Certificates<K, P, V> {
    /// Create an empty collection with the given per-certificate
    /// threshold.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            inner: HashMap::new(),
        }
    }

    /// Record a vote under `key`. Returns `true` if the vote completed
    /// that key's certificate.
    pub fn add(&mut self, key: K, voter: P, value: V) -> bool {
        self.inner
            .entry(key)
            .or_insert_with(|| Certificate::new(self.threshold))
            .add(voter, value)
    }

    /// The highest key with a complete certificate, with its value and
    /// voters.
    pub fn best(&self) -> Option<(K, &V, &[P])> {
        self.inner
            .iter()
            .filter_map(|(key, cert)| cert.completed().map(|(v, voters)| (*key, v, voters)))
            .max_by_key(|(key, _, _)| *key)
    }

    /// Drop all votes.
    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
