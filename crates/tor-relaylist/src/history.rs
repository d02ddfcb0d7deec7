//! Bounded timestamp histories.
//!
//! The scanner remembers, for the network and for every relay, when
//! certain events happened: a consensus was seen, a relay was selected
//! for measurement, a measurement was attempted.  These histories only
//! matter for a limited period, and only up to a certain number of
//! entries, so each is kept in a [`TimestampSeq`] that evicts its oldest
//! entries as new ones arrive.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A bounded, time-ordered sequence of timestamps.
///
/// Entries older than `period` (relative to the newest update) and
/// entries beyond `max_len` are discarded, oldest first.
#[derive(Debug, Clone)]
pub struct TimestampSeq {
    /// Timestamps, oldest first.
    items: VecDeque<SystemTime>,
    /// How many timestamps we keep at most.
    max_len: usize,
    /// How far back we keep timestamps.
    period: Duration,
}

impl TimestampSeq {
    /// Make a new empty sequence.
    pub fn new(max_len: usize, period: Duration) -> Self {
        TimestampSeq {
            items: VecDeque::new(),
            max_len,
            period,
        }
    }

    /// Record an event that happened now.
    pub fn update(&mut self) {
        self.update_at(SystemTime::now());
    }

    /// Record an event that happened at `when`.
    ///
    /// Out-of-order timestamps are placed where they belong.
    pub fn update_at(&mut self, when: SystemTime) {
        let pos = self.items.iter().rposition(|t| *t <= when).map_or(0, |p| p + 1);
        self.items.insert(pos, when);
        self.evict(self.newest_or(when));
    }

    /// Return the newest timestamp, or `dflt` if there is none.
    fn newest_or(&self, dflt: SystemTime) -> SystemTime {
        self.items.back().copied().unwrap_or(dflt)
    }

    /// Remove the entries that are too old or too many.
    fn evict(&mut self, now: SystemTime) {
        if let Some(cutoff) = now.checked_sub(self.period) {
            while matches!(self.items.front(), Some(t) if *t < cutoff) {
                self.items.pop_front();
            }
        }
        while self.items.len() > self.max_len {
            self.items.pop_front();
        }
    }

    /// Return the number of timestamps in this sequence.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Return true if no timestamps have been recorded.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Return the newest timestamp, if any.
    pub fn last(&self) -> Option<SystemTime> {
        self.items.back().copied()
    }

    /// Return an iterator over the timestamps, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &SystemTime> + '_ {
        self.items.iter()
    }

    /// Return these timestamps as whole seconds since the epoch.
    pub fn to_unix_secs(&self) -> Vec<u64> {
        self.items
            .iter()
            .filter_map(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .collect()
    }

    /// Add every timestamp in `secs` (seconds since the epoch).
    pub fn extend_unix_secs(&mut self, secs: &[u64]) {
        for s in secs {
            self.update_at(UNIX_EPOCH + Duration::from_secs(*s));
        }
    }
}

/// Limits for the timestamp histories kept by a relay list.
#[derive(Debug, Clone, Copy)]
pub struct HistoryLimits {
    /// How long we remember any event.
    pub period: Duration,
    /// How many consensus appearances we remember.
    pub max_consensus_count: usize,
    /// How many priority-list selections we remember per relay.
    pub max_priority_list_count: usize,
    /// How many measurement attempts we remember for the whole network.
    pub max_priority_relay_count: usize,
}

impl Default for HistoryLimits {
    fn default() -> Self {
        HistoryLimits {
            period: Duration::from_secs(5 * 24 * 60 * 60),
            max_consensus_count: 120,
            max_priority_list_count: 120,
            max_priority_relay_count: 48000,
        }
    }
}

/// The measurement history of a single relay.
///
/// This object is shared between successive snapshots of the relay
/// list, so that the history survives a refresh.  Each sequence has its
/// own short-lived lock; none is ever held across an await point.
#[derive(Debug)]
pub struct RelayHistory {
    /// When this relay was listed in a consensus.
    in_consensus: Mutex<TimestampSeq>,
    /// When this relay was selected for measurement.
    priority: Mutex<TimestampSeq>,
    /// When a measurement of this relay was attempted.
    attempts: Mutex<TimestampSeq>,
}

/// Run `f` on the sequence behind `m`, tolerating a poisoned lock.
fn with_seq<T>(m: &Mutex<TimestampSeq>, f: impl FnOnce(&mut TimestampSeq) -> T) -> T {
    let mut guard = match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut guard)
}

impl RelayHistory {
    /// Make a new empty history.
    pub fn new(limits: &HistoryLimits) -> Self {
        let seq = |n| Mutex::new(TimestampSeq::new(n, limits.period));
        RelayHistory {
            in_consensus: seq(limits.max_consensus_count),
            priority: seq(limits.max_priority_list_count),
            attempts: seq(limits.max_priority_list_count),
        }
    }

    /// Note that the relay was listed in a consensus valid after `when`.
    pub fn note_in_consensus(&self, when: SystemTime) {
        with_seq(&self.in_consensus, |s| s.update_at(when));
    }

    /// Note that the relay was selected for measurement now.
    pub fn note_priority(&self) {
        with_seq(&self.priority, TimestampSeq::update);
    }

    /// Note that a measurement of the relay was attempted now.
    pub fn note_measurement_attempt(&self) {
        self.note_measurement_attempt_at(SystemTime::now());
    }

    /// Note that a measurement of the relay was attempted at `when`.
    pub fn note_measurement_attempt_at(&self, when: SystemTime) {
        with_seq(&self.attempts, |s| s.update_at(when));
    }

    /// Return how many recent consensuses listed the relay.
    pub fn consensus_count(&self) -> usize {
        with_seq(&self.in_consensus, |s| s.len())
    }

    /// Return how many times the relay was recently selected.
    pub fn priority_count(&self) -> usize {
        with_seq(&self.priority, |s| s.len())
    }

    /// Return how many measurements of the relay were recently attempted.
    pub fn attempt_count(&self) -> usize {
        with_seq(&self.attempts, |s| s.len())
    }

    /// Return when a measurement was last attempted, if ever.
    pub fn last_attempt(&self) -> Option<SystemTime> {
        with_seq(&self.attempts, |s| s.last())
    }

    /// Return a serializable copy of this history.
    pub fn save(&self) -> SavedRelayHistory {
        SavedRelayHistory {
            in_consensus: with_seq(&self.in_consensus, |s| s.to_unix_secs()),
            priority: with_seq(&self.priority, |s| s.to_unix_secs()),
            attempts: with_seq(&self.attempts, |s| s.to_unix_secs()),
        }
    }

    /// Make a history from a saved copy, applying `limits`.
    pub fn restore(saved: &SavedRelayHistory, limits: &HistoryLimits) -> Self {
        let h = RelayHistory::new(limits);
        with_seq(&h.in_consensus, |s| s.extend_unix_secs(&saved.in_consensus));
        with_seq(&h.priority, |s| s.extend_unix_secs(&saved.priority));
        with_seq(&h.attempts, |s| s.extend_unix_secs(&saved.attempts));
        h
    }
}

/// A persisted copy of one relay's history, as seconds since the epoch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SavedRelayHistory {
    /// When the relay was listed in a consensus.
    pub in_consensus: Vec<u64>,
    /// When the relay was selected for measurement.
    pub priority: Vec<u64>,
    /// When a measurement of the relay was attempted.
    pub attempts: Vec<u64>,
}

/// A persisted copy of all the histories kept by a relay list.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SavedHistory {
    /// Valid-after times of the recent consensuses.
    pub recent_consensus: Vec<u64>,
    /// When measurements were attempted, network-wide.
    pub recent_measurement_attempt: Vec<u64>,
    /// Per-relay histories, keyed by hex fingerprint.
    pub relays: std::collections::BTreeMap<String, SavedRelayHistory>,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn evict_by_count() {
        let mut s = TimestampSeq::new(3, Duration::from_secs(1000));
        for i in 0..5 {
            s.update_at(at(100 + i));
        }
        assert_eq!(s.len(), 3);
        assert_eq!(s.to_unix_secs(), vec![102, 103, 104]);
        assert_eq!(s.last(), Some(at(104)));
    }

    #[test]
    fn evict_by_age() {
        let mut s = TimestampSeq::new(100, Duration::from_secs(60));
        s.update_at(at(1000));
        s.update_at(at(1030));
        assert_eq!(s.len(), 2);
        s.update_at(at(1070));
        assert_eq!(s.to_unix_secs(), vec![1030, 1070]);
        s.update_at(at(2000));
        assert_eq!(s.to_unix_secs(), vec![2000]);
    }

    #[test]
    fn out_of_order() {
        let mut s = TimestampSeq::new(10, Duration::from_secs(1000));
        s.update_at(at(500));
        s.update_at(at(300));
        s.update_at(at(400));
        assert_eq!(s.to_unix_secs(), vec![300, 400, 500]);
        assert_eq!(s.last(), Some(at(500)));
    }

    #[test]
    fn empty() {
        let s = TimestampSeq::new(10, Duration::from_secs(1000));
        assert!(s.is_empty());
        assert_eq!(s.last(), None);
    }

    #[test]
    fn relay_history_roundtrip() {
        let limits = HistoryLimits::default();
        let h = RelayHistory::new(&limits);
        let now = SystemTime::now();
        h.note_in_consensus(now);
        h.note_measurement_attempt_at(now);
        h.note_measurement_attempt_at(now + Duration::from_secs(5));
        h.note_priority();

        let saved = h.save();
        assert_eq!(saved.in_consensus.len(), 1);
        assert_eq!(saved.attempts.len(), 2);

        let h2 = RelayHistory::restore(&saved, &limits);
        assert_eq!(h2.consensus_count(), 1);
        assert_eq!(h2.attempt_count(), 2);
        assert_eq!(h2.priority_count(), 1);
        assert_eq!(h2.save(), saved);
    }
}
