//! Decide which relays to measure next.

use std::time::SystemTime;

use tor_relaylist::{Relay, RelaySet};
use tracing::debug;

use crate::PrioritizerConfig;

/// Something that orders relays for measurement.
pub trait PrioritySource: Send + Sync {
    /// Return the relays to measure in the next round, most urgent first.
    fn best_priority(&self, relays: &RelaySet) -> Vec<Relay>;
}

/// The default [`PrioritySource`].
///
/// Relays never attempted come first, then relays whose last attempt is
/// oldest.  Among those, relays with fewer recent attempts come first.
/// Each round measures a fraction of the network, but never fewer than
/// a minimum number of relays.
#[derive(Debug, Clone, Default)]
pub struct RelayPrioritizer {
    /// How many relays to pick.
    cfg: PrioritizerConfig,
}

impl RelayPrioritizer {
    /// Return a new prioritizer.
    pub fn new(cfg: PrioritizerConfig) -> Self {
        RelayPrioritizer { cfg }
    }
}

/// The sort key of a relay: when it was last attempted, then how often.
fn urgency(relay: &Relay) -> (Option<SystemTime>, usize) {
    let h = relay.history();
    (h.last_attempt(), h.attempt_count())
}

impl PrioritySource for RelayPrioritizer {
    fn best_priority(&self, relays: &RelaySet) -> Vec<Relay> {
        let mut ordered: Vec<(Option<SystemTime>, usize, Relay)> = relays
            .relays()
            .iter()
            .map(|r| {
                let (when, count) = urgency(r);
                (when, count, r.clone())
            })
            .collect();
        ordered.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        let n = self.cfg.round_size(ordered.len());
        let chosen: Vec<Relay> = ordered.into_iter().take(n).map(|(_, _, r)| r).collect();
        for r in &chosen {
            r.history().note_priority();
        }
        debug!("Chose {} of {} relays to measure", chosen.len(), relays.len());
        chosen
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::PrioritizerConfigBuilder;
    use std::time::{Duration, UNIX_EPOCH};
    use tor_relaylist::testnet;

    #[test]
    fn oldest_first() {
        let set = testnet::construct_relay_set(testnet::default_relays(), Default::default());
        let t0 = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        // Everybody but relays 4 and 7 was attempted; relay 2 the longest
        // ago.
        for (i, r) in set.relays().iter().enumerate() {
            match i {
                4 | 7 => {}
                2 => r.history().note_measurement_attempt_at(t0),
                _ => r
                    .history()
                    .note_measurement_attempt_at(t0 + Duration::from_secs(100 + i as u64)),
            }
        }
        let cfg = PrioritizerConfigBuilder::default()
            .set_min_relays(3)
            .set_fraction_relays(0.1)
            .build()
            .unwrap();
        let chosen = RelayPrioritizer::new(cfg).best_priority(&set);
        let fps: Vec<_> = chosen.iter().map(|r| *r.fingerprint()).collect();
        assert_eq!(fps.len(), 3);
        assert!(fps[..2].contains(&testnet::fingerprint(4)));
        assert!(fps[..2].contains(&testnet::fingerprint(7)));
        assert_eq!(fps[2], testnet::fingerprint(2));
        assert!(chosen.iter().all(|r| r.history().priority_count() == 1));
        assert_eq!(set.relays()[5].history().priority_count(), 0);
    }

    #[test]
    fn everything_when_small() {
        let set = testnet::construct_relay_set(testnet::default_relays(), Default::default());
        let chosen = RelayPrioritizer::default().best_priority(&set);
        assert_eq!(chosen.len(), 20);

        let empty = tor_relaylist::RelaySet::empty(false);
        assert!(RelayPrioritizer::default().best_priority(&empty).is_empty());
    }
}
