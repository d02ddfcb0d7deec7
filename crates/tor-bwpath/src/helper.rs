//! Find and pick a helper relay for a measurement.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use tor_relaylist::{Relay, RelaySet};

use crate::{ExitRequirement, Role};

/// Multipliers of the target's bandwidth that we try, in order, when
/// looking for a helper faster than the target.
pub const BANDWIDTH_MULTIPLIERS: [f64; 5] = [2.0, 1.75, 1.5, 1.25, 1.0];

/// Return every relay that could help measure `target` in `role`,
/// against a destination on `port`.
///
/// When the target exits, the helper is the entry and must not be an
/// exit.  When the target is the entry, the helper must be an exit that
/// can reach `port` and satisfies the network's [`ExitRequirement`].  The
/// target is never its own helper.
pub fn helper_candidates(target: &Relay, relays: &RelaySet, port: u16, role: Role) -> Vec<Relay> {
    let mut candidates = match role {
        Role::Exit => relays.non_exits(),
        Role::Entry => ExitRequirement::from_params(relays.params()).exits(relays, port),
    };
    candidates.retain(|r| r.fingerprint() != target.fingerprint());
    candidates
}

/// Pick a helper from `candidates` for a target with bandwidth
/// `target_bw`.
///
/// For each multiplier in [`BANDWIDTH_MULTIPLIERS`], we look for the
/// candidates with at least `target_bw * multiplier` bandwidth (and never
/// less than `min_bw`), and pick one of them uniformly at random.  If
/// none of the multipliers finds anything, we use the fastest candidate.
///
/// Returns None only if `candidates` is empty.
pub fn pick_helper<R: Rng>(
    rng: &mut R,
    target_bw: u64,
    candidates: &[Relay],
    min_bw: u64,
) -> Option<Relay> {
    for mult in BANDWIDTH_MULTIPLIERS.iter() {
        // Precision loss only matters above 2^53 bytes per second.
        let wanted = ((target_bw as f64) * mult).ceil() as u64;
        let wanted = wanted.max(min_bw);
        let fast_enough: Vec<&Relay> = candidates
            .iter()
            .filter(|r| r.consensus_bandwidth() >= wanted)
            .collect();
        if let Some(r) = fast_enough.choose(rng) {
            debug!(
                "Found {} helpers with at least {} bytes/s ({}x)",
                fast_enough.len(),
                wanted,
                mult
            );
            return Some((*r).clone());
        }
    }
    let fastest = candidates.iter().max_by_key(|r| r.consensus_bandwidth())?;
    debug!(
        "No helper is fast enough; using the fastest, {}",
        fastest.nickname()
    );
    Some(fastest.clone())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use tor_relaylist::{testnet, NetParameters, RelayFlags};

    fn get_rng() -> StdRng {
        // When the tests use the same seed, they're deterministic.
        StdRng::from_seed([11; 32])
    }

    fn set() -> RelaySet {
        testnet::construct_relay_set(testnet::default_relays(), NetParameters::default())
    }

    #[test]
    fn candidates() {
        let set = set();
        let target = set.by_fingerprint(&testnet::fingerprint(4)).unwrap();
        let c = helper_candidates(target, &set, 443, Role::Exit);
        assert_eq!(c.len(), 10);
        assert!(c.iter().all(|r| !r.has_flag(RelayFlags::EXIT)));

        // As entry, the helpers are the good exits other than the target.
        let c = helper_candidates(target, &set, 443, Role::Entry);
        assert_eq!(c.len(), 8);
        assert!(c.iter().all(|r| r.is_exit_not_bad_allowing_port(443, false)));
        assert!(!c.contains(target));

        let target = set.by_fingerprint(&testnet::fingerprint(12)).unwrap();
        assert!(helper_candidates(target, &set, 80, Role::Entry).is_empty());
    }

    #[test]
    fn prefers_twice_as_fast() {
        let set = set();
        let candidates = set.non_exits();
        let mut rng = get_rng();
        for _ in 0..100 {
            let h = pick_helper(&mut rng, 500_000, &candidates, set.non_exit_min_bw()).unwrap();
            assert_eq!(h.consensus_bandwidth(), 1_000_000);
        }
    }

    #[test]
    fn uniform_among_fast_enough() {
        let set = set();
        let candidates = set.non_exits();
        let mut rng = get_rng();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let h = pick_helper(&mut rng, 200_000, &candidates, 0).unwrap();
            // 2x of 200 kB is 400 kB.
            assert!(h.consensus_bandwidth() >= 400_000);
            seen.insert(*h.fingerprint());
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn threshold_floor() {
        let set = set();
        let candidates = set.non_exits();
        let mut rng = get_rng();
        for _ in 0..100 {
            // The threshold is above 2x the target's bandwidth.
            let h = pick_helper(&mut rng, 100_000, &candidates, 900_000).unwrap();
            assert!(h.consensus_bandwidth() >= 900_000);
        }
    }

    #[test]
    fn fallback_to_fastest() {
        let set = set();
        let candidates = set.non_exits();
        let mut rng = get_rng();
        let h = pick_helper(&mut rng, 5_000_000, &candidates, 0).unwrap();
        assert_eq!(h.consensus_bandwidth(), 1_000_000);

        // A single slow candidate is still returned.
        let one = vec![candidates[0].clone()];
        let h = pick_helper(&mut rng, 5_000_000, &one, 0).unwrap();
        assert_eq!(h.fingerprint(), candidates[0].fingerprint());

        assert!(pick_helper(&mut rng, 5_000_000, &[], 0).is_none());
    }

    #[test]
    fn fractional_threshold_rounds_up() {
        // 1.75 * 5143 = 9000.25, so a 9000 byte/s relay is not fast
        // enough; at 1.5x both relays qualify.
        let relays = vec![
            testnet::router(10, RelayFlags::FAST, 9, "reject 1-65535", "1"),
            testnet::router(11, RelayFlags::FAST, 8, "reject 1-65535", "1"),
        ];
        let set = testnet::construct_relay_set(relays, NetParameters::default());
        let candidates = set.relays().to_vec();
        let mut rng = get_rng();
        let picked: HashSet<u64> = (0..50)
            .map(|_| {
                pick_helper(&mut rng, 5143, &candidates, 0)
                    .unwrap()
                    .consensus_bandwidth()
            })
            .collect();
        assert_eq!(picked, [8000, 9000].iter().copied().collect());
    }
}
