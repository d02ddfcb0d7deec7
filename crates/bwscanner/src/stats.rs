//! Summaries of the relay population, as the scanner would see it.

use std::fmt::{self, Display};

use anyhow::{anyhow, Result};
use rand::Rng;
use tor_bwpath::{choose_role, helper_candidates, plan_path, Role};
use tor_relaylist::{Fingerprint, Relay, RelayFlags, RelaySet};

/// Counts and fractions describing a relay population.
#[derive(Debug, Clone)]
pub(crate) struct RelayStats {
    /// The port we measure against.
    port: u16,
    /// All relays.
    total: usize,
    /// Relays with the Exit flag.
    exits: usize,
    /// Relays with the BadExit flag.
    bad_exits: usize,
    /// Exits, not bad, that can reach `port`.
    usable_exits: usize,
    /// Usable exits that also support congestion control.
    cc_exits: usize,
    /// Relays that support congestion control.
    flowctrl2: usize,
    /// Minimum bandwidth of a helper that exits.
    exit_min_bw: u64,
    /// Minimum bandwidth of a helper that doesn't exit.
    non_exit_min_bw: u64,
    /// Relays with a helper at least twice as fast.
    helpable_2x: usize,
    /// Relays with a helper at least as fast.
    helpable_1x: usize,
    /// Share of the consensus weight held by usable exits.
    usable_exit_weight: f64,
    /// Share of the consensus weight held by congestion-control exits.
    cc_exit_weight: f64,
}

/// Return true if some helper for `target` has at least `mult` times its
/// bandwidth, and at least the minimum for its position.
fn has_helper(target: &Relay, set: &RelaySet, port: u16, mult: f64) -> bool {
    let role = choose_role(target, set, port);
    let min_bw = match role {
        Role::Entry => set.exit_min_bw(),
        Role::Exit => set.non_exit_min_bw(),
    };
    let wanted = ((target.consensus_bandwidth() as f64 * mult) as u64).max(min_bw);
    helper_candidates(target, set, port, role)
        .iter()
        .any(|h| h.consensus_bandwidth() >= wanted)
}

/// Return `part / whole`, or 0 when `whole` is 0.
fn fraction(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

impl RelayStats {
    /// Describe `set`, measuring against a destination on `port`.
    pub(crate) fn new(set: &RelaySet, port: u16) -> Self {
        let usable = set.exits_not_bad_allowing_port(port, false);
        let cc: Vec<Relay> = usable
            .iter()
            .filter(|r| r.has_2_in_flowctrl())
            .cloned()
            .collect();
        let total_bw = RelaySet::sum_consensus_bw(set.relays());
        let helpable = |mult| {
            set.relays()
                .iter()
                .filter(|r| has_helper(r, set, port, mult))
                .count()
        };
        RelayStats {
            port,
            total: set.len(),
            exits: set.exits().len(),
            bad_exits: set.with_flag(RelayFlags::BAD_EXIT).len(),
            usable_exits: usable.len(),
            cc_exits: cc.len(),
            flowctrl2: set.relays_with_flowctrl(2).len(),
            exit_min_bw: set.exit_min_bw(),
            non_exit_min_bw: set.non_exit_min_bw(),
            helpable_2x: helpable(2.0),
            helpable_1x: helpable(1.0),
            usable_exit_weight: fraction(RelaySet::sum_consensus_bw(&usable), total_bw),
            cc_exit_weight: fraction(RelaySet::sum_consensus_bw(&cc), total_bw),
        }
    }
}

impl Display for RelayStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = |n: usize| fraction(n as u64, self.total as u64) * 100.0;
        writeln!(f, "Relays: {}", self.total)?;
        writeln!(
            f,
            "Exits: {} ({} bad); usable for port {}: {}",
            self.exits, self.bad_exits, self.port, self.usable_exits
        )?;
        writeln!(f, "Usable exits with FlowCtrl=2: {}", self.cc_exits)?;
        writeln!(f, "Relays with FlowCtrl=2: {}", self.flowctrl2)?;
        writeln!(
            f,
            "Minimum helper bandwidth: exit {} B/s, non-exit {} B/s",
            self.exit_min_bw, self.non_exit_min_bw
        )?;
        writeln!(
            f,
            "Relays with a helper at 2x their bandwidth: {} ({:.1}%)",
            self.helpable_2x,
            pct(self.helpable_2x)
        )?;
        writeln!(
            f,
            "Relays with a helper at 1x their bandwidth: {} ({:.1}%)",
            self.helpable_1x,
            pct(self.helpable_1x)
        )?;
        writeln!(
            f,
            "Consensus weight of usable exits: {:.1}%",
            self.usable_exit_weight * 100.0
        )?;
        writeln!(
            f,
            "Consensus weight of usable exits with FlowCtrl=2: {:.1}%",
            self.cc_exit_weight * 100.0
        )
    }
}

/// Plan a measurement of the relay `fp` against `port`, and describe it.
pub(crate) fn describe_path<R: Rng>(
    rng: &mut R,
    set: &RelaySet,
    fp: &Fingerprint,
    port: u16,
) -> Result<String> {
    let target = set
        .by_fingerprint(fp)
        .ok_or_else(|| anyhow!("${} is not in the consensus", fp))?;
    let role = choose_role(target, set, port);
    let path = plan_path(rng, target, set, port, role)?;
    Ok(format!(
        "Measure {} as {}\n  entry: {} ({} B/s)\n  exit:  {} ({} B/s)\n",
        target,
        role,
        path.entry(),
        path.entry().consensus_bandwidth(),
        path.exit(),
        path.exit().consensus_bandwidth(),
    ))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tor_relaylist::testnet;

    #[test]
    fn default_population() {
        let set = testnet::construct_relay_set(testnet::default_relays(), Default::default());
        let s = RelayStats::new(&set, 443);
        assert_eq!(s.total, 20);
        assert_eq!(s.exits, 10);
        assert_eq!(s.bad_exits, 1);
        assert_eq!(s.usable_exits, 9);
        assert_eq!(s.cc_exits, 4);
        assert_eq!(s.flowctrl2, 10);
        assert_eq!(s.exit_min_bw, 300_000);
        assert_eq!(s.helpable_2x, 10);
        assert_eq!(s.helpable_1x, 20);
        assert!((s.usable_exit_weight - 54.0 / 110.0).abs() < 1e-9);
        assert!((s.cc_exit_weight - 24.0 / 110.0).abs() < 1e-9);

        let text = s.to_string();
        assert!(text.contains("Relays: 20\n"));
        assert!(text.contains("usable for port 443: 9"));

        // Nothing can leave through port 80.
        let s = RelayStats::new(&set, 80);
        assert_eq!(s.usable_exits, 0);
    }

    #[test]
    fn path() {
        let set = testnet::construct_relay_set(testnet::default_relays(), Default::default());
        let mut rng = StdRng::from_seed([9; 32]);
        let text = describe_path(&mut rng, &set, &testnet::fingerprint(3), 443).unwrap();
        assert!(text.starts_with("Measure relay3"));
        assert!(text.contains("as exit"));

        let text = describe_path(&mut rng, &set, &testnet::fingerprint(14), 443).unwrap();
        assert!(text.contains("as entry"));
        assert!(text.contains("entry: relay14"));

        let missing = Fingerprint::new([1; 20]);
        assert!(describe_path(&mut rng, &set, &missing, 443).is_err());
    }
}
