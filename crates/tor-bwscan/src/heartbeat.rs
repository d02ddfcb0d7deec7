//! Periodic progress reports: how much of the network have we measured?

use std::collections::HashSet;
use std::time::Instant;

use tor_relaylist::Fingerprint;
use tracing::{info, warn};

/// Tracks which relays we have seen and which we have tried to measure,
/// and logs our progress after each round.
#[derive(Debug)]
pub struct Heartbeat {
    /// Every relay seen in a consensus since we started.
    consensus_fps: HashSet<Fingerprint>,
    /// Every relay we've tried to measure since we started.
    measured_fps: HashSet<Fingerprint>,
    /// The percentage measured at the previous report.
    previous_percent: u32,
    /// When we started.
    started: Instant,
}

/// A snapshot of the scanner's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct HeartbeatReport {
    /// Rounds run so far.
    pub rounds: u64,
    /// Relays measured so far.
    pub measured: usize,
    /// Relays seen so far.
    pub total: usize,
    /// `measured` as a rounded percentage of `total`.
    pub percent: u32,
    /// Relays seen but not yet measured.
    pub not_measured: usize,
    /// False if the percentage did not grow since the previous report.
    pub progressed: bool,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    /// Return a new heartbeat with nothing seen.
    pub fn new() -> Self {
        Heartbeat {
            consensus_fps: HashSet::new(),
            measured_fps: HashSet::new(),
            previous_percent: 0,
            started: Instant::now(),
        }
    }

    /// Note every relay in a new consensus.
    pub fn register_consensus_fprs<I>(&mut self, fps: I)
    where
        I: IntoIterator<Item = Fingerprint>,
    {
        self.consensus_fps.extend(fps);
    }

    /// Note that we tried to measure `fp`.
    pub fn register_measured_fpr(&mut self, fp: Fingerprint) {
        self.measured_fps.insert(fp);
    }

    /// Compute our progress, without logging it.
    pub fn report(&self, rounds: u64) -> HeartbeatReport {
        let total = self.consensus_fps.len();
        let measured = self.measured_fps.len();
        let percent = if total == 0 {
            0
        } else {
            ((measured as f64 / total as f64) * 100.0).round() as u32
        };
        let not_measured = self.consensus_fps.difference(&self.measured_fps).count();
        HeartbeatReport {
            rounds,
            measured,
            total,
            percent,
            not_measured,
            progressed: percent > self.previous_percent,
        }
    }

    /// Log our progress after `rounds` rounds, and return it.
    pub fn print_heartbeat_message(&mut self, rounds: u64) -> HeartbeatReport {
        let report = self.report(rounds);
        let minutes = self.started.elapsed().as_secs() / 60;
        info!("Run {} main loops.", report.rounds);
        info!(
            "Measured in total {} ({}%) unique relays in {} minutes",
            report.measured, report.percent, minutes
        );
        info!("{} relays still not measured.", report.not_measured);
        if !report.progressed {
            warn!("There is no progress measuring new unique relays.");
        }
        self.previous_percent = report.percent;
        report
    }
}
