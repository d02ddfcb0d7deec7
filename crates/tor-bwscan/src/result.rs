//! The outcome of measuring one relay.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};
use thiserror::Error;
use tor_bwprobe::DownloadSample;
use tor_relaylist::{Fingerprint, Relay};

/// A reason why measuring a relay produced no throughput samples.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[serde(tag = "error", content = "msg", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum MeasurementError {
    /// No relay could serve as the other hop of the circuit.
    #[error("no helper relay available")]
    NoHelperAvailable,
    /// The circuit could not be built.
    #[error("unable to build circuit: {0}")]
    NoCircuit(String),
    /// Every destination is failing.
    #[error("no functional destination")]
    NoFunctionalDestination,
    /// The circuit was built, but we couldn't reach the destination over
    /// it.
    #[error("unable to reach destination: {0}")]
    StreamUnusable(String),
    /// The destination was reachable, but a probe failed.
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    /// The measurement took too long, and was abandoned.
    #[error("measurement timed out: {0}")]
    TimedOut(String),
    /// The measurement task itself failed.
    #[error("internal error: {0}")]
    InternalFault(String),
}

/// What happened when we measured a relay.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Outcome {
    /// The relay was measured.
    Success {
        /// Round trip times of small requests.
        #[serde(serialize_with = "durations_as_secs")]
        rtts: Vec<Duration>,
        /// Throughput samples.
        downloads: Vec<DownloadSample>,
    },
    /// The relay could not be measured.
    Failure(MeasurementError),
}

/// An immutable record of one measurement attempt.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementResult {
    /// The measured relay.
    fingerprint: Fingerprint,
    /// The measured relay's nickname.
    nickname: String,
    /// The measured relay's address, if known.
    address: Option<IpAddr>,
    /// The measured relay's consensus bandwidth, in bytes per second.
    consensus_bandwidth: u64,
    /// True if that bandwidth was not measured by bandwidth authorities.
    consensus_bandwidth_is_unmeasured: bool,
    /// The circuit used, entry first.  Empty if none was chosen.
    circ: Vec<Fingerprint>,
    /// The destination used, if any.
    dest_url: Option<String>,
    /// The nickname of the scanner that made the measurement.
    scanner: String,
    /// When the measurement finished.
    #[serde(serialize_with = "time_as_secs")]
    time: SystemTime,
    /// What happened.
    outcome: Outcome,
}

impl MeasurementResult {
    /// Return a result for `relay`, finished now.
    pub fn new(
        relay: &Relay,
        circ: &[Fingerprint],
        dest_url: Option<&str>,
        scanner: &str,
        outcome: Outcome,
    ) -> Self {
        MeasurementResult {
            fingerprint: *relay.fingerprint(),
            nickname: relay.nickname().to_string(),
            address: relay.address(),
            consensus_bandwidth: relay.consensus_bandwidth(),
            consensus_bandwidth_is_unmeasured: relay.consensus_bandwidth_is_unmeasured(),
            circ: circ.to_vec(),
            dest_url: dest_url.map(str::to_string),
            scanner: scanner.to_string(),
            time: SystemTime::now(),
            outcome,
        }
    }

    /// Return the fingerprint of the measured relay.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
    /// Return the nickname of the measured relay.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }
    /// Return the circuit used, entry first.
    pub fn circ(&self) -> &[Fingerprint] {
        &self.circ
    }
    /// Return the destination URL used, if any.
    pub fn dest_url(&self) -> Option<&str> {
        self.dest_url.as_deref()
    }
    /// Return the scanner nickname.
    pub fn scanner(&self) -> &str {
        &self.scanner
    }
    /// Return when the measurement finished.
    pub fn time(&self) -> SystemTime {
        self.time
    }
    /// Return what happened.
    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }
    /// Return the error, if this measurement failed.
    pub fn error(&self) -> Option<&MeasurementError> {
        match &self.outcome {
            Outcome::Failure(e) => Some(e),
            Outcome::Success { .. } => None,
        }
    }
    /// Return true if this measurement produced samples.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }
}

/// Serialize a time as seconds since the epoch.
fn time_as_secs<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    let secs = t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64();
    s.serialize_f64(secs)
}

/// Serialize durations as fractional seconds.
fn durations_as_secs<S: Serializer>(d: &[Duration], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(d.iter().map(Duration::as_secs_f64))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tor_relaylist::testnet;

    #[test]
    fn json_shape() {
        let target = testnet::relay(testnet::default_relays().remove(3));
        let helper = testnet::fingerprint(13);
        let ok = MeasurementResult::new(
            &target,
            &[helper, *target.fingerprint()],
            Some("https://example.com/1G"),
            "scanner1",
            Outcome::Success {
                rtts: vec![Duration::from_millis(250)],
                downloads: vec![DownloadSample::new(1000, Duration::from_secs(2))],
            },
        );
        assert!(ok.is_success());
        assert!(ok.error().is_none());
        let v = serde_json::to_value(&ok).unwrap();
        assert_eq!(v["nickname"], "relay3");
        assert_eq!(v["consensus_bandwidth"], 400_000);
        assert_eq!(v["scanner"], "scanner1");
        assert_eq!(v["circ"][1], target.fingerprint().to_string());
        assert_eq!(v["outcome"]["type"], "success");
        assert_eq!(v["outcome"]["rtts"][0], 0.25);

        let failed = MeasurementResult::new(
            &target,
            &[],
            None,
            "scanner1",
            Outcome::Failure(MeasurementError::NoCircuit("timeout".into())),
        );
        assert_eq!(
            failed.error(),
            Some(&MeasurementError::NoCircuit("timeout".into()))
        );
        let v = serde_json::to_value(&failed).unwrap();
        assert_eq!(v["outcome"]["type"], "failure");
        assert_eq!(v["outcome"]["error"], "no-circuit");
        assert_eq!(v["outcome"]["msg"], "timeout");
        assert!(v["dest_url"].is_null());
    }
}
