//! Configuration for the scanner and the relay prioritizer.

use derive_builder::Builder;
use serde::Deserialize;

use std::time::Duration;

use crate::{Error, Result};

/// Extra time given to unfinished measurements at the end of a round, on
/// top of the socket timeout.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// Configuration for a [`Scanner`](crate::Scanner).
///
/// To create an object of this type, use [`ScannerConfigBuilder`], or
/// deserialize it.
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct ScannerConfig {
    /// A name for this scanner, recorded in every result.
    #[builder(default = "\"bwscanner\".into()")]
    pub(crate) nickname: String,

    /// How many relays to measure at the same time.
    #[builder(default = "3")]
    pub(crate) measurement_threads: usize,

    /// How long to wait when building a circuit or opening a stream.
    #[builder(default = "Duration::from_secs(60)")]
    #[serde(with = "humantime_serde")]
    pub(crate) socket_timeout: Duration,

    /// How long a single measurement may take, once it has started,
    /// before we give up on it.
    #[builder(default = "Duration::from_secs(60 * 10)")]
    #[serde(with = "humantime_serde")]
    pub(crate) measurement_timeout: Duration,

    /// How many results may wait in the queue before we start dropping.
    #[builder(default = "1024")]
    pub(crate) result_queue_len: usize,

    /// How long to wait for room in a full result queue.
    #[builder(default = "Duration::from_secs(3)")]
    #[serde(with = "humantime_serde")]
    pub(crate) result_enqueue_timeout: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        ScannerConfigBuilder::default()
            .build()
            .expect("default scanner configuration is valid")
    }
}

impl ScannerConfig {
    /// Return the scanner's nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }
    /// Return how many measurements may run at once.
    pub fn measurement_threads(&self) -> usize {
        self.measurement_threads
    }
    /// Return the timeout for circuits and streams.
    pub fn socket_timeout(&self) -> Duration {
        self.socket_timeout
    }
    /// Return how long one measurement may take.
    pub fn measurement_timeout(&self) -> Duration {
        self.measurement_timeout
    }
    /// Return the capacity of the result queue.
    pub fn result_queue_len(&self) -> usize {
        self.result_queue_len
    }
    /// Return how long to wait for room in the result queue.
    pub fn result_enqueue_timeout(&self) -> Duration {
        self.result_enqueue_timeout
    }
    /// Return how long unfinished measurements get at the end of a round.
    pub fn drain_timeout(&self) -> Duration {
        self.socket_timeout + DRAIN_GRACE
    }

    /// Check that this configuration can work.
    pub fn validate(&self) -> Result<()> {
        if self.measurement_threads == 0 {
            return Err(Error::BadConfig(
                "measurement_threads must be at least 1".into(),
            ));
        }
        if self.measurement_timeout.is_zero() {
            return Err(Error::BadConfig(
                "measurement_timeout must not be zero".into(),
            ));
        }
        if self.result_queue_len == 0 {
            return Err(Error::BadConfig(
                "result_queue_len must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for how many relays a round measures.
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct PrioritizerConfig {
    /// The fraction of the network to measure each round.
    #[builder(default = "0.05")]
    pub(crate) fraction_relays: f64,

    /// The least number of relays to measure each round.
    #[builder(default = "50")]
    pub(crate) min_relays: usize,
}

impl Default for PrioritizerConfig {
    fn default() -> Self {
        PrioritizerConfigBuilder::default()
            .build()
            .expect("default prioritizer configuration is valid")
    }
}

impl PrioritizerConfig {
    /// Return how many of `total` relays a round should measure.
    pub fn round_size(&self, total: usize) -> usize {
        let fraction = (self.fraction_relays * total as f64).ceil() as usize;
        fraction.max(self.min_relays).min(total)
    }

    /// Check that this configuration can work.
    pub fn validate(&self) -> Result<()> {
        if !(self.fraction_relays > 0.0 && self.fraction_relays <= 1.0) {
            return Err(Error::BadConfig(format!(
                "fraction_relays must be in (0, 1], not {}",
                self.fraction_relays
            )));
        }
        Ok(())
    }
}
