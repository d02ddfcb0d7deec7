//! The network side of a probe.
//!
//! We don't make HTTP requests or build circuits ourselves: a backend
//! does that, and we only time what it does.

use std::fmt::{self, Display};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::{ByteRange, Destination};

/// An identifier for a circuit built by the circuit backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(clippy::exhaustive_structs)]
pub struct CircId(pub u64);

impl Display for CircId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Circ {}", self.0)
    }
}

/// Serialize a duration as fractional seconds.
fn as_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// A single timed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DownloadSample {
    /// How many bytes were transferred.
    amount: u64,
    /// How long the transfer took.
    #[serde(serialize_with = "as_secs")]
    duration: Duration,
}

impl DownloadSample {
    /// Make a new sample.
    pub fn new(amount: u64, duration: Duration) -> Self {
        DownloadSample { amount, duration }
    }
    /// Return how many bytes were transferred.
    pub fn amount(&self) -> u64 {
        self.amount
    }
    /// Return how long the transfer took.
    pub fn duration(&self) -> Duration {
        self.duration
    }
    /// Return the observed throughput in bytes per second.
    pub fn bandwidth(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.amount as f64 / secs
        } else {
            0.0
        }
    }
}

/// An error from the transfer backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransferError {
    /// A request did not finish in time.
    #[error("request timed out")]
    Timeout,
    /// We couldn't connect to the destination over the circuit.
    #[error("unable to connect: {0}")]
    Connect(String),
    /// The destination answered, but not with what we asked for.
    #[error("bad response: {0}")]
    BadResponse(String),
    /// The circuit failed during the transfer.
    #[error("circuit failed: {0}")]
    Circuit(String),
}

/// A connection to a destination over a measurement circuit, able to
/// fetch byte ranges of the destination's file.
#[async_trait]
pub trait RangeStream: Send {
    /// Fetch `range` and read the whole response body.
    async fn get_range(&mut self, range: ByteRange) -> Result<(), TransferError>;
}

/// A backend that can use measurement circuits to reach destinations.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Open a connection to `dest` over the circuit `circ`.
    async fn open(
        &self,
        circ: CircId,
        dest: &Destination,
    ) -> Result<Box<dyn RangeStream>, TransferError>;

    /// Upload `size` bytes to `dest` over the circuit `circ`, and return
    /// the circuit's observed throughput as a sample.
    async fn upload(
        &self,
        circ: CircId,
        dest: &Destination,
        size: u64,
    ) -> Result<DownloadSample, TransferError>;
}
