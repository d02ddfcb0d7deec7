//! Declare an error type for tor-bwscan.

use std::sync::Arc;
use thiserror::Error;

/// An error that stops the scanner, or keeps it from starting.
///
/// Problems with single measurements are never errors of this kind: they
/// become [`MeasurementResult`](crate::MeasurementResult)s.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The scanner configuration can't work.
    #[error("bad scanner configuration: {0}")]
    BadConfig(String),
    /// The probe configuration can't work.
    #[error("{0}")]
    Probe(#[from] tor_bwprobe::Error),
    /// We couldn't get a list of relays.
    #[error("unable to load relay list: {0}")]
    RelayList(#[from] tor_relaylist::Error),
    /// An IO error occurred while reading or writing state.
    #[error("IO error on state file")]
    Io(#[source] Arc<std::io::Error>),
    /// Tried to save state without holding its lock.
    #[error("state storage not locked")]
    NoLock,
    /// Unable to serialize state as TOML.
    #[error("toml serialization error")]
    TomlWrite(#[from] toml::ser::Error),
    /// Unable to serialize a result as JSON.
    #[error("json serialization error")]
    Json(#[source] Arc<serde_json::Error>),
    /// Unable to deserialize state from TOML.
    #[error("toml deserialization error")]
    TomlRead(#[from] toml::de::Error),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}
