//! Declare an error type for tor-bwprobe.

use thiserror::Error;

use crate::TransferError;

/// An error from probing a relay or configuring the prober.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A request over the circuit failed.
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    /// The destination's file is too short for the requests we make.
    #[error("destination has {content_length} bytes; need at least {wanted}")]
    DestinationTooSmall {
        /// Size of the destination file.
        content_length: u64,
        /// The smallest request we would make.
        wanted: u64,
    },
    /// We were asked to stop before we had any result.
    #[error("measurement interrupted by shutdown")]
    Interrupted,
    /// A destination could not be configured.
    #[error("bad destination {0:?}: {1}")]
    BadDestination(String, &'static str),
    /// The probe configuration is inconsistent.
    #[error("bad probe configuration: {0}")]
    BadConfig(String),
}
