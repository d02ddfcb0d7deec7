//! Declare an error type for the tor-bwpath crate.

use thiserror::Error;
use tor_relaylist::Fingerprint;

use crate::Role;

/// An error returned while choosing a measurement path.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    /// There was no relay suitable to measure the target with.
    #[error("no helper relay available for ${target} as {role}")]
    NoHelperAvailable {
        /// The relay we wanted to measure.
        target: Fingerprint,
        /// The role the target would have had.
        role: Role,
    },
}
