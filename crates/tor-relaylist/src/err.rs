//! Declare an error type for tor-relaylist

use thiserror::Error;

/// An error returned while building or refreshing a relay list.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A consensus document could not be parsed.
    #[error("bad consensus document at line {0}: {1}")]
    BadDocument(usize, String),
    /// A consensus document was missing a required item.
    #[error("consensus document is missing {0}")]
    MissingItem(&'static str),
    /// An exit policy could not be parsed.
    #[error("bad exit policy: {0}")]
    BadPolicy(String),
    /// A relay fingerprint could not be parsed.
    #[error("bad relay fingerprint {0:?}")]
    BadFingerprint(String),
    /// A router status was built without a required field.
    #[error("incomplete router status: missing {0}")]
    IncompleteRouterStatus(&'static str),
    /// The consensus source failed to produce a document.
    #[error("unable to fetch consensus: {0}")]
    SourceFailed(String),
}

/// A problem with one network parameter in a consensus.
///
/// These are never fatal: unrecognized or malformed parameters are logged
/// and otherwise ignored.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParamError {
    /// A parameter key was not one we use.
    #[error("network parameter {0} not recognized")]
    KeyNotRecognized(String),
    /// A recognized key had a value that is not an integer.
    #[error("network parameter {0} had invalid value {1:?}")]
    InvalidValue(String, String),
}
