//! The seam between the scanner and whatever builds Tor circuits.

use async_trait::async_trait;
use thiserror::Error;
use tor_bwprobe::CircId;
use tor_relaylist::Fingerprint;

/// A failure to build a measurement circuit.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CircuitError(pub String);

/// Something that can build two-hop circuits through chosen relays.
#[async_trait]
pub trait CircuitBuilder: Send + Sync {
    /// Build a circuit through `path`, in order, and return its ID.
    async fn build(&self, path: &[Fingerprint]) -> Result<CircId, CircuitError>;

    /// Close the circuit `circ`.  Closing a circuit twice, or one that
    /// has already failed, is harmless.
    async fn close(&self, circ: CircId);
}
