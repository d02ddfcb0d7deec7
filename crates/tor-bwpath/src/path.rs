//! Two-hop measurement paths.

use rand::Rng;
use tracing::debug;

use tor_relaylist::{ExitPolicy, Fingerprint, Relay, RelaySet};

use crate::{helper_candidates, pick_helper, Error, Result, Role};

/// A two-hop path chosen to measure one relay.
#[derive(Debug, Clone)]
pub struct MeasurementPath {
    /// The relay being measured.
    target: Relay,
    /// The relay helping to measure it.
    helper: Relay,
    /// Where the target sits in the path.
    role: Role,
}

impl MeasurementPath {
    /// Return the relay being measured.
    pub fn target(&self) -> &Relay {
        &self.target
    }
    /// Return the helper relay.
    pub fn helper(&self) -> &Relay {
        &self.helper
    }
    /// Return the role of the target.
    pub fn role(&self) -> Role {
        self.role
    }
    /// Return the first hop.
    pub fn entry(&self) -> &Relay {
        match self.role {
            Role::Entry => &self.target,
            Role::Exit => &self.helper,
        }
    }
    /// Return the second hop, which exits to the destination.
    pub fn exit(&self) -> &Relay {
        match self.role {
            Role::Entry => &self.helper,
            Role::Exit => &self.target,
        }
    }
    /// Return the fingerprints of the path, entry first.
    pub fn fingerprints(&self) -> [Fingerprint; 2] {
        [*self.entry().fingerprint(), *self.exit().fingerprint()]
    }
    /// Return the nicknames of the path, entry first.
    pub fn nicknames(&self) -> [&str; 2] {
        [self.entry().nickname(), self.exit().nickname()]
    }
    /// Return the exit policy of the exit hop, if known.
    pub fn exit_policy(&self) -> Option<&ExitPolicy> {
        self.exit().exit_policy()
    }
}

/// Choose a path for measuring `target` against a destination on `port`,
/// with the target in `role`.
///
/// The helper must reach the minimum bandwidth for its own position: the
/// network's `exit_min_bw` when it exits, `non_exit_min_bw` otherwise.
pub fn plan_path<R: Rng>(
    rng: &mut R,
    target: &Relay,
    relays: &RelaySet,
    port: u16,
    role: Role,
) -> Result<MeasurementPath> {
    let candidates = helper_candidates(target, relays, port, role);
    let min_bw = match role {
        Role::Entry => relays.exit_min_bw(),
        Role::Exit => relays.non_exit_min_bw(),
    };
    let helper = pick_helper(rng, target.consensus_bandwidth(), &candidates, min_bw).ok_or(
        Error::NoHelperAvailable {
            target: *target.fingerprint(),
            role,
        },
    )?;
    debug!(
        "Measuring {} as {} with helper {} ({} candidates)",
        target,
        role,
        helper,
        candidates.len()
    );
    Ok(MeasurementPath {
        target: target.clone(),
        helper,
        role,
    })
}
