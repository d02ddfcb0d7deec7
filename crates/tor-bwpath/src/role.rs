//! Decide whether a relay is measured as the entry or the exit of its
//! measurement circuit.

use std::fmt::{self, Display};

use tor_relaylist::{NetParameters, Relay, RelaySet};

/// The position of the target relay in a two-hop measurement circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_enums)]
pub enum Role {
    /// The target is the first hop; the helper exits.
    Entry,
    /// The target is the second hop and exits to the destination.
    Exit,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Entry => write!(f, "entry"),
            Role::Exit => write!(f, "exit"),
        }
    }
}

/// Which exits may carry measurement traffic out of the network.
///
/// This is decided by two network parameters: whether congestion control
/// is enabled (`cc_alg`), and whether the scanner should prefer exits
/// that support it (`bwscanner_cc`).
///
/// | congestion control | prefer cc exits | requirement          |
/// |--------------------|-----------------|----------------------|
/// | disabled           | either          | [`Any`](Self::Any)   |
/// | enabled            | yes             | [`WithFlowCtrl2`](Self::WithFlowCtrl2) |
/// | enabled            | no              | [`WithoutFlowCtrl2`](Self::WithoutFlowCtrl2) |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ExitRequirement {
    /// Any exit that can reach the destination port.
    Any,
    /// Only exits that support congestion control (FlowCtrl=2).
    WithFlowCtrl2,
    /// Only exits that don't support congestion control.
    WithoutFlowCtrl2,
}

impl ExitRequirement {
    /// Return the requirement given by a set of network parameters.
    pub fn from_params(params: &NetParameters) -> Self {
        match (params.congestion_control_enabled(), params.prefer_cc_exits()) {
            (false, _) => ExitRequirement::Any,
            (true, true) => ExitRequirement::WithFlowCtrl2,
            (true, false) => ExitRequirement::WithoutFlowCtrl2,
        }
    }

    /// Return true if `relay` satisfies this requirement, ignoring its
    /// flags and exit policy.
    pub fn accepts(self, relay: &Relay) -> bool {
        match self {
            ExitRequirement::Any => true,
            ExitRequirement::WithFlowCtrl2 => relay.has_2_in_flowctrl(),
            ExitRequirement::WithoutFlowCtrl2 => !relay.has_2_in_flowctrl(),
        }
    }

    /// Return the exits in `relays` that satisfy this requirement and can
    /// reach `port`.
    pub fn exits(self, relays: &RelaySet, port: u16) -> Vec<Relay> {
        match self {
            ExitRequirement::Any => relays.exits_not_bad_allowing_port(port, false),
            ExitRequirement::WithFlowCtrl2 => relays.exits_with_flowctrl2(port),
            ExitRequirement::WithoutFlowCtrl2 => relays.exits_without_flowctrl2(port),
        }
    }
}

/// Decide the role of `target` when measuring it against a destination
/// on `port`.
///
/// The target exits when it is an exit, not a bad one, that can reach
/// `port`, and that satisfies the network's [`ExitRequirement`].
pub fn choose_role(target: &Relay, relays: &RelaySet, port: u16) -> Role {
    let requirement = ExitRequirement::from_params(relays.params());
    if target.is_exit_not_bad_allowing_port(port, false) && requirement.accepts(target) {
        Role::Exit
    } else {
        Role::Entry
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tor_relaylist::testnet;

    fn params(cc_alg: &str, bwscanner_cc: &str) -> NetParameters {
        let mut p = NetParameters::default();
        p.saturating_update(vec![("cc_alg", cc_alg), ("bwscanner_cc", bwscanner_cc)].into_iter())
            .unwrap();
        p
    }

    #[test]
    fn requirement_table() {
        use ExitRequirement::*;
        assert_eq!(ExitRequirement::from_params(&params("0", "0")), Any);
        assert_eq!(ExitRequirement::from_params(&params("0", "1")), Any);
        assert_eq!(ExitRequirement::from_params(&params("2", "1")), WithFlowCtrl2);
        assert_eq!(ExitRequirement::from_params(&params("2", "2")), WithFlowCtrl2);
        assert_eq!(ExitRequirement::from_params(&params("2", "0")), WithoutFlowCtrl2);
    }

    #[test]
    fn roles() {
        let set = testnet::construct_relay_set(testnet::default_relays(), params("0", "0"));
        let r = |i: usize| set.by_fingerprint(&testnet::fingerprint(i)).unwrap();
        // Exit allowing 443.
        assert_eq!(choose_role(r(3), &set, 443), Role::Exit);
        // Can't exit to 80.
        assert_eq!(choose_role(r(3), &set, 80), Role::Entry);
        // Bad exit.
        assert_eq!(choose_role(r(0), &set, 443), Role::Entry);
        // Not an exit.
        assert_eq!(choose_role(r(12), &set, 443), Role::Entry);

        let set = testnet::construct_relay_set(testnet::default_relays(), params("2", "1"));
        let r = |i: usize| set.by_fingerprint(&testnet::fingerprint(i)).unwrap();
        assert_eq!(choose_role(r(2), &set, 443), Role::Exit);
        assert_eq!(choose_role(r(3), &set, 443), Role::Entry);

        let set = testnet::construct_relay_set(testnet::default_relays(), params("2", "0"));
        let r = |i: usize| set.by_fingerprint(&testnet::fingerprint(i)).unwrap();
        assert_eq!(choose_role(r(2), &set, 443), Role::Entry);
        assert_eq!(choose_role(r(3), &set, 443), Role::Exit);
    }
}
