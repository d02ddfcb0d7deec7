//! Relays, as the scanner sees them.

use std::fmt::{self, Display};
use std::str::FromStr;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, ExitPolicy, RelayHistory, RouterStatus};

/// The RSA identity fingerprint of a relay.
///
/// Shown as 40 uppercase hexadecimal digits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 20]);

impl Fingerprint {
    /// Construct a fingerprint from its raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Fingerprint(bytes)
    }
    /// Construct a fingerprint from a byte slice, if it has the right length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut out = [0_u8; 20];
        if bytes.len() != out.len() {
            return None;
        }
        out.copy_from_slice(bytes);
        Some(Fingerprint(out))
    }
    /// Return the raw bytes of this fingerprint.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode_upper(self.0))
    }
}

impl FromStr for Fingerprint {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Error> {
        // Accept the "$" prefix used in control-port output.
        let hex_part = s.strip_prefix('$').unwrap_or(s);
        let bytes = hex::decode(hex_part).map_err(|_| Error::BadFingerprint(s.to_string()))?;
        Fingerprint::from_bytes(&bytes).ok_or_else(|| Error::BadFingerprint(s.to_string()))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

bitflags! {
    /// A set of directory flags on a single relay.
    ///
    /// These come from the "s" line of the relay's entry in a consensus.
    /// Flags that we don't recognize are ignored.
    pub struct RelayFlags: u16 {
        /// Is this a directory authority?
        const AUTHORITY = (1<<0);
        /// Is this relay marked as a bad exit?
        ///
        /// Bad exits can still be used as the first hop of a
        /// measurement circuit.
        const BAD_EXIT = (1<<1);
        /// Is this relay marked as an exit for weighting purposes?
        const EXIT = (1<<2);
        /// Is this relay considered "fast" above a certain threshold?
        const FAST = (1<<3);
        /// Is this relay suitable for use as a guard relay?
        const GUARD = (1<<4);
        /// Does this relay participate on the hidden service directory
        /// ring?
        const HSDIR = (1<<5);
        /// Is this relay considered "stable" enough for long-lived circuits?
        const STABLE = (1<<6);
        /// Set if this relay is currently running.
        const RUNNING = (1<<7);
        /// Set if this relay is allowed to be on the network.
        const VALID = (1<<8);
        /// Set if this relay supports a currently recognized version of the
        /// directory protocol.
        const V2DIR = (1<<9);
    }
}

impl FromStr for RelayFlags {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Authority" => RelayFlags::AUTHORITY,
            "BadExit" => RelayFlags::BAD_EXIT,
            "Exit" => RelayFlags::EXIT,
            "Fast" => RelayFlags::FAST,
            "Guard" => RelayFlags::GUARD,
            "HSDir" => RelayFlags::HSDIR,
            "Stable" => RelayFlags::STABLE,
            "Running" => RelayFlags::RUNNING,
            "Valid" => RelayFlags::VALID,
            "V2Dir" => RelayFlags::V2DIR,
            _ => RelayFlags::empty(),
        })
    }
}

impl Default for RelayFlags {
    fn default() -> Self {
        RelayFlags::empty()
    }
}

impl RelayFlags {
    /// Parse a whitespace-separated list of flags, as on an "s" line.
    pub fn from_flag_list(s: &str) -> Self {
        s.split_whitespace()
            .map(|f| f.parse().unwrap_or_else(|_| RelayFlags::empty()))
            .fold(RelayFlags::empty(), |a, b| a | b)
    }
}

/// A relay listed in the current consensus, together with its
/// measurement history.
///
/// Cloning a `Relay` is cheap: the router status and history are shared.
#[derive(Clone, Debug)]
pub struct Relay {
    /// What the consensus says about this relay.
    rs: Arc<RouterStatus>,
    /// What we remember about this relay.
    history: Arc<RelayHistory>,
}

impl Relay {
    /// Wrap a router status and a history into a relay.
    pub(crate) fn new(rs: Arc<RouterStatus>, history: Arc<RelayHistory>) -> Self {
        Relay { rs, history }
    }

    /// Return the identity fingerprint of this relay.
    pub fn fingerprint(&self) -> &Fingerprint {
        self.rs.fingerprint()
    }
    /// Return the nickname of this relay.
    pub fn nickname(&self) -> &str {
        self.rs.nickname()
    }
    /// Return the address of this relay, if known.
    pub fn address(&self) -> Option<std::net::IpAddr> {
        self.rs.address()
    }
    /// Return the flags of this relay.
    pub fn flags(&self) -> RelayFlags {
        self.rs.flags()
    }
    /// Return true if this relay has every flag in `flags`.
    pub fn has_flag(&self, flags: RelayFlags) -> bool {
        self.rs.flags().contains(flags)
    }
    /// Return the consensus bandwidth of this relay, in bytes per second.
    pub fn consensus_bandwidth(&self) -> u64 {
        self.rs.bandwidth()
    }
    /// Return true if the consensus bandwidth of this relay was not
    /// measured by enough bandwidth authorities.
    pub fn consensus_bandwidth_is_unmeasured(&self) -> bool {
        self.rs.is_unmeasured()
    }
    /// Return the exit policy of this relay, if known.
    pub fn exit_policy(&self) -> Option<&ExitPolicy> {
        self.rs.exit_policy()
    }
    /// Return the router status this relay was built from.
    pub fn router_status(&self) -> &RouterStatus {
        &self.rs
    }
    /// Return the measurement history of this relay.
    pub fn history(&self) -> &Arc<RelayHistory> {
        &self.history
    }

    /// Return true if this relay advertises support for version `v` of
    /// the FlowCtrl subprotocol.
    pub fn supports_flowctrl(&self, v: u32) -> bool {
        self.rs.supports_flowctrl(v)
    }
    /// Return true if this relay supports congestion control
    /// (FlowCtrl=2).
    pub fn has_2_in_flowctrl(&self) -> bool {
        self.supports_flowctrl(2)
    }

    /// Return true if this relay's exit policy, without the rules about
    /// private addresses, allows exiting to `port`.
    ///
    /// If `strict`, the port must be allowed on every address.  A relay
    /// whose policy we don't know can't exit anywhere.
    pub fn can_exit_to_port(&self, port: u16, strict: bool) -> bool {
        match self.exit_policy() {
            Some(p) => p.strip_private().can_exit_to(port, strict),
            None => false,
        }
    }

    /// Return true if this relay has the Exit flag, lacks the BadExit
    /// flag, and can exit to `port`.
    pub fn is_exit_not_bad_allowing_port(&self, port: u16, strict: bool) -> bool {
        self.has_flag(RelayFlags::EXIT)
            && !self.has_flag(RelayFlags::BAD_EXIT)
            && self.can_exit_to_port(port, strict)
    }
}

impl PartialEq for Relay {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for Relay {}

impl Display for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (${})", self.nickname(), self.fingerprint())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::HistoryLimits;
    use hex_literal::hex;

    #[test]
    fn fingerprint() {
        let fp: Fingerprint = "$0123456789ABCDEF0123456789abcdef01234567".parse().unwrap();
        assert_eq!(
            fp.as_bytes(),
            &hex!("0123456789ABCDEF0123456789ABCDEF01234567")
        );
        assert_eq!(fp.to_string(), "0123456789ABCDEF0123456789ABCDEF01234567");
        assert!("0123".parse::<Fingerprint>().is_err());
        assert!("zz23456789ABCDEF0123456789abcdef01234567"
            .parse::<Fingerprint>()
            .is_err());
    }

    #[test]
    fn flags() {
        let f = RelayFlags::from_flag_list("Exit Fast Guard Running Valid Unknown");
        assert_eq!(
            f,
            RelayFlags::EXIT
                | RelayFlags::FAST
                | RelayFlags::GUARD
                | RelayFlags::RUNNING
                | RelayFlags::VALID
        );
        assert_eq!(RelayFlags::from_flag_list(""), RelayFlags::empty());
    }

    fn relay(flags: RelayFlags, policy: Option<&str>) -> Relay {
        let mut b = RouterStatus::builder();
        b.identity(Fingerprint::new([7; 20]))
            .nickname("r7")
            .set_flags(flags)
            .bandwidth_kb(100)
            .flowctrl("1-2")
            .unwrap();
        if let Some(p) = policy {
            b.exit_policy(ExitPolicy::from_summary(p).unwrap());
        }
        let rs = b.build().unwrap();
        Relay::new(
            Arc::new(rs),
            Arc::new(RelayHistory::new(&HistoryLimits::default())),
        )
    }

    #[test]
    fn exit_checks() {
        let r = relay(RelayFlags::EXIT, Some("accept 443"));
        assert!(r.is_exit_not_bad_allowing_port(443, false));
        assert!(!r.is_exit_not_bad_allowing_port(80, false));
        assert!(r.has_2_in_flowctrl());
        assert!(!r.supports_flowctrl(3));
        assert_eq!(r.consensus_bandwidth(), 100_000);

        let r = relay(RelayFlags::EXIT | RelayFlags::BAD_EXIT, Some("accept 443"));
        assert!(!r.is_exit_not_bad_allowing_port(443, false));
        assert!(r.can_exit_to_port(443, true));

        let r = relay(RelayFlags::FAST, Some("accept 443"));
        assert!(!r.is_exit_not_bad_allowing_port(443, false));

        let r = relay(RelayFlags::EXIT, None);
        assert!(!r.can_exit_to_port(443, false));
    }
}
