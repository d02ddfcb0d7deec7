//! Exit policies, as published by relays and summarized in a consensus.
//!
//! An exit policy is a sequence of "accept" and "reject" rules applied to
//! an address:port until one matches.  A bandwidth scanner rarely knows
//! which address it will connect to ahead of time: what it wants to know
//! is whether a relay can exit to a given *port*.  That question has two
//! answers, depending on how strict we are:
//!
//!  * lenient: can the relay exit to this port on *some* address?
//!  * strict: can the relay exit to this port on *every* address?
//!
//! Rules whose address part is not a wildcard are therefore "fuzzy"
//! matches when no address is given.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use crate::{Error, Result};

/// A kind of policy rule: either accepts or rejects addresses
/// matching a pattern.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum RuleKind {
    /// A rule that accepts matching address:port combinations.
    Accept,
    /// A rule that rejects matching address:port combinations.
    Reject,
}

/// An inclusive range of ports; never empty, never containing 0.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortRange {
    /// The first port in this range.
    lo: u16,
    /// The last port in this range.
    hi: u16,
}

impl PortRange {
    /// Create a new PortRange containing every port from `lo` to `hi`.
    ///
    /// Returns None if `lo` is greater than `hi`, or if either is zero.
    pub fn new(lo: u16, hi: u16) -> Option<Self> {
        if lo != 0 && lo <= hi {
            Some(PortRange { lo, hi })
        } else {
            None
        }
    }
    /// Create a port range containing all ports.
    pub fn new_all() -> Self {
        PortRange { lo: 1, hi: 65535 }
    }
    /// Return true if `port` is in this range.
    pub fn contains(&self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }
    /// Return true if this range contains all ports.
    pub fn is_all(&self) -> bool {
        self.lo == 1 && self.hi == 65535
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.lo == self.hi {
            write!(f, "{}", self.lo)
        } else {
            write!(f, "{}-{}", self.lo, self.hi)
        }
    }
}

impl FromStr for PortRange {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BadPolicy(format!("bad port range {:?}", s));
        if s == "*" {
            return Ok(PortRange::new_all());
        }
        let (lo, hi) = match s.find('-') {
            Some(idx) => (&s[..idx], &s[idx + 1..]),
            None => (s, s),
        };
        let lo: u16 = lo.parse().map_err(|_| bad())?;
        let hi: u16 = hi.parse().map_err(|_| bad())?;
        PortRange::new(lo, hi).ok_or_else(bad)
    }
}

/// A pattern that matches one or more IP addresses.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum IpPattern {
    /// Match all addresses.
    Star,
    /// Match all IPv4 addresses beginning with a given prefix.
    V4(Ipv4Addr, u8),
    /// Match all IPv6 addresses beginning with a given prefix.
    V6(Ipv6Addr, u8),
}

/// Networks that an exit policy's "private" keyword stands for.
const PRIVATE_V4: &[(Ipv4Addr, u8)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8),
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(100, 64, 0, 0), 10),
    (Ipv4Addr::new(127, 0, 0, 0), 8),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
];

/// As `PRIVATE_V4`, for IPv6.
const PRIVATE_V6: &[(Ipv6Addr, u8)] = &[
    (Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0), 127),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10),
];

/// Return true if the first `mask` bits of `a` and `b` are the same.
fn prefix_eq(a: u128, b: u128, mask: u8, width: u8) -> bool {
    if mask == 0 {
        return true;
    }
    let shift = u32::from(width - mask);
    (a >> shift) == (b >> shift)
}

impl IpPattern {
    /// Return true if this pattern matches every address.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, IpPattern::Star)
    }

    /// Return true iff `addr` is matched by this pattern.
    pub fn matches(&self, addr: &IpAddr) -> bool {
        match (self, addr) {
            (IpPattern::Star, _) => true,
            (IpPattern::V4(pat, mask), IpAddr::V4(addr)) => prefix_eq(
                u128::from(u32::from(*pat)),
                u128::from(u32::from(*addr)),
                *mask,
                32,
            ),
            (IpPattern::V6(pat, mask), IpAddr::V6(addr)) => {
                prefix_eq(u128::from(*pat), u128::from(*addr), *mask, 128)
            }
            (_, _) => false,
        }
    }

    /// Return true if every address matched by this pattern is private
    /// (loopback, link-local, RFC1918 and the like).
    pub fn is_private(&self) -> bool {
        match self {
            IpPattern::Star => false,
            IpPattern::V4(a, m) => PRIVATE_V4.iter().any(|(net, netmask)| {
                *m >= *netmask
                    && prefix_eq(
                        u128::from(u32::from(*net)),
                        u128::from(u32::from(*a)),
                        *netmask,
                        32,
                    )
            }),
            IpPattern::V6(a, m) => PRIVATE_V6.iter().any(|(net, netmask)| {
                *m >= *netmask && prefix_eq(u128::from(*net), u128::from(*a), *netmask, 128)
            }),
        }
    }
}

impl Display for IpPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpPattern::Star => write!(f, "*"),
            IpPattern::V4(a, 32) => write!(f, "{}", a),
            IpPattern::V4(a, m) => write!(f, "{}/{}", a, m),
            IpPattern::V6(a, 128) => write!(f, "[{}]", a),
            IpPattern::V6(a, m) => write!(f, "[{}]/{}", a, m),
        }
    }
}

impl FromStr for IpPattern {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::BadPolicy(format!("bad address pattern {:?}", s));
        if s == "*" || s == "*4" || s == "*6" {
            return Ok(IpPattern::Star);
        }
        let (ip_s, mask_s) = match s.find('/') {
            Some(idx) => (&s[..idx], Some(&s[idx + 1..])),
            None => (s, None),
        };
        let bracketed = ip_s.starts_with('[') && ip_s.ends_with(']');
        let ip_s = if bracketed {
            &ip_s[1..ip_s.len() - 1]
        } else {
            ip_s
        };
        let addr: IpAddr = ip_s.parse().map_err(|_| bad())?;
        if addr.is_ipv6() != bracketed {
            return Err(bad());
        }
        let width = if addr.is_ipv4() { 32 } else { 128 };
        let mask: u8 = match mask_s {
            Some(m) => m.parse().map_err(|_| bad())?,
            None => width,
        };
        match addr {
            _ if mask > width => Err(bad()),
            IpAddr::V4(_) | IpAddr::V6(_) if mask == 0 => Ok(IpPattern::Star),
            IpAddr::V4(a) => Ok(IpPattern::V4(a, mask)),
            IpAddr::V6(a) => Ok(IpPattern::V6(a, mask)),
        }
    }
}

/// A single rule of an exit policy.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicyRule {
    /// What do we do with items that match this rule?
    kind: RuleKind,
    /// Which addresses does this rule cover?
    addrs: IpPattern,
    /// Which ports does this rule cover?
    ports: PortRange,
}

impl PolicyRule {
    /// Make a new rule.
    pub fn new(kind: RuleKind, addrs: IpPattern, ports: PortRange) -> Self {
        PolicyRule { kind, addrs, ports }
    }

    /// Return what this rule does with what it matches.
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Return true if this rule applies to `port`, when the address is
    /// unknown.
    ///
    /// A rule with a specific address is a fuzzy match: in strict mode,
    /// it matters only when it is a reject rule (some address might be
    /// refused); in lenient mode, only when it is an accept rule (some
    /// address might be allowed).
    fn matches_port(&self, port: u16, strict: bool) -> bool {
        if !self.ports.contains(port) {
            return false;
        }
        if self.addrs.is_wildcard() {
            true
        } else {
            strict != (self.kind == RuleKind::Accept)
        }
    }
}

impl Display for PolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cmd = match self.kind {
            RuleKind::Accept => "accept",
            RuleKind::Reject => "reject",
        };
        if self.ports.is_all() {
            write!(f, "{} {}:*", cmd, self.addrs)
        } else {
            write!(f, "{} {}:{}", cmd, self.addrs, self.ports)
        }
    }
}

impl FromStr for PolicyRule {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (kind, rest) = if let Some(r) = s.strip_prefix("accept") {
            (RuleKind::Accept, r)
        } else if let Some(r) = s.strip_prefix("reject") {
            (RuleKind::Reject, r)
        } else {
            return Err(Error::BadPolicy(format!("bad rule {:?}", s)));
        };
        // "accept6" and "reject6" mean the same thing here.
        let rest = rest.strip_prefix('6').unwrap_or(rest).trim();
        let colon = rest
            .rfind(':')
            .ok_or_else(|| Error::BadPolicy(format!("missing port in {:?}", s)))?;
        let addrs = rest[..colon].parse()?;
        let ports = rest[colon + 1..].parse()?;
        Ok(PolicyRule { kind, addrs, ports })
    }
}

/// A relay's exit policy: rules applied in order until one matches.
///
/// When no rule matches, the connection is allowed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExitPolicy {
    /// The rules, in order.
    rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    /// Make a new policy from a list of rules.
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        ExitPolicy { rules }
    }

    /// Make a policy that rejects everything.
    pub fn reject_all() -> Self {
        ExitPolicy::new(vec![PolicyRule::new(
            RuleKind::Reject,
            IpPattern::Star,
            PortRange::new_all(),
        )])
    }

    /// Parse a policy summary, as found on a consensus "p" line: a rule
    /// kind followed by a comma-separated list of ports and port ranges.
    ///
    /// "accept 80,443" accepts those two ports on every address and
    /// rejects everything else; "reject 25" does the opposite.
    pub fn from_summary(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (kind, otherwise) = match parts.next() {
            Some("accept") => (RuleKind::Accept, RuleKind::Reject),
            Some("reject") => (RuleKind::Reject, RuleKind::Accept),
            _ => return Err(Error::BadPolicy(format!("bad summary {:?}", s))),
        };
        let ports = parts
            .next()
            .ok_or_else(|| Error::BadPolicy(format!("summary without ports {:?}", s)))?;
        let mut rules = ports
            .split(',')
            .map(|p| Ok(PolicyRule::new(kind, IpPattern::Star, p.parse()?)))
            .collect::<Result<Vec<_>>>()?;
        rules.push(PolicyRule::new(
            otherwise,
            IpPattern::Star,
            PortRange::new_all(),
        ));
        Ok(ExitPolicy { rules })
    }

    /// Return the rules of this policy.
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules[..]
    }

    /// Return a copy of this policy without the rules that only cover
    /// private addresses.
    pub fn strip_private(&self) -> ExitPolicy {
        ExitPolicy {
            rules: self
                .rules
                .iter()
                .filter(|r| !r.addrs.is_private())
                .cloned()
                .collect(),
        }
    }

    /// Return true if this policy allows exiting to `port`.
    ///
    /// If `strict`, the port must be allowed on every address; otherwise
    /// on some address.
    pub fn can_exit_to(&self, port: u16, strict: bool) -> bool {
        self.rules
            .iter()
            .find(|r| r.matches_port(port, strict))
            .map(|r| r.kind == RuleKind::Accept)
            .unwrap_or(true)
    }

    /// Return true if this policy allows exiting to `addr:port`.
    pub fn allows(&self, addr: &IpAddr, port: u16) -> bool {
        self.rules
            .iter()
            .find(|r| r.addrs.matches(addr) && r.ports.contains(port))
            .map(|r| r.kind == RuleKind::Accept)
            .unwrap_or(true)
    }
}

impl Display for ExitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rules: Vec<_> = self.rules.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", rules.join(", "))
    }
}

impl FromStr for ExitPolicy {
    type Err = Error;
    /// Parse a full policy: rules separated by commas or newlines.
    fn from_str(s: &str) -> Result<Self> {
        let rules = s
            .split(|c| c == ',' || c == '\n')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<PolicyRule>>>()?;
        Ok(ExitPolicy { rules })
    }
}
