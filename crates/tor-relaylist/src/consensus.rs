//! Consensus snapshots, and the parts of them that a scanner uses.
//!
//! We don't validate signatures here: the consensus comes from a Tor
//! client that has already checked it (usually from its
//! `cached-consensus` file).  We only extract what we need to choose and
//! measure relays.

use std::net::IpAddr;
use std::time::SystemTime;

use chrono::{NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::{Error, ExitPolicy, Fingerprint, NetParameters, RelayFlags, Result};

/// What a consensus says about a single relay.
#[derive(Debug, Clone)]
pub struct RouterStatus {
    /// Identity fingerprint.
    fingerprint: Fingerprint,
    /// Nickname.
    nickname: String,
    /// IPv4 or IPv6 address of the OR port.
    address: Option<IpAddr>,
    /// Flags voted by the authorities.
    flags: RelayFlags,
    /// Consensus bandwidth, in bytes per second.
    bandwidth: u64,
    /// True if the bandwidth was not measured.
    unmeasured: bool,
    /// FlowCtrl subprotocol versions, as a bitmask.
    flowctrl: u64,
    /// Exit policy, if the consensus summarized one.
    exit_policy: Option<ExitPolicy>,
}

impl RouterStatus {
    /// Return a new builder for a router status.
    pub fn builder() -> RouterStatusBuilder {
        RouterStatusBuilder::default()
    }
    /// Return the identity fingerprint.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
    /// Return the nickname.
    pub fn nickname(&self) -> &str {
        &self.nickname
    }
    /// Return the address, if known.
    pub fn address(&self) -> Option<IpAddr> {
        self.address
    }
    /// Return the flags.
    pub fn flags(&self) -> RelayFlags {
        self.flags
    }
    /// Return the consensus bandwidth in bytes per second.
    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }
    /// Return true if the consensus bandwidth is unmeasured.
    pub fn is_unmeasured(&self) -> bool {
        self.unmeasured
    }
    /// Return the exit policy, if known.
    pub fn exit_policy(&self) -> Option<&ExitPolicy> {
        self.exit_policy.as_ref()
    }
    /// Return true if FlowCtrl version `v` is supported.
    pub fn supports_flowctrl(&self, v: u32) -> bool {
        v < 64 && self.flowctrl & (1 << v) != 0
    }
}

/// A builder for [`RouterStatus`], used by the consensus parser and by
/// tests.
#[derive(Debug, Clone, Default)]
pub struct RouterStatusBuilder {
    /// See [`RouterStatus::fingerprint`].
    fingerprint: Option<Fingerprint>,
    /// See [`RouterStatus::nickname`].
    nickname: Option<String>,
    /// See [`RouterStatus::address`].
    address: Option<IpAddr>,
    /// See [`RouterStatus::flags`].
    flags: RelayFlags,
    /// Bandwidth in bytes per second.
    bandwidth: u64,
    /// See [`RouterStatus::is_unmeasured`].
    unmeasured: bool,
    /// FlowCtrl versions bitmask.
    flowctrl: u64,
    /// See [`RouterStatus::exit_policy`].
    exit_policy: Option<ExitPolicy>,
}

/// Parse a protocol version list like "1-2,4" into a bitmask.
fn parse_versions(s: &str) -> Result<u64> {
    let bad = || Error::BadDocument(0, format!("bad protocol versions {:?}", s));
    let mut mask = 0_u64;
    for part in s.split(',').filter(|p| !p.is_empty()) {
        let (lo, hi) = match part.find('-') {
            Some(idx) => (&part[..idx], &part[idx + 1..]),
            None => (part, part),
        };
        let lo: u32 = lo.parse().map_err(|_| bad())?;
        let hi: u32 = hi.parse().map_err(|_| bad())?;
        if lo > hi || hi >= 64 {
            return Err(bad());
        }
        for v in lo..=hi {
            mask |= 1 << v;
        }
    }
    Ok(mask)
}

impl RouterStatusBuilder {
    /// Set the identity fingerprint.
    pub fn identity(&mut self, fp: Fingerprint) -> &mut Self {
        self.fingerprint = Some(fp);
        self
    }
    /// Set the nickname.
    pub fn nickname(&mut self, nickname: &str) -> &mut Self {
        self.nickname = Some(nickname.to_string());
        self
    }
    /// Set the address.
    pub fn address(&mut self, addr: IpAddr) -> &mut Self {
        self.address = Some(addr);
        self
    }
    /// Replace the flags.
    pub fn set_flags(&mut self, flags: RelayFlags) -> &mut Self {
        self.flags = flags;
        self
    }
    /// Add to the flags.
    pub fn add_flags(&mut self, flags: RelayFlags) -> &mut Self {
        self.flags |= flags;
        self
    }
    /// Set the consensus bandwidth, in kilobytes per second as it
    /// appears in a consensus.
    pub fn bandwidth_kb(&mut self, kb: u64) -> &mut Self {
        self.bandwidth = kb.saturating_mul(1000);
        self
    }
    /// Set the consensus bandwidth, in bytes per second.
    pub fn bandwidth(&mut self, bytes: u64) -> &mut Self {
        self.bandwidth = bytes;
        self
    }
    /// Mark the bandwidth as unmeasured.
    pub fn unmeasured(&mut self, unmeasured: bool) -> &mut Self {
        self.unmeasured = unmeasured;
        self
    }
    /// Set the supported FlowCtrl versions from a list like "1-2".
    pub fn flowctrl(&mut self, versions: &str) -> Result<&mut Self> {
        self.flowctrl = parse_versions(versions)?;
        Ok(self)
    }
    /// Set the exit policy.
    pub fn exit_policy(&mut self, policy: ExitPolicy) -> &mut Self {
        self.exit_policy = Some(policy);
        self
    }
    /// Try to build a router status.
    pub fn build(&self) -> Result<RouterStatus> {
        Ok(RouterStatus {
            fingerprint: self
                .fingerprint
                .ok_or(Error::IncompleteRouterStatus("identity"))?,
            nickname: self
                .nickname
                .clone()
                .ok_or(Error::IncompleteRouterStatus("nickname"))?,
            address: self.address,
            flags: self.flags,
            bandwidth: self.bandwidth,
            unmeasured: self.unmeasured,
            flowctrl: self.flowctrl,
            exit_policy: self.exit_policy.clone(),
        })
    }
}

/// A consensus document, reduced to what the relay list needs.
#[derive(Debug, Clone)]
pub struct Consensus {
    /// When this consensus became valid.
    valid_after: SystemTime,
    /// The network parameters we recognize.
    params: NetParameters,
    /// The listed relays.
    routers: Vec<RouterStatus>,
}

impl Consensus {
    /// Make a consensus from its parts.
    pub fn new(valid_after: SystemTime, params: NetParameters, routers: Vec<RouterStatus>) -> Self {
        Consensus {
            valid_after,
            params,
            routers,
        }
    }
    /// Return when this consensus became valid.
    pub fn valid_after(&self) -> SystemTime {
        self.valid_after
    }
    /// Return the network parameters.
    pub fn params(&self) -> &NetParameters {
        &self.params
    }
    /// Return the listed relays.
    pub fn routers(&self) -> &[RouterStatus] {
        &self.routers[..]
    }
    /// Take the listed relays.
    pub(crate) fn into_parts(self) -> (SystemTime, NetParameters, Vec<RouterStatus>) {
        (self.valid_after, self.params, self.routers)
    }

    /// Parse a consensus (full or microdescriptor flavor) from its text.
    ///
    /// Router entries we can't make sense of are skipped with a warning;
    /// a missing or malformed `valid-after` line is an error.
    pub fn parse(text: &str) -> Result<Self> {
        let mut valid_after = None;
        let mut params = NetParameters::default();
        let mut routers = Vec::new();
        // The router entry being read, by the line it starts on.  Its
        // builder is None once we have decided to skip it.
        let mut cur: Option<(usize, Option<RouterStatusBuilder>)> = None;

        /// Finish the router entry under construction, if any.
        fn finish(
            cur: Option<(usize, Option<RouterStatusBuilder>)>,
            routers: &mut Vec<RouterStatus>,
        ) {
            if let Some((lineno, Some(b))) = cur {
                match b.build() {
                    Ok(rs) => routers.push(rs),
                    Err(e) => warn!("Skipping router entry at line {}: {}", lineno, e),
                }
            }
        }

        for (idx, line) in text.lines().enumerate() {
            let lineno = idx + 1;
            let mut split = line.splitn(2, ' ');
            let kwd = split.next().unwrap_or("");
            let args = split.next().unwrap_or("").trim();
            match kwd {
                "valid-after" => valid_after = Some(parse_time(args, lineno)?),
                "params" => {
                    let pairs = args.split_whitespace().filter_map(|p| {
                        let mut kv = p.splitn(2, '=');
                        Some((kv.next()?, kv.next()?))
                    });
                    if let Err(errs) = params.saturating_update(pairs) {
                        for e in errs {
                            warn!("Ignoring network parameter: {}", e);
                        }
                    }
                }
                "r" => {
                    finish(cur.take(), &mut routers);
                    let b = match parse_r_line(args, lineno) {
                        Ok(b) => Some(b),
                        Err(e) => {
                            warn!("Skipping router entry: {}", e);
                            None
                        }
                    };
                    cur = Some((lineno, b));
                }
                "directory-footer" => finish(cur.take(), &mut routers),
                "s" | "w" | "p" | "pr" => {
                    let entry = match cur.as_mut() {
                        Some((_, entry)) => entry,
                        None => {
                            return Err(Error::BadDocument(
                                lineno,
                                format!("{} line outside a router entry", kwd),
                            ))
                        }
                    };
                    let failed = match entry {
                        Some(b) => apply_router_line(b, kwd, args, lineno).err(),
                        None => None,
                    };
                    if let Some(e) = failed {
                        warn!("Skipping router entry: {}", e);
                        *entry = None;
                    }
                }
                _ => {}
            }
        }
        finish(cur.take(), &mut routers);

        let valid_after = valid_after.ok_or(Error::MissingItem("valid-after"))?;
        debug!("Parsed a consensus with {} relays", routers.len());
        Ok(Consensus::new(valid_after, params, routers))
    }
}

/// Parse a "YYYY-MM-DD HH:MM:SS" time, in UTC.
fn parse_time(s: &str, lineno: usize) -> Result<SystemTime> {
    let t = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| Error::BadDocument(lineno, format!("bad time {:?}: {}", s, e)))?;
    Ok(Utc.from_utc_datetime(&t).into())
}

/// Parse the arguments of an "r" line into a new router builder.
///
/// Full consensuses list a descriptor digest after the identity;
/// microdescriptor consensuses don't.  Either way the address comes
/// third from the end.
fn parse_r_line(args: &str, lineno: usize) -> Result<RouterStatusBuilder> {
    let bad = |m: &str| Error::BadDocument(lineno, m.to_string());
    let fields: Vec<_> = args.split_whitespace().collect();
    if fields.len() < 7 {
        return Err(bad("too few fields on r line"));
    }
    let id = base64::decode_config(fields[1].trim_end_matches('='), base64::STANDARD_NO_PAD)
        .map_err(|_| bad("bad identity encoding"))?;
    let fp = Fingerprint::from_bytes(&id).ok_or_else(|| bad("wrong identity length"))?;
    let mut b = RouterStatus::builder();
    b.identity(fp).nickname(fields[0]);
    let addr_s = fields[fields.len() - 3].trim_matches(|c| c == '[' || c == ']');
    if let Ok(addr) = addr_s.parse() {
        b.address(addr);
    }
    Ok(b)
}

/// Apply one of the per-router lines to `b`.
fn apply_router_line(
    b: &mut RouterStatusBuilder,
    kwd: &str,
    args: &str,
    lineno: usize,
) -> Result<()> {
    match kwd {
        "s" => {
            b.set_flags(RelayFlags::from_flag_list(args));
        }
        "w" => {
            for item in args.split_whitespace() {
                let mut kv = item.splitn(2, '=');
                match (kv.next(), kv.next()) {
                    (Some("Bandwidth"), Some(v)) => {
                        let kb = v.parse().map_err(|_| {
                            Error::BadDocument(lineno, format!("bad bandwidth {:?}", v))
                        })?;
                        b.bandwidth_kb(kb);
                    }
                    (Some("Unmeasured"), Some(v)) => {
                        b.unmeasured(v == "1");
                    }
                    _ => {}
                }
            }
        }
        "p" => {
            let policy = ExitPolicy::from_summary(args)
                .map_err(|e| Error::BadDocument(lineno, e.to_string()))?;
            b.exit_policy(policy);
        }
        "pr" => {
            if let Some(v) = args
                .split_whitespace()
                .find_map(|p| p.strip_prefix("FlowCtrl="))
            {
                b.flowctrl(v)
                    .map_err(|e| Error::BadDocument(lineno, e.to_string()))?;
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    const CONSENSUS: &str = "\
network-status-version 3
vote-status consensus
valid-after 2021-06-01 12:00:00
fresh-until 2021-06-01 13:00:00
params CircuitPriorityHalflifeMsec=30000 bwscanner_cc=1 cc_alg=2
dir-source moria1 D586D18309DED4CD6D57C18FDB97EFA96D330566 128.31.0.34 128.31.0.34 9131 9101
r fast1 AAoQ1DAR6kkoo19hBAX5K0QztNw 2021-06-01 11:55:00 192.0.2.1 9001 0
m sha256digest
s Exit Fast Running Stable V2Dir Valid
v Tor 0.4.7.8
pr Cons=1-2 Desc=1-2 FlowCtrl=1-2 Link=1-5 Relay=1-4
w Bandwidth=2500
p accept 80,443
r slow2 AQoQ1DAR6kkoo19hBAX5K0QztNw ZZZZZZZZZZZZZZZZZZZZZZZZZZZ 2021-06-01 11:55:00 [2001:db8::1] 443 80
s BadExit Exit Running Valid
pr Cons=1-2 FlowCtrl=1
w Bandwidth=20 Unmeasured=1
p reject 1-65535
directory-footer
bandwidth-weights Wbd=0
";

    #[test]
    fn parse_consensus() {
        let c = Consensus::parse(CONSENSUS).unwrap();
        assert_eq!(
            c.valid_after(),
            UNIX_EPOCH + Duration::from_secs(1_622_548_800)
        );
        assert!(c.params().congestion_control_enabled());
        assert!(c.params().prefer_cc_exits());
        assert_eq!(c.routers().len(), 2);

        let r = &c.routers()[0];
        assert_eq!(r.nickname(), "fast1");
        assert_eq!(
            r.fingerprint().to_string(),
            "000A10D43011EA4928A35F610405F92B4433B4DC"
        );
        assert_eq!(r.address(), Some("192.0.2.1".parse().unwrap()));
        assert!(r.flags().contains(RelayFlags::EXIT | RelayFlags::FAST));
        assert_eq!(r.bandwidth(), 2_500_000);
        assert!(!r.is_unmeasured());
        assert!(r.supports_flowctrl(2));
        assert!(r.exit_policy().unwrap().can_exit_to(443, true));

        let r = &c.routers()[1];
        assert_eq!(r.nickname(), "slow2");
        assert_eq!(r.address(), Some("2001:db8::1".parse().unwrap()));
        assert!(r.flags().contains(RelayFlags::BAD_EXIT));
        assert!(r.is_unmeasured());
        assert!(r.supports_flowctrl(1));
        assert!(!r.supports_flowctrl(2));
        assert!(!r.exit_policy().unwrap().can_exit_to(443, false));
    }

    #[test]
    fn parse_errors() {
        assert!(matches!(
            Consensus::parse("params cc_alg=2\n"),
            Err(Error::MissingItem("valid-after"))
        ));
        assert!(matches!(
            Consensus::parse("valid-after yesterday\n"),
            Err(Error::BadDocument(1, _))
        ));
        assert!(matches!(
            Consensus::parse("valid-after 2021-06-01 12:00:00\ns Exit\n"),
            Err(Error::BadDocument(2, _))
        ));
    }

    #[test]
    fn bad_entries_are_skipped() {
        let text = "valid-after 2021-06-01 12:00:00
r a AAoQ1DAR6kkoo19hBAX5K0QztNw 2021-06-01 11:55:00 192.0.2.1 9001 0
w Bandwidth=lots
p accept 80
r b too few fields
s Exit Running Valid
r c AQoQ1DAR6kkoo19hBAX5K0QztNw 2021-06-01 11:55:00 192.0.2.2 9001 0
p accept sometimes
r d AgoQ1DAR6kkoo19hBAX5K0QztNw 2021-06-01 11:55:00 192.0.2.3 9001 0
s Fast Running Valid
pr FlowCtrl=1-2
w Bandwidth=30
directory-footer
";
        let c = Consensus::parse(text).unwrap();
        assert_eq!(c.routers().len(), 1);
        let r = &c.routers()[0];
        assert_eq!(r.nickname(), "d");
        assert_eq!(r.bandwidth(), 30_000);
        assert!(r.supports_flowctrl(2));
    }

    #[test]
    fn versions() {
        assert_eq!(parse_versions("1-2").unwrap(), 0b110);
        assert_eq!(parse_versions("1,3-4").unwrap(), 0b11010);
        assert_eq!(parse_versions("").unwrap(), 0);
        assert!(parse_versions("2-1").is_err());
        assert!(parse_versions("x").is_err());
        assert!(parse_versions("70").is_err());
    }
}
