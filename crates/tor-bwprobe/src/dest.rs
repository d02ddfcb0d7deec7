//! Destinations: web servers holding a large file that we download over
//! measurement circuits.
//!
//! A destination that keeps failing is probably down, and every
//! measurement we try through it would be wasted.  [`DestinationList`]
//! stops handing out a destination after a few consecutive failures, and
//! tries it again after a delay that grows each time it fails again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{Error, Result};

/// How many recent attempts we remember per destination.
const NUM_DESTINATION_ATTEMPTS_STORED: usize = 10;
/// After this many consecutive failures a destination is not used.
const MAX_NUM_DESTINATION_FAILURES: usize = 3;
/// How long we first wait before trying a failed destination again.
const DELTA_SECONDS_RETRY_DESTINATION: Duration = Duration::from_secs(60 * 5);
/// The longest we ever wait before trying a failed destination again.
const MAX_SECONDS_RETRY_DESTINATION: Duration = Duration::from_secs(60 * 60 * 3);
/// How much the wait grows each time a retried destination fails again.
const FACTOR_INCREMENT_DESTINATION_RETRY: u32 = 2;

/// A server from which we download data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// The URL of the file we download.
    url: String,
    /// The TCP port the URL points at.
    port: u16,
    /// The length of the file, in bytes.
    content_length: u64,
    /// Whether to verify the server's TLS certificate.
    verify: bool,
}

/// Return the port that `url` connects to.
fn port_from_url(url: &str) -> Option<u16> {
    let (default_port, rest) = if let Some(r) = url.strip_prefix("https://") {
        (443, r)
    } else if let Some(r) = url.strip_prefix("http://") {
        (80, r)
    } else {
        return None;
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    // Skip over a bracketed IPv6 address.
    let after_host = match authority.rfind(']') {
        Some(idx) => &authority[idx + 1..],
        None => authority,
    };
    match after_host.rfind(':') {
        Some(idx) => after_host[idx + 1..].parse().ok(),
        None => Some(default_port),
    }
}

impl Destination {
    /// Make a new destination from its URL and the length of the file.
    pub fn new(url: &str, content_length: u64, verify: bool) -> Result<Self> {
        let port = port_from_url(url)
            .ok_or_else(|| Error::BadDestination(url.to_string(), "not an http(s) URL"))?;
        if content_length == 0 {
            return Err(Error::BadDestination(url.to_string(), "empty file"));
        }
        Ok(Destination {
            url: url.to_string(),
            port,
            content_length,
            verify,
        })
    }
    /// Return the URL of this destination.
    pub fn url(&self) -> &str {
        &self.url
    }
    /// Return the port that an exit must allow to reach this destination.
    pub fn port(&self) -> u16 {
        self.port
    }
    /// Return the length of this destination's file.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }
    /// Return true if the TLS certificate must be verified.
    pub fn verify(&self) -> bool {
        self.verify
    }
}

/// Configuration for a single destination.
#[derive(Debug, Clone, Deserialize)]
pub struct DestinationConfig {
    /// The URL of the file.
    pub url: String,
    /// The length of the file in bytes.
    #[serde(default = "default_content_length")]
    pub content_length: u64,
    /// Whether to verify the TLS certificate.
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Whether to use this destination at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Destinations usually serve a 1 GiB file.
fn default_content_length() -> u64 {
    1024 * 1024 * 1024
}

/// Helper for serde defaults.
fn default_true() -> bool {
    true
}

/// Something that hands out destinations and learns which ones work.
pub trait DestinationPool: Send + Sync {
    /// Return a destination to use for the next measurement, if any
    /// destination is usable.
    fn next(&self) -> Option<Arc<Destination>>;
    /// Note that a measurement through `dest` worked.
    fn report_success(&self, dest: &Destination);
    /// Note that a measurement through `dest` failed because of the
    /// destination.
    fn report_failure(&self, dest: &Destination);
    /// Return true if at least one destination is usable.
    fn functional_destinations(&self) -> bool;
}

/// What we know about how well a destination works.
#[derive(Debug, Clone)]
struct Health {
    /// Recent attempts, oldest first; true for success.
    attempts: VecDeque<bool>,
    /// How many attempts in a row have failed.
    consecutive_failures: usize,
    /// How long to wait before the next retry.
    retry_delay: Duration,
    /// When we may try this destination again, if it is not functional.
    retry_at: Option<Instant>,
}

impl Default for Health {
    fn default() -> Self {
        Health {
            attempts: VecDeque::with_capacity(NUM_DESTINATION_ATTEMPTS_STORED),
            consecutive_failures: 0,
            retry_delay: DELTA_SECONDS_RETRY_DESTINATION,
            retry_at: None,
        }
    }
}

impl Health {
    /// Remember an attempt.
    fn record(&mut self, success: bool) {
        if self.attempts.len() == NUM_DESTINATION_ATTEMPTS_STORED {
            self.attempts.pop_front();
        }
        self.attempts.push_back(success);
    }

    /// Return true if the destination can be used at `now`.
    fn is_functional(&self, now: Instant) -> bool {
        self.consecutive_failures < MAX_NUM_DESTINATION_FAILURES
            || self.retry_at.map_or(false, |t| now >= t)
    }

    /// Note a success.
    fn succeeded(&mut self) {
        self.record(true);
        self.consecutive_failures = 0;
        self.retry_delay = DELTA_SECONDS_RETRY_DESTINATION;
        self.retry_at = None;
    }

    /// Note a failure at `now`.  Return true if the destination just
    /// became non-functional.
    ///
    /// Failures reported while we are already waiting to retry come from
    /// attempts that started earlier, and don't extend the wait.
    fn failed(&mut self, now: Instant) -> bool {
        self.record(false);
        self.consecutive_failures += 1;
        if self.consecutive_failures < MAX_NUM_DESTINATION_FAILURES {
            return false;
        }
        match self.retry_at {
            Some(t) if now < t => return false,
            Some(_) => {
                // It failed again after a retry.
                self.retry_delay = std::cmp::min(
                    self.retry_delay * FACTOR_INCREMENT_DESTINATION_RETRY,
                    MAX_SECONDS_RETRY_DESTINATION,
                );
            }
            None => {}
        }
        self.retry_at = Some(now + self.retry_delay);
        true
    }
}

/// A fixed list of destinations, each with its failure history.
#[derive(Debug)]
pub struct DestinationList {
    /// The destinations and their health.
    dests: Vec<(Arc<Destination>, Mutex<Health>)>,
}

/// Lock `m`, tolerating poison.
fn lock(m: &Mutex<Health>) -> std::sync::MutexGuard<'_, Health> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl DestinationList {
    /// Build a list from configured destinations, skipping disabled ones.
    ///
    /// Fails if a destination is malformed or none is enabled.
    pub fn from_config(cfgs: &[DestinationConfig]) -> Result<Self> {
        let dests = cfgs
            .iter()
            .filter(|c| c.enabled)
            .map(|c| Destination::new(&c.url, c.content_length, c.verify))
            .collect::<Result<Vec<_>>>()?;
        if dests.is_empty() {
            return Err(Error::BadConfig("no destination is enabled".into()));
        }
        Ok(DestinationList::new(dests))
    }

    /// Make a list of `dests`, all assumed to work.
    pub fn new(dests: Vec<Destination>) -> Self {
        DestinationList {
            dests: dests
                .into_iter()
                .map(|d| (Arc::new(d), Mutex::new(Health::default())))
                .collect(),
        }
    }

    /// Return the number of destinations, usable or not.
    pub fn len(&self) -> usize {
        self.dests.len()
    }

    /// Return true if the list has no destinations.
    pub fn is_empty(&self) -> bool {
        self.dests.is_empty()
    }

    /// Return the health record of `dest`.
    fn health(&self, dest: &Destination) -> Option<&Mutex<Health>> {
        self.dests.iter().find(|(d, _)| **d == *dest).map(|(_, h)| h)
    }

    /// Return the usable destinations at `now`.
    fn functional_at(&self, now: Instant) -> Vec<Arc<Destination>> {
        self.dests
            .iter()
            .filter(|(_, h)| lock(h).is_functional(now))
            .map(|(d, _)| Arc::clone(d))
            .collect()
    }

    /// As [`DestinationPool::report_failure`], at `now`.
    fn report_failure_at(&self, dest: &Destination, now: Instant) {
        if let Some(h) = self.health(dest) {
            let mut h = lock(h);
            if h.failed(now) {
                warn!(
                    "Destination {} failed {} times in a row; not using it for {:?}.",
                    dest.url(),
                    h.consecutive_failures,
                    h.retry_delay
                );
            }
        }
    }
}

impl DestinationPool for DestinationList {
    fn next(&self) -> Option<Arc<Destination>> {
        self.functional_at(Instant::now())
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    fn report_success(&self, dest: &Destination) {
        if let Some(h) = self.health(dest) {
            let mut h = lock(h);
            if h.retry_at.is_some() {
                info!("Destination {} is working again.", dest.url());
            }
            h.succeeded();
        }
    }

    fn report_failure(&self, dest: &Destination) {
        self.report_failure_at(dest, Instant::now());
    }

    fn functional_destinations(&self) -> bool {
        !self.functional_at(Instant::now()).is_empty()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn ports() {
        assert_eq!(port_from_url("https://example.com/1GiB"), Some(443));
        assert_eq!(port_from_url("http://example.com/1GiB"), Some(80));
        assert_eq!(port_from_url("https://example.com:8443/f"), Some(8443));
        assert_eq!(port_from_url("http://[2001:db8::1]/f"), Some(80));
        assert_eq!(port_from_url("http://[2001:db8::1]:81/f"), Some(81));
        assert_eq!(port_from_url("ftp://example.com/"), None);
        assert_eq!(port_from_url("https://example.com:99999/"), None);
    }

    #[test]
    fn destination() {
        let d = Destination::new("https://example.com/f", 100, true).unwrap();
        assert_eq!(d.port(), 443);
        assert_eq!(d.content_length(), 100);
        assert!(d.verify());
        assert!(Destination::new("https://example.com/f", 0, true).is_err());
        assert!(Destination::new("example.com", 10, true).is_err());
    }

    #[test]
    fn from_config() {
        let cfg = |url: &str, enabled| DestinationConfig {
            url: url.into(),
            content_length: 1000,
            verify: false,
            enabled,
        };
        let list = DestinationList::from_config(&[
            cfg("https://a.example/f", true),
            cfg("https://b.example/f", false),
        ])
        .unwrap();
        assert_eq!(list.len(), 1);
        assert!(DestinationList::from_config(&[cfg("https://b.example/f", false)]).is_err());
    }

    #[test]
    fn failures_and_retry() {
        let d = Destination::new("https://a.example/f", 1000, true).unwrap();
        let list = DestinationList::new(vec![d.clone()]);
        let now = Instant::now();
        assert!(list.functional_destinations());

        list.report_failure_at(&d, now);
        list.report_failure_at(&d, now);
        assert_eq!(list.functional_at(now).len(), 1);
        list.report_failure_at(&d, now);
        assert!(list.functional_at(now).is_empty());
        assert!(list.next().is_none());

        // Retry after five minutes.
        let later = now + DELTA_SECONDS_RETRY_DESTINATION;
        assert_eq!(list.functional_at(later).len(), 1);

        // Failing again doubles the wait.
        list.report_failure_at(&d, later);
        assert!(list.functional_at(later + DELTA_SECONDS_RETRY_DESTINATION).is_empty());
        assert_eq!(
            list.functional_at(later + DELTA_SECONDS_RETRY_DESTINATION * 2)
                .len(),
            1
        );

        list.report_success(&d);
        assert!(list.functional_destinations());
        let h = lock(list.health(&d).unwrap()).clone();
        assert_eq!(h.consecutive_failures, 0);
        assert_eq!(h.attempts.len(), 5);
        assert_eq!(h.attempts.back(), Some(&true));
    }

    #[test]
    fn retry_delay_capped() {
        let mut h = Health::default();
        let mut now = Instant::now();
        for _ in 0..20 {
            h.failed(now);
            if let Some(t) = h.retry_at {
                now = t;
            }
        }
        assert_eq!(h.retry_delay, MAX_SECONDS_RETRY_DESTINATION);
        assert_eq!(h.attempts.len(), NUM_DESTINATION_ATTEMPTS_STORED);
    }

    #[test]
    fn late_failures_keep_the_delay() {
        let mut h = Health::default();
        let now = Instant::now();
        assert!(!h.failed(now));
        assert!(!h.failed(now));
        assert!(h.failed(now));
        let retry_at = h.retry_at.unwrap();

        // Attempts that were already running fail while we wait.
        for i in 1..10 {
            assert!(!h.failed(now + Duration::from_secs(i)));
        }
        assert_eq!(h.retry_delay, DELTA_SECONDS_RETRY_DESTINATION);
        assert_eq!(h.retry_at, Some(retry_at));

        // The retry itself fails: now we wait longer.
        assert!(h.failed(retry_at));
        assert_eq!(h.retry_delay, DELTA_SECONDS_RETRY_DESTINATION * 2);
        assert_eq!(h.retry_at, Some(retry_at + DELTA_SECONDS_RETRY_DESTINATION * 2));
    }
}
