//! Fake relay populations, for testing code that selects and measures
//! relays.
//!
//! The default population has twenty relays.  Relays 0 through 9 are
//! exits whose policy accepts only port 443; relays 10 through 19 are
//! not.  In each half, relay `i` has a consensus bandwidth of
//! `((i % 10) + 1) * 100` kilobytes.  Relay 0 is a bad exit.  Relays with
//! an even index support FlowCtrl=2.

#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::{
    Consensus, ConsensusSource, Error, ExitPolicy, Fingerprint, HistoryLimits, NetParameters,
    Relay, RelayFlags, RelayHistory, RelaySet, Result, RouterStatus,
};

/// Return the fingerprint of relay `idx` in the default population.
pub fn fingerprint(idx: usize) -> Fingerprint {
    let mut bytes = [0_u8; 20];
    bytes[0] = 0xAA;
    bytes[19] = idx as u8;
    Fingerprint::new(bytes)
}

/// Build a single router status.
pub fn router(
    idx: usize,
    flags: RelayFlags,
    bandwidth_kb: u64,
    policy: &str,
    flowctrl: &str,
) -> RouterStatus {
    RouterStatus::builder()
        .identity(fingerprint(idx))
        .nickname(&format!("relay{}", idx))
        .set_flags(flags | RelayFlags::RUNNING | RelayFlags::VALID)
        .bandwidth_kb(bandwidth_kb)
        .exit_policy(ExitPolicy::from_summary(policy).unwrap())
        .flowctrl(flowctrl)
        .unwrap()
        .build()
        .unwrap()
}

/// Return the default population described in the module docs.
pub fn default_relays() -> Vec<RouterStatus> {
    (0..20)
        .map(|i| {
            let bw = ((i % 10) as u64 + 1) * 100;
            let flowctrl = if i % 2 == 0 { "1-2" } else { "1" };
            if i < 10 {
                let mut flags = RelayFlags::EXIT | RelayFlags::FAST;
                if i == 0 {
                    flags |= RelayFlags::BAD_EXIT;
                }
                router(i, flags, bw, "accept 443", flowctrl)
            } else {
                router(
                    i,
                    RelayFlags::FAST | RelayFlags::GUARD,
                    bw,
                    "reject 1-65535",
                    flowctrl,
                )
            }
        })
        .collect()
}

/// Return a consensus listing `routers`, valid `offset` seconds after a
/// fixed point in time.
pub fn consensus_from(routers: Vec<RouterStatus>, offset: u64) -> Consensus {
    let valid_after = UNIX_EPOCH + Duration::from_secs(1_600_000_000 + offset);
    Consensus::new(valid_after, NetParameters::default(), routers)
}

/// Return a consensus listing the default population.
pub fn default_consensus() -> Consensus {
    consensus_from(default_relays(), 0)
}

/// Wrap `rs` into a relay with an empty history.
pub fn relay(rs: RouterStatus) -> Relay {
    Relay::new(
        Arc::new(rs),
        Arc::new(RelayHistory::new(&HistoryLimits::default())),
    )
}

/// Build a relay set from `routers` and `params`.
pub fn construct_relay_set(routers: Vec<RouterStatus>, params: NetParameters) -> RelaySet {
    let relays = routers.into_iter().map(relay).collect();
    RelaySet::from_relays(relays, params, None, Some(SystemTime::now()), false)
}

/// Build a relay set for a testing network from `routers`.
pub fn construct_testing_relay_set(routers: Vec<RouterStatus>) -> RelaySet {
    let relays = routers.into_iter().map(relay).collect();
    RelaySet::from_relays(
        relays,
        NetParameters::default(),
        None,
        Some(SystemTime::now()),
        true,
    )
}

/// A future that returns `Pending` once before completing, so that
/// other futures get a chance to run.
#[derive(Debug, Default)]
struct YieldOnce(bool);

impl Future for YieldOnce {
    type Output = ();
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            Poll::Ready(())
        } else {
            self.0 = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// A consensus source that returns a canned consensus.
#[derive(Debug)]
pub struct FakeSource {
    /// The consensus to return.
    consensus: Mutex<Consensus>,
    /// If true, fail every fetch.
    failing: AtomicBool,
    /// How many times `fetch` was called.
    pub fetches: AtomicUsize,
}

impl FakeSource {
    /// Make a source returning `consensus`.
    pub fn new(consensus: Consensus) -> Self {
        FakeSource {
            consensus: Mutex::new(consensus),
            failing: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
        }
    }
    /// Return `consensus` from now on.
    pub fn set(&self, consensus: Consensus) {
        *self.consensus.lock().unwrap() = consensus;
    }
    /// Make every fetch fail, or stop doing so.
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsensusSource for FakeSource {
    async fn fetch(&self) -> Result<Consensus> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        YieldOnce::default().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::SourceFailed("fake failure".into()));
        }
        Ok(self.consensus.lock().unwrap().clone())
    }
}
