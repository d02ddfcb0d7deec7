//! The relay list: an atomically swappable snapshot of the relays we
//! measure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::lock::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::{
    Consensus, Fingerprint, HistoryLimits, NetParameters, Relay, RelayFlags, RelayHistory,
    RelayListConfig, Result, SavedHistory, TimestampSeq,
};

/// Somewhere to get consensus documents from.
///
/// Usually this is a Tor client's cached consensus; in tests it is a
/// canned document.
#[async_trait]
pub trait ConsensusSource: Send + Sync {
    /// Fetch the most recent consensus.
    async fn fetch(&self) -> Result<Consensus>;
}

/// An immutable snapshot of the relay population.
///
/// Everything derived from the consensus (the relays, the network
/// parameters, the bandwidth thresholds) is computed once when the
/// snapshot is built, so readers always see values that belong together.
#[derive(Debug, Clone)]
pub struct RelaySet {
    /// The relays, in consensus order.
    relays: Vec<Relay>,
    /// Index into `relays` by fingerprint.
    by_fp: HashMap<Fingerprint, usize>,
    /// Network parameters.
    params: NetParameters,
    /// When the consensus became valid.
    valid_after: Option<SystemTime>,
    /// When this snapshot was installed.
    installed_at: Option<SystemTime>,
    /// Minimum bandwidth of a helper used as exit.
    exit_min_bw: u64,
    /// Minimum bandwidth of a helper used as entry.
    non_exit_min_bw: u64,
    /// True for a private testing network.
    testing_network: bool,
}

/// Return the bandwidth at the first quartile of `bws`, or 0 if empty.
fn quartile_bandwidth(mut bws: Vec<u64>) -> u64 {
    bws.sort_unstable();
    bws.get(bws.len() / 4).copied().unwrap_or(0)
}

impl RelaySet {
    /// Return an empty relay set, as used before the first consensus.
    pub fn empty(testing_network: bool) -> Self {
        RelaySet::from_relays(Vec::new(), NetParameters::default(), None, None, testing_network)
    }

    /// Build a relay set, computing everything derived from its relays.
    pub(crate) fn from_relays(
        relays: Vec<Relay>,
        params: NetParameters,
        valid_after: Option<SystemTime>,
        installed_at: Option<SystemTime>,
        testing_network: bool,
    ) -> Self {
        let by_fp = relays
            .iter()
            .enumerate()
            .map(|(i, r)| (*r.fingerprint(), i))
            .collect();
        // Bad exits count as exits here: they still carry exit weight.
        let (exits, non_exits): (Vec<_>, Vec<_>) =
            relays.iter().partition(|r| r.has_flag(RelayFlags::EXIT));
        let exit_min_bw = quartile_bandwidth(exits.iter().map(|r| r.consensus_bandwidth()).collect());
        let non_exit_min_bw =
            quartile_bandwidth(non_exits.iter().map(|r| r.consensus_bandwidth()).collect());
        let params = if testing_network {
            NetParameters::testing_network()
        } else {
            params
        };
        RelaySet {
            relays,
            by_fp,
            params,
            valid_after,
            installed_at,
            exit_min_bw,
            non_exit_min_bw,
            testing_network,
        }
    }

    /// Return all the relays.
    pub fn relays(&self) -> &[Relay] {
        &self.relays[..]
    }
    /// Return the number of relays.
    pub fn len(&self) -> usize {
        self.relays.len()
    }
    /// Return true if there are no relays.
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }
    /// Return the relay with fingerprint `fp`, if listed.
    pub fn by_fingerprint(&self, fp: &Fingerprint) -> Option<&Relay> {
        self.by_fp.get(fp).map(|i| &self.relays[*i])
    }
    /// Return the fingerprints of all the relays.
    pub fn fingerprints(&self) -> Vec<Fingerprint> {
        self.relays.iter().map(|r| *r.fingerprint()).collect()
    }
    /// Return the network parameters.
    pub fn params(&self) -> &NetParameters {
        &self.params
    }
    /// Return when the consensus became valid, if we have one.
    pub fn valid_after(&self) -> Option<SystemTime> {
        self.valid_after
    }
    /// Return when this snapshot was installed, if ever.
    pub fn installed_at(&self) -> Option<SystemTime> {
        self.installed_at
    }
    /// Return true if this is a private testing network.
    pub fn testing_network(&self) -> bool {
        self.testing_network
    }

    /// Return the minimum bandwidth a helper must have to be used as exit.
    pub fn exit_min_bw(&self) -> u64 {
        self.exit_min_bw
    }
    /// Return the minimum bandwidth a helper must have to be used as entry.
    pub fn non_exit_min_bw(&self) -> u64 {
        self.non_exit_min_bw
    }

    /// Return the relays that match `pred`.
    fn filter(&self, pred: impl Fn(&Relay) -> bool) -> Vec<Relay> {
        self.relays.iter().filter(|r| pred(r)).cloned().collect()
    }

    /// Return the relays that have every flag in `flags`.
    pub fn with_flag(&self, flags: RelayFlags) -> Vec<Relay> {
        self.filter(|r| r.has_flag(flags))
    }
    /// Return the relays that lack every flag in `flags`.
    pub fn without_flag(&self, flags: RelayFlags) -> Vec<Relay> {
        self.filter(|r| !r.flags().intersects(flags))
    }
    /// Return the relays with the Exit flag, bad exits included.
    pub fn exits(&self) -> Vec<Relay> {
        self.with_flag(RelayFlags::EXIT)
    }
    /// Return the relays without the Exit flag.
    pub fn non_exits(&self) -> Vec<Relay> {
        self.without_flag(RelayFlags::EXIT)
    }
    /// Return the relays with the BadExit flag.
    pub fn bad_exits(&self) -> Vec<Relay> {
        self.with_flag(RelayFlags::BAD_EXIT)
    }
    /// Return the relays with the Guard flag.
    pub fn guards(&self) -> Vec<Relay> {
        self.with_flag(RelayFlags::GUARD)
    }
    /// Return the relays with the Fast flag.
    pub fn fast(&self) -> Vec<Relay> {
        self.with_flag(RelayFlags::FAST)
    }
    /// Return the directory authorities.
    pub fn authorities(&self) -> Vec<Relay> {
        self.with_flag(RelayFlags::AUTHORITY)
    }

    /// Return the relays advertising version `v` of FlowCtrl.
    pub fn relays_with_flowctrl(&self, v: u32) -> Vec<Relay> {
        self.filter(|r| r.supports_flowctrl(v))
    }

    /// Return the exits, not bad, that can exit to `port`.
    pub fn exits_not_bad_allowing_port(&self, port: u16, strict: bool) -> Vec<Relay> {
        self.filter(|r| r.is_exit_not_bad_allowing_port(port, strict))
    }

    /// Return the exits, not bad, that can exit to `port` and support
    /// congestion control.
    ///
    /// Testing networks may have no relay that can exit to `port`; there
    /// we fall back to every exit that supports congestion control.
    pub fn exits_with_flowctrl2(&self, port: u16) -> Vec<Relay> {
        let exits = self.filter(|r| r.is_exit_not_bad_allowing_port(port, false) && r.has_2_in_flowctrl());
        if exits.is_empty() && self.testing_network {
            self.filter(|r| r.has_flag(RelayFlags::EXIT) && r.has_2_in_flowctrl())
        } else {
            exits
        }
    }

    /// Return the exits, not bad, that can exit to `port` and don't
    /// support congestion control.
    pub fn exits_without_flowctrl2(&self, port: u16) -> Vec<Relay> {
        self.filter(|r| r.is_exit_not_bad_allowing_port(port, false) && !r.has_2_in_flowctrl())
    }

    /// Return the sum of the consensus bandwidth of `relays`.
    pub fn sum_consensus_bw(relays: &[Relay]) -> u64 {
        relays.iter().map(|r| r.consensus_bandwidth()).sum()
    }
}

/// The current relay population, refreshed from a [`ConsensusSource`].
///
/// Readers never block: [`RelayList::current`] returns the installed
/// snapshot.  Refreshing builds a complete new snapshot and swaps it in;
/// only one refresh runs at a time, and a caller that waited for another
/// caller's refresh uses that result.
pub struct RelayList {
    /// The installed snapshot.
    current: ArcSwap<RelaySet>,
    /// Held while refreshing.
    refresh_lock: AsyncMutex<()>,
    /// Where consensuses come from.
    source: Arc<dyn ConsensusSource>,
    /// Configuration.
    config: RelayListConfig,
    /// History limits derived from the configuration.
    limits: HistoryLimits,
    /// Valid-after times of recent consensuses.
    recent_consensus: Mutex<TimestampSeq>,
    /// Times of recent measurement attempts on any relay.
    recent_measurement_attempt: Mutex<TimestampSeq>,
    /// Histories restored from saved state, waiting for their relay to
    /// show up in a consensus.
    restored: Mutex<HashMap<Fingerprint, Arc<RelayHistory>>>,
}

/// Lock `m`, tolerating poison.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl RelayList {
    /// Make a new relay list with no relays.  Call
    /// [`RelayList::refresh`] to load the first consensus.
    pub fn new(source: Arc<dyn ConsensusSource>, config: RelayListConfig) -> Self {
        let limits = config.history_limits();
        RelayList {
            current: ArcSwap::from_pointee(RelaySet::empty(config.testing_network())),
            refresh_lock: AsyncMutex::new(()),
            source,
            recent_consensus: Mutex::new(TimestampSeq::new(
                limits.max_consensus_count,
                limits.period,
            )),
            recent_measurement_attempt: Mutex::new(TimestampSeq::new(
                limits.max_priority_relay_count,
                limits.period,
            )),
            restored: Mutex::new(HashMap::new()),
            limits,
            config,
        }
    }

    /// Make a relay list and restore histories from `saved`.
    ///
    /// Relay entries with malformed fingerprints are ignored.
    pub fn with_saved_history(
        source: Arc<dyn ConsensusSource>,
        config: RelayListConfig,
        saved: &SavedHistory,
    ) -> Self {
        let list = RelayList::new(source, config);
        lock(&list.recent_consensus).extend_unix_secs(&saved.recent_consensus);
        lock(&list.recent_measurement_attempt).extend_unix_secs(&saved.recent_measurement_attempt);
        let mut restored = lock(&list.restored);
        for (fp, h) in &saved.relays {
            match fp.parse::<Fingerprint>() {
                Ok(fp) => {
                    restored.insert(fp, Arc::new(RelayHistory::restore(h, &list.limits)));
                }
                Err(e) => warn!("Ignoring saved history: {}", e),
            }
        }
        drop(restored);
        list
    }

    /// Return the installed snapshot, without refreshing.
    pub fn current(&self) -> Arc<RelaySet> {
        self.current.load_full()
    }

    /// Return true if the installed snapshot is too old to use.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(SystemTime::now())
    }

    /// As [`RelayList::needs_refresh`], at time `now`.
    pub fn needs_refresh_at(&self, now: SystemTime) -> bool {
        match self.current.load().installed_at() {
            None => true,
            Some(t) => match now.duration_since(t) {
                Ok(age) => age >= self.config.refresh_interval(),
                Err(_) => false,
            },
        }
    }

    /// Return the current snapshot, refreshing it first if it is stale.
    ///
    /// If a refresh is needed and fails, the stale snapshot is returned
    /// with a warning, unless there is none.
    pub async fn relays(&self) -> Result<Arc<RelaySet>> {
        if !self.needs_refresh() {
            return Ok(self.current());
        }
        let _guard = self.refresh_lock.lock().await;
        // Somebody else may have refreshed while we waited.
        if !self.needs_refresh() {
            return Ok(self.current());
        }
        match self.refresh_locked().await {
            Ok(set) => Ok(set),
            Err(e) if self.current.load().installed_at().is_some() => {
                warn!("Unable to refresh relay list; using the old one: {}", e);
                Ok(self.current())
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a new consensus and install it.
    ///
    /// If another refresh is already running, wait for it and return its
    /// snapshot instead of fetching again.
    pub async fn refresh(&self) -> Result<Arc<RelaySet>> {
        let before = self.current();
        let _guard = self.refresh_lock.lock().await;
        let now = self.current();
        if !Arc::ptr_eq(&before, &now) {
            debug!("Relay list was refreshed while we waited.");
            return Ok(now);
        }
        self.refresh_locked().await
    }

    /// Fetch and install a consensus.  Must hold `refresh_lock`.
    async fn refresh_locked(&self) -> Result<Arc<RelaySet>> {
        let consensus = self.source.fetch().await?;
        Ok(self.install(consensus, SystemTime::now()))
    }

    /// Build a snapshot from `consensus` and swap it in.
    fn install(&self, consensus: Consensus, now: SystemTime) -> Arc<RelaySet> {
        let old = self.current();
        let (valid_after, params, routers) = consensus.into_parts();
        let mut restored = lock(&self.restored);
        let mut new_relays = 0;

        let relays: Vec<Relay> = routers
            .into_iter()
            .map(|rs| {
                let fp = *rs.fingerprint();
                let history = match old.by_fingerprint(&fp) {
                    Some(r) => Arc::clone(r.history()),
                    None => {
                        new_relays += 1;
                        restored
                            .remove(&fp)
                            .unwrap_or_else(|| Arc::new(RelayHistory::new(&self.limits)))
                    }
                };
                history.note_in_consensus(valid_after);
                Relay::new(Arc::new(rs), history)
            })
            .collect();
        drop(restored);

        lock(&self.recent_consensus).update_at(valid_after);
        let set = Arc::new(RelaySet::from_relays(
            relays,
            params,
            Some(valid_after),
            Some(now),
            self.config.testing_network(),
        ));
        info!(
            "Installed relay list with {} relays ({} new, {} dropped); exit_min_bw={} non_exit_min_bw={}",
            set.len(),
            new_relays,
            (old.len() + new_relays).saturating_sub(set.len()),
            set.exit_min_bw(),
            set.non_exit_min_bw()
        );
        self.current.store(Arc::clone(&set));
        set
    }

    /// Note that a measurement of `relay` was attempted now.
    pub fn note_measurement_attempt(&self, relay: &Relay) {
        let now = SystemTime::now();
        relay.history().note_measurement_attempt_at(now);
        lock(&self.recent_measurement_attempt).update_at(now);
    }

    /// Return how many consensuses we have seen recently.
    pub fn recent_consensus_count(&self) -> usize {
        lock(&self.recent_consensus).len()
    }

    /// Return how many measurements were attempted recently.
    pub fn recent_measurement_attempt_count(&self) -> usize {
        lock(&self.recent_measurement_attempt).len()
    }

    /// Return how long the network-wide histories reach back.
    pub fn data_period(&self) -> Duration {
        self.limits.period
    }

    /// Return a serializable copy of every history this list keeps.
    ///
    /// Relays that were restored but never listed again are kept too.
    pub fn saved_history(&self) -> SavedHistory {
        let mut relays: std::collections::BTreeMap<_, _> = lock(&self.restored)
            .iter()
            .map(|(fp, h)| (fp.to_string(), h.save()))
            .collect();
        for r in self.current().relays() {
            relays.insert(r.fingerprint().to_string(), r.history().save());
        }
        SavedHistory {
            recent_consensus: lock(&self.recent_consensus).to_unix_secs(),
            recent_measurement_attempt: lock(&self.recent_measurement_attempt).to_unix_secs(),
            relays,
        }
    }
}

impl std::fmt::Debug for RelayList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayList")
            .field("relays", &self.current.load().len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::testnet::{self, FakeSource};
    use std::sync::atomic::Ordering;

    #[test]
    fn quartiles() {
        assert_eq!(quartile_bandwidth(vec![]), 0);
        assert_eq!(quartile_bandwidth(vec![7]), 7);
        assert_eq!(quartile_bandwidth(vec![40, 10, 30, 20]), 20);
        assert_eq!(
            quartile_bandwidth((1..=10).rev().map(|x| x * 100).collect()),
            300
        );
    }

    #[test]
    fn queries() {
        let set = testnet::construct_relay_set(testnet::default_relays(), NetParameters::default());
        assert_eq!(set.len(), 20);
        assert_eq!(set.exits().len(), 10);
        assert_eq!(set.non_exits().len(), 10);
        assert_eq!(set.exit_min_bw(), 300_000);
        assert_eq!(set.non_exit_min_bw(), 300_000);
        assert_eq!(set.bad_exits().len(), 1);
        assert_eq!(set.exits_not_bad_allowing_port(443, false).len(), 9);
        assert_eq!(set.exits_not_bad_allowing_port(80, false).len(), 0);
        assert_eq!(
            set.exits_with_flowctrl2(443).len() + set.exits_without_flowctrl2(443).len(),
            9
        );
        assert_eq!(set.relays_with_flowctrl(2).len(), 10);
        let fp = set.relays()[3].fingerprint();
        assert_eq!(set.by_fingerprint(fp).unwrap().fingerprint(), fp);
        assert_eq!(
            RelaySet::sum_consensus_bw(&set.exits()),
            (1..=10).map(|x| x * 100_000).sum::<u64>()
        );
    }

    #[test]
    fn testing_network_fallback() {
        // No relay can exit to port 80, but a testing network still finds
        // congestion-control exits.
        let set = testnet::construct_relay_set(testnet::default_relays(), NetParameters::default());
        assert!(set.exits_with_flowctrl2(80).is_empty());
        let set = testnet::construct_testing_relay_set(testnet::default_relays());
        assert!(!set.exits_with_flowctrl2(80).is_empty());
        assert!(set.params().congestion_control_enabled());
    }

    #[tokio::test]
    async fn history_survives_refresh() {
        let source = Arc::new(FakeSource::new(testnet::default_consensus()));
        let list = RelayList::new(source.clone(), RelayListConfig::default());
        assert!(list.needs_refresh());
        let set = list.refresh().await.unwrap();
        assert!(!list.needs_refresh());
        let r = set.relays()[0].clone();
        list.note_measurement_attempt(&r);
        r.history().note_priority();

        // The next consensus drops the last relay.
        let mut next = testnet::default_relays();
        next.pop();
        source.set(testnet::consensus_from(next, 3600));
        let set2 = list.refresh().await.unwrap();
        assert_eq!(set2.len(), 19);
        let r2 = set2.by_fingerprint(r.fingerprint()).unwrap();
        assert_eq!(r2.history().attempt_count(), 1);
        assert_eq!(r2.history().priority_count(), 1);
        assert_eq!(r2.history().consensus_count(), 2);
        assert!(Arc::ptr_eq(r.history(), r2.history()));
        assert_eq!(list.recent_consensus_count(), 2);
        assert_eq!(list.recent_measurement_attempt_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_refresh_applied_once() {
        let source = Arc::new(FakeSource::new(testnet::default_consensus()));
        let list = RelayList::new(source.clone(), RelayListConfig::default());
        let (a, b) = futures::join!(list.refresh(), list.refresh());
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        // Nothing is stale now, so reading doesn't fetch.
        let _ = list.relays().await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lazy_refresh() {
        let source = Arc::new(FakeSource::new(testnet::default_consensus()));
        let list = RelayList::new(source.clone(), RelayListConfig::default());
        let set = list.relays().await.unwrap();
        assert_eq!(set.len(), 20);
        let later = SystemTime::now() + Duration::from_secs(3601);
        assert!(list.needs_refresh_at(later));
        assert!(!list.needs_refresh_at(SystemTime::now()));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_old() {
        let source = Arc::new(FakeSource::new(testnet::default_consensus()));
        let list = RelayList::new(source.clone(), RelayListConfig::default());
        source.fail(true);
        assert!(list.relays().await.is_err());
        source.fail(false);
        let set = list.refresh().await.unwrap();
        source.fail(true);
        assert!(list.refresh().await.is_err());
        assert!(Arc::ptr_eq(&set, &list.current()));
    }

    #[tokio::test]
    async fn saved_history() {
        let source = Arc::new(FakeSource::new(testnet::default_consensus()));
        let list = RelayList::new(source.clone(), RelayListConfig::default());
        let set = list.refresh().await.unwrap();
        list.note_measurement_attempt(&set.relays()[5]);
        let saved = list.saved_history();
        assert_eq!(saved.relays.len(), 20);
        assert_eq!(saved.recent_consensus.len(), 1);

        let list2 = RelayList::with_saved_history(source, RelayListConfig::default(), &saved);
        assert_eq!(list2.recent_consensus_count(), 1);
        let set2 = list2.refresh().await.unwrap();
        let fp = set.relays()[5].fingerprint();
        assert_eq!(set2.by_fingerprint(fp).unwrap().history().attempt_count(), 1);
    }
}
