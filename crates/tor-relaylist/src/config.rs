//! Configuration for a relay list.

use derive_builder::Builder;
use serde::Deserialize;

use std::time::Duration;

use crate::HistoryLimits;

/// Configuration for how a [`RelayList`](crate::RelayList) refreshes
/// itself and how much history it keeps.
///
/// This type is immutable once constructed. To create an object of this
/// type, use [`RelayListConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct RelayListConfig {
    /// How long a consensus snapshot is used before we look for a new
    /// one.
    #[builder(default = "Duration::from_secs(60 * 60)")]
    #[serde(with = "humantime_serde")]
    pub(crate) refresh_interval: Duration,

    /// How long we remember when relays were seen and measured.
    #[builder(default = "Duration::from_secs(5 * 24 * 60 * 60)")]
    #[serde(with = "humantime_serde")]
    pub(crate) data_period: Duration,

    /// How many consensus appearances we remember, for the network and
    /// for each relay.
    #[builder(default = "120")]
    pub(crate) max_recent_consensus_count: usize,

    /// How many times we remember a relay being selected for measurement.
    #[builder(default = "120")]
    pub(crate) max_recent_priority_list_count: usize,

    /// How many measurement attempts we remember for the whole network.
    #[builder(default = "48000")]
    pub(crate) max_recent_priority_relay_count: usize,

    /// True if we are scanning a private testing network.
    ///
    /// Testing networks are small, so congestion control is assumed and
    /// exit requirements are relaxed.
    #[builder(default)]
    pub(crate) testing_network: bool,
}

impl Default for RelayListConfig {
    fn default() -> Self {
        RelayListConfigBuilder::default()
            .build()
            .expect("default relay list configuration is valid")
    }
}

impl RelayListConfig {
    /// Return the history limits described by this configuration.
    pub fn history_limits(&self) -> HistoryLimits {
        HistoryLimits {
            period: self.data_period,
            max_consensus_count: self.max_recent_consensus_count,
            max_priority_list_count: self.max_recent_priority_list_count,
            max_priority_relay_count: self.max_recent_priority_relay_count,
        }
    }

    /// Return true if this configuration is for a testing network.
    pub fn testing_network(&self) -> bool {
        self.testing_network
    }

    /// Return how often the relay list should be refreshed.
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }
}
