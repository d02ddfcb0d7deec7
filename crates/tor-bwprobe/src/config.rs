//! Configuration for probing relays.

use derive_builder::Builder;
use serde::Deserialize;

use std::time::Duration;

use crate::{Error, Result};

/// How we time and size the requests we make over a measurement
/// circuit.
///
/// This type is immutable once constructed. To create an object of this
/// type, use [`ProbeConfigBuilder`].
#[derive(Debug, Clone, Builder, Deserialize)]
#[builder(setter(prefix = "set"))]
#[serde(default)]
pub struct ProbeConfig {
    /// How many minimum-sized requests we time to estimate latency.
    #[builder(default = "6")]
    pub(crate) num_rtts: usize,

    /// How many well-timed downloads we want per measurement.
    #[builder(default = "5")]
    pub(crate) num_downloads: usize,

    /// Size of the first download request, in bytes.
    #[builder(default = "16384")]
    pub(crate) initial_read_request: u64,

    /// Smallest request we ever make, in bytes.
    #[builder(default = "1")]
    pub(crate) min_download_size: u64,

    /// Largest request we ever make, in bytes.
    #[builder(default = "1024 * 1024 * 1024")]
    pub(crate) max_download_size: u64,

    /// Downloads quicker than this tell us almost nothing; we make the
    /// next one five times larger.
    #[builder(default = "Duration::from_secs(1)")]
    #[serde(with = "humantime_serde")]
    pub(crate) download_toofast: Duration,

    /// Shortest download we keep.
    #[builder(default = "Duration::from_secs(5)")]
    #[serde(with = "humantime_serde")]
    pub(crate) download_min: Duration,

    /// How long we want each download to take.
    #[builder(default = "Duration::from_secs(6)")]
    #[serde(with = "humantime_serde")]
    pub(crate) download_target: Duration,

    /// Downloads this long or longer are not kept, unless they were for
    /// the largest size we allow.
    #[builder(default = "Duration::from_secs(10)")]
    #[serde(with = "humantime_serde")]
    pub(crate) download_max: Duration,

    /// Timeout for every single request.
    #[builder(default = "Duration::from_secs(10)")]
    #[serde(with = "humantime_serde")]
    pub(crate) http_timeout: Duration,

    /// How much data we send when measuring by uploading.
    #[builder(default = "1536 * 1024")]
    pub(crate) upload_size: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfigBuilder::default()
            .build()
            .expect("default probe configuration is valid")
    }
}

/// The time windows that decide whether a download is kept and how big
/// the next one should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct DownloadTimes {
    /// Below this, grow the request five times.
    pub toofast: Duration,
    /// Below this, the download is too short to keep.
    pub min: Duration,
    /// What we aim for.
    pub target: Duration,
    /// At or above this, the download is too long to keep.
    pub max: Duration,
}

impl ProbeConfig {
    /// Return the download time windows.
    pub fn download_times(&self) -> DownloadTimes {
        DownloadTimes {
            toofast: self.download_toofast,
            min: self.download_min,
            target: self.download_target,
            max: self.download_max,
        }
    }

    /// Return how many latency requests we make.
    pub fn num_rtts(&self) -> usize {
        self.num_rtts
    }

    /// Return how many downloads we keep per measurement.
    pub fn num_downloads(&self) -> usize {
        self.num_downloads
    }

    /// Return the smallest request size.
    pub fn min_download_size(&self) -> u64 {
        self.min_download_size
    }

    /// Return the largest request size.
    pub fn max_download_size(&self) -> u64 {
        self.max_download_size
    }

    /// Return the per-request timeout.
    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    /// Return how much we upload when measuring by uploading.
    pub fn upload_size(&self) -> u64 {
        self.upload_size
    }

    /// Check that this configuration makes sense.
    pub fn validate(&self) -> Result<()> {
        let bad = |m: &str| Err(Error::BadConfig(m.to_string()));
        if self.min_download_size == 0 {
            return bad("min_download_size must be at least 1");
        }
        if self.max_download_size < self.min_download_size {
            return bad("max_download_size is smaller than min_download_size");
        }
        if self.num_downloads == 0 {
            return bad("num_downloads must be at least 1");
        }
        let t = self.download_times();
        if !(t.toofast <= t.min && t.min <= t.target && t.target < t.max) {
            return bad("download times must satisfy toofast <= min <= target < max");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ProbeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.num_downloads(), 5);
        assert_eq!(cfg.max_download_size(), 1 << 30);
        assert_eq!(cfg.upload_size(), 1_572_864);
        assert_eq!(cfg.download_times().target, Duration::from_secs(6));
    }

    #[test]
    fn invalid() {
        let cfg = ProbeConfigBuilder::default()
            .set_min_download_size(100)
            .set_max_download_size(10)
            .build()
            .unwrap();
        assert!(matches!(cfg.validate(), Err(Error::BadConfig(_))));

        let cfg = ProbeConfigBuilder::default()
            .set_download_min(Duration::from_secs(20))
            .build()
            .unwrap();
        assert!(cfg.validate().is_err());

        let cfg = ProbeConfigBuilder::default()
            .set_num_downloads(0)
            .build()
            .unwrap();
        assert!(cfg.validate().is_err());
    }
}
