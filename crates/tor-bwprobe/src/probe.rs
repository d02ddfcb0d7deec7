//! Latency and throughput probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::{
    random_range, ByteRange, CircId, Destination, DownloadSample, DownloadTimes, Error,
    ProbeConfig, RangeStream, Result, Transfer, TransferError,
};

/// Something that tells a running probe to give up early.
pub trait StopCheck: Send + Sync {
    /// Return true if probing should stop.
    fn should_stop(&self) -> bool;
}

impl StopCheck for AtomicBool {
    fn should_stop(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

/// Return true if a download that took `elapsed` tells us something
/// useful about the relay.
///
/// Downloads must take at least `min` and less than `max`, unless we
/// already asked for as much as we ever ask for: then anything quicker
/// than `max` will do, since we can't make the download any longer.
pub fn should_keep_result(did_request_maximum: bool, elapsed: Duration, times: &DownloadTimes) -> bool {
    if did_request_maximum {
        elapsed < times.max
    } else {
        times.min <= elapsed && elapsed < times.max
    }
}

/// Return how many bytes to ask for next, given that asking for
/// `expected` bytes took `elapsed`.
///
/// Much too quick: five times as much.  Outside the window we keep:
/// scale towards taking `target`.  Otherwise: the same again.  The result
/// is always within `[min_dl, max_dl]`.
pub fn next_expected_amount(
    expected: u64,
    elapsed: Duration,
    times: &DownloadTimes,
    min_dl: u64,
    max_dl: u64,
) -> u64 {
    let next = if elapsed < times.toofast {
        expected.saturating_mul(5)
    } else if elapsed < times.min || elapsed >= times.max {
        // float-to-int casts saturate
        (expected as f64 * times.target.as_secs_f64() / elapsed.as_secs_f64()) as u64
    } else {
        expected
    };
    next.clamp(min_dl, max_dl)
}

/// Fetch `range` over `stream`, giving up after `limit`.
async fn timed_get(
    stream: &mut dyn RangeStream,
    range: ByteRange,
    limit: Duration,
) -> std::result::Result<Duration, TransferError> {
    let start = Instant::now();
    match timeout(limit, stream.get_range(range)).await {
        Ok(Ok(())) => Ok(start.elapsed()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(TransferError::Timeout),
    }
}

/// Check that a destination's file can serve requests of `wanted` bytes.
fn check_length(content_length: u64, wanted: u64) -> Result<()> {
    if content_length < wanted {
        Err(Error::DestinationTooSmall {
            content_length,
            wanted,
        })
    } else {
        Ok(())
    }
}

/// Time `num_rtts` minimum-sized requests over `stream`.
///
/// The first failing request ends the probe with its error.
pub async fn measure_rtt(
    stream: &mut dyn RangeStream,
    cfg: &ProbeConfig,
    content_length: u64,
) -> Result<Vec<Duration>> {
    check_length(content_length, cfg.min_download_size)?;
    let mut rtts = Vec::with_capacity(cfg.num_rtts);
    for _ in 0..cfg.num_rtts {
        let range = random_range(&mut rand::thread_rng(), content_length, cfg.min_download_size);
        let rtt = timed_get(stream, range, cfg.http_timeout).await?;
        trace!("RTT sample: {:?}", rtt);
        rtts.push(rtt);
    }
    Ok(rtts)
}

/// Download ranges of adaptive size over `stream` until we have
/// `num_downloads` downloads worth keeping.
///
/// We stop early, with whatever we have, if `stop` says so; if we have
/// nothing at that point, the probe was interrupted.  The first failing
/// request ends the probe with its error.
pub async fn measure_bandwidth(
    stream: &mut dyn RangeStream,
    cfg: &ProbeConfig,
    content_length: u64,
    stop: &dyn StopCheck,
) -> Result<Vec<DownloadSample>> {
    let times = cfg.download_times();
    let max_dl = cfg.max_download_size.min(content_length);
    let min_dl = cfg.min_download_size.min(max_dl);
    check_length(content_length, min_dl.max(1))?;
    let mut expected = cfg.initial_read_request.clamp(min_dl, max_dl);
    let mut samples = Vec::with_capacity(cfg.num_downloads);

    while samples.len() < cfg.num_downloads {
        if stop.should_stop() {
            debug!("Stopping bandwidth probe after {} samples.", samples.len());
            break;
        }
        debug_assert!(min_dl <= expected && expected <= max_dl);
        let range = random_range(&mut rand::thread_rng(), content_length, expected);
        let elapsed = timed_get(stream, range, cfg.http_timeout).await?;
        let did_request_maximum = expected >= max_dl;
        if should_keep_result(did_request_maximum, elapsed, &times) {
            samples.push(DownloadSample::new(expected, elapsed));
        }
        trace!(
            "Downloaded {} bytes in {:?}; kept {} of {}",
            expected,
            elapsed,
            samples.len(),
            cfg.num_downloads
        );
        expected = next_expected_amount(expected, elapsed, &times, min_dl, max_dl);
    }

    if samples.is_empty() {
        return Err(Error::Interrupted);
    }
    Ok(samples)
}

/// Measure by uploading `upload_size` bytes to `dest` over `circ`.
pub async fn measure_upload(
    transfer: &dyn Transfer,
    circ: CircId,
    dest: &Destination,
    cfg: &ProbeConfig,
) -> Result<DownloadSample> {
    let sample = timeout(
        cfg.http_timeout,
        transfer.upload(circ, dest, cfg.upload_size),
    )
    .await
    .map_err(|_| TransferError::Timeout)??;
    debug!(
        "Uploaded {} bytes in {:?}",
        sample.amount(),
        sample.duration()
    );
    Ok(sample)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::ProbeConfigBuilder;
    use async_trait::async_trait;
    use std::sync::Arc;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    fn times(toofast: f64, min: f64, target: f64, max: f64) -> DownloadTimes {
        DownloadTimes {
            toofast: secs(toofast),
            min: secs(min),
            target: secs(target),
            max: secs(max),
        }
    }

    #[test]
    fn keep_result() {
        let t = times(0.5, 1.0, 3.0, 5.0);
        assert!(should_keep_result(false, secs(3.0), &t));
        assert!(!should_keep_result(false, secs(0.5), &t));
        assert!(should_keep_result(true, secs(4.9), &t));
        assert!(!should_keep_result(true, secs(5.1), &t));
        assert!(should_keep_result(true, secs(0.1), &t));
        assert!(!should_keep_result(false, secs(5.0), &t));
        assert!(should_keep_result(false, secs(1.0), &t));
    }

    #[test]
    fn next_amount() {
        let t = times(0.1, 1.0, 3.0, 5.0);
        assert_eq!(next_expected_amount(1000, secs(0.05), &t, 1, 1 << 30), 5000);
        let t = times(0.1, 1.0, 3.0, 5.0);
        assert_eq!(next_expected_amount(1000, secs(0.5), &t, 1, 1 << 30), 6000);
        // Too slow: shrink.
        assert_eq!(next_expected_amount(1000, secs(6.0), &t, 1, 1 << 30), 500);
        // In the window: unchanged.
        assert_eq!(next_expected_amount(1000, secs(2.0), &t, 1, 1 << 30), 1000);
        // Clamped.
        assert_eq!(next_expected_amount(1000, secs(0.05), &t, 1, 4000), 4000);
        assert_eq!(next_expected_amount(1000, secs(60.0), &t, 100, 4000), 100);
    }

    /// A stream that takes a fixed time per byte, on tokio's clock.
    struct FakeStream {
        /// Time per kilobyte.
        per_kb: Duration,
        /// Fixed latency per request.
        latency: Duration,
        /// Requests made so far.
        requests: Vec<ByteRange>,
        /// Fail after this many requests.
        fail_after: Option<usize>,
        /// Set this flag after this many requests.
        stop_after: Option<(usize, Arc<AtomicBool>)>,
    }

    impl FakeStream {
        fn new(per_kb: Duration) -> Self {
            FakeStream {
                per_kb,
                latency: Duration::from_millis(50),
                requests: Vec::new(),
                fail_after: None,
                stop_after: None,
            }
        }
    }

    #[async_trait]
    impl RangeStream for FakeStream {
        async fn get_range(&mut self, range: ByteRange) -> std::result::Result<(), TransferError> {
            if self.fail_after == Some(self.requests.len()) {
                return Err(TransferError::BadResponse("fake".into()));
            }
            self.requests.push(range);
            if let Some((n, flag)) = &self.stop_after {
                if self.requests.len() >= *n {
                    flag.store(true, Ordering::SeqCst);
                }
            }
            let t = self.latency + self.per_kb.mul_f64(range.len() as f64 / 1000.0);
            tokio::time::sleep(t).await;
            Ok(())
        }
    }

    fn cfg() -> ProbeConfig {
        ProbeConfigBuilder::default()
            .set_num_rtts(3)
            .set_min_download_size(1)
            .set_max_download_size(100_000_000)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn rtt() {
        let mut s = FakeStream::new(Duration::from_millis(1));
        let rtts = measure_rtt(&mut s, &cfg(), 1 << 30).await.unwrap();
        assert_eq!(rtts.len(), 3);
        assert!(s.requests.iter().all(|r| r.len() == 1));
        for rtt in rtts {
            assert!(rtt >= Duration::from_millis(50));
            assert!(rtt < Duration::from_millis(60));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rtt_failure() {
        let mut s = FakeStream::new(Duration::from_millis(1));
        s.fail_after = Some(1);
        let err = measure_rtt(&mut s, &cfg(), 1 << 30).await.unwrap_err();
        assert!(matches!(err, Error::Transfer(TransferError::BadResponse(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_converges() {
        // 1 MB/s: a 6 second download is about 6 MB.
        let mut s = FakeStream::new(Duration::from_millis(1));
        let stop = AtomicBool::new(false);
        let samples = measure_bandwidth(&mut s, &cfg(), 1 << 30, &stop)
            .await
            .unwrap();
        assert_eq!(samples.len(), 5);
        let t = cfg().download_times();
        for sample in &samples {
            assert!(sample.duration() >= t.min);
            assert!(sample.duration() < t.max);
            let bw = sample.bandwidth();
            assert!(bw > 900_000.0 && bw < 1_000_000.0);
        }
        // The first request was the initial size; it grew from there.
        assert_eq!(s.requests[0].len(), 16384);
        assert!(s.requests.len() > 5);
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_at_maximum() {
        // Very fast: even the largest request is quicker than download_min.
        let mut s = FakeStream::new(Duration::from_micros(1));
        let cfg = ProbeConfigBuilder::default()
            .set_max_download_size(1_000_000)
            .build()
            .unwrap();
        let stop = AtomicBool::new(false);
        let samples = measure_bandwidth(&mut s, &cfg, 1 << 30, &stop)
            .await
            .unwrap();
        assert_eq!(samples.len(), 5);
        assert!(samples.iter().all(|s| s.amount() == 1_000_000));
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_stops() {
        let flag = Arc::new(AtomicBool::new(false));
        let mut s = FakeStream::new(Duration::from_millis(1));
        s.stop_after = Some((1, Arc::clone(&flag)));
        let err = measure_bandwidth(&mut s, &cfg(), 1 << 30, flag.as_ref())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
        assert_eq!(s.requests.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bandwidth_timeout() {
        // 10 seconds per kilobyte: the first request times out.
        let mut s = FakeStream::new(Duration::from_secs(10));
        let stop = AtomicBool::new(false);
        let err = measure_bandwidth(&mut s, &cfg(), 1 << 30, &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transfer(TransferError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn small_file() {
        let mut s = FakeStream::new(Duration::from_millis(1));
        let stop = AtomicBool::new(false);
        // The file is smaller than the initial request; we never ask for
        // more than it holds.
        let samples = measure_bandwidth(&mut s, &cfg(), 8000, &stop).await.unwrap();
        assert!(samples.iter().all(|s| s.amount() <= 8000));
        assert!(s.requests.iter().all(|r| r.end() < 8000));
    }
}
