//! Write results to disk as JSON lines, one file per UTC day.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{Error, MeasurementResult, Result, ResultReceiver};

/// A directory of result files.
///
/// A result finished on a given UTC day is appended to `YYYY-MM-DD.txt`.
#[derive(Debug, Clone)]
pub struct ResultDump {
    /// Where the files go.
    dir: PathBuf,
}

impl ResultDump {
    /// Use `dir` for result files, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(ResultDump { dir })
    }

    /// Return the file that results finished at `when` go to.
    pub fn file_for(&self, when: SystemTime) -> PathBuf {
        let day = DateTime::<Utc>::from(when).format("%Y-%m-%d");
        self.dir.join(format!("{}.txt", day))
    }

    /// Append `result` to its file.
    pub async fn write(&self, result: &MeasurementResult) -> Result<()> {
        let mut line = serde_json::to_string(result).map_err(|e| Error::Json(Arc::new(e)))?;
        line.push('\n');
        let mut f = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(result.time()))
            .await?;
        f.write_all(line.as_bytes()).await?;
        f.flush().await?;
        Ok(())
    }

    /// Write every result from `rx` until its senders are gone.
    ///
    /// Return how many results were written.
    pub async fn run(self, mut rx: ResultReceiver) -> usize {
        let mut n = 0;
        while let Some(result) = rx.recv().await {
            match self.write(&result).await {
                Ok(()) => n += 1,
                Err(e) => warn!("Unable to write result for {}: {}", result.fingerprint(), e),
            }
        }
        debug!("Result writer done after {} results", n);
        n
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{result_queue, MeasurementError, Outcome};
    use std::time::{Duration, UNIX_EPOCH};
    use tor_relaylist::testnet;

    #[test]
    fn daily_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let dump = ResultDump::new(dir.path().join("results")).unwrap();
        // 2020-09-13 12:26:40 UTC
        let t = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        assert_eq!(
            dump.file_for(t),
            dir.path().join("results").join("2020-09-13.txt")
        );
        assert_eq!(
            dump.file_for(t + Duration::from_secs(12 * 60 * 60)),
            dir.path().join("results").join("2020-09-14.txt")
        );
    }

    #[tokio::test]
    async fn writes_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let dump = ResultDump::new(dir.path()).unwrap();
        let (sink, rx) = result_queue(4, Duration::from_secs(1));
        let target = testnet::relay(testnet::default_relays().remove(2));
        for _ in 0..3 {
            let r = MeasurementResult::new(
                &target,
                &[],
                None,
                "s",
                Outcome::Failure(MeasurementError::NoHelperAvailable),
            );
            assert!(sink.offer(r).await);
        }
        drop(sink);
        let file = dump.file_for(SystemTime::now());
        assert_eq!(dump.run(rx).await, 3);

        let text = std::fs::read_to_string(file).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let v: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["nickname"], "relay2");
        assert_eq!(v["outcome"]["error"], "no-helper-available");
    }
}
