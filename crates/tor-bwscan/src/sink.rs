//! A bounded queue that carries results away from the scanner.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::warn;

use crate::MeasurementResult;

/// The receiving end of a result queue.
pub type ResultReceiver = mpsc::Receiver<MeasurementResult>;

/// Create a result queue holding up to `capacity` results.
///
/// A result offered to a full queue is dropped if no room appears within
/// `enqueue_timeout`.
pub fn result_queue(capacity: usize, enqueue_timeout: Duration) -> (ResultSink, ResultReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ResultSink { tx, enqueue_timeout }, rx)
}

/// The sending end of a result queue.
#[derive(Clone, Debug)]
pub struct ResultSink {
    /// Where results go.
    tx: mpsc::Sender<MeasurementResult>,
    /// How long to wait for room in the queue.
    enqueue_timeout: Duration,
}

impl ResultSink {
    /// Put `result` on the queue.
    ///
    /// Return false if it was dropped.
    pub async fn offer(&self, result: MeasurementResult) -> bool {
        match self.tx.send_timeout(result, self.enqueue_timeout).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(r)) => {
                warn!(
                    "Result queue full for {:?}; dropping result for {}",
                    self.enqueue_timeout,
                    r.fingerprint()
                );
                false
            }
            Err(SendTimeoutError::Closed(r)) => {
                warn!(
                    "Result queue closed; dropping result for {}",
                    r.fingerprint()
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::{MeasurementError, Outcome};
    use tor_relaylist::testnet;

    fn result() -> MeasurementResult {
        let target = testnet::relay(testnet::default_relays().remove(1));
        MeasurementResult::new(
            &target,
            &[],
            None,
            "s",
            Outcome::Failure(MeasurementError::NoHelperAvailable),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn drops_when_full() {
        let (sink, mut rx) = result_queue(1, Duration::from_secs(3));
        assert!(sink.offer(result()).await);
        // Full: this one waits 3 seconds and is dropped.
        assert!(!sink.offer(result()).await);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!sink.offer(result()).await);
    }
}
