//! A cooperative shutdown signal shared by the scanner and its tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tor_bwprobe::StopCheck;

/// A handle used to ask every part of the scanner to stop.
///
/// Cloning gives another handle to the same signal.  Once triggered, the
/// signal stays set.
#[derive(Clone, Debug)]
pub struct ShutdownController {
    /// Shared state.
    inner: Arc<Inner>,
}

/// State shared among the clones of a [`ShutdownController`].
#[derive(Debug)]
struct Inner {
    /// Set once shutdown has begun.
    flag: AtomicBool,
    /// Wakes up anybody in [`ShutdownController::wait`].
    tx: watch::Sender<bool>,
    /// Kept so that the sender always has a receiver.
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownController {
    /// Return a new, untriggered, shutdown signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        ShutdownController {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                tx,
                rx,
            }),
        }
    }

    /// Begin shutting down.
    ///
    /// Return true if this call is the one that started the shutdown.
    pub fn trigger(&self) -> bool {
        if self.inner.flag.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Can't fail: we hold a receiver.
        let _ = self.inner.tx.send(true);
        true
    }

    /// Return true if shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Wait until shutdown begins.
    pub async fn wait(&self) {
        let mut rx = self.inner.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl StopCheck for ShutdownController {
    fn should_stop(&self) -> bool {
        self.is_shutting_down()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::time::Duration;

    #[test]
    fn trigger_once() {
        let s = ShutdownController::new();
        let s2 = s.clone();
        assert!(!s.is_shutting_down());
        assert!(!s2.should_stop());
        assert!(s2.trigger());
        assert!(!s.trigger());
        assert!(s.is_shutting_down());
        assert!(s2.should_stop());
    }

    #[tokio::test(start_paused = true)]
    async fn wait() {
        let s = ShutdownController::new();
        let s2 = s.clone();
        let done = Arc::new(AtomicBool::new(false));
        let done2 = Arc::clone(&done);
        let waiter = tokio::spawn(async move {
            s2.wait().await;
            done2.store(true, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!done.load(Ordering::SeqCst));
        s.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(done.load(Ordering::SeqCst));

        // Waiting after the fact returns at once.
        s.wait().await;
    }
}
