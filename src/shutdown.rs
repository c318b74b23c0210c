//! Cooperative cancellation shared by every station thread.
//!
//! A [`StopSignal`] is set once and never reset. Besides the flag it owns a wake channel
//! whose only sender is dropped on cancel, so any `select!` that includes
//! [`StopSignal::wake`] returns immediately instead of sleeping out its timeout.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Set-once cancellation flag with a wake channel.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    wake_tx: Mutex<Option<Sender<()>>>,
    wake_rx: Receiver<()>,
}

impl StopSignal {
    /// Create an unset signal.
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                wake_tx: Mutex::new(Some(wake_tx)),
                wake_rx,
            }),
        }
    }

    /// Fire the signal. Later calls are no-ops.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            debug!("Stop signal raised");
        }
        // A poisoned lock still lets us drop the sender.
        let mut guard = match self.inner.wake_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.take();
    }

    /// Whether the signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Sleep for up to `timeout`, returning early if the signal fires.
    ///
    /// Returns `true` when the full duration elapsed without cancellation.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.inner.wake_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => !self.is_cancelled(),
            Err(RecvTimeoutError::Disconnected) | Ok(()) => false,
        }
    }

    /// Block until the signal fires.
    pub fn wait(&self) {
        if !self.is_cancelled() {
            // Nothing is ever sent; this returns once the sender is dropped.
            let _ = self.inner.wake_rx.recv();
        }
    }

    /// Receiver that disconnects when the signal fires, for use in `select!`.
    pub fn wake(&self) -> &Receiver<()> {
        &self.inner.wake_rx
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopSignal")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn starts_unset() {
        let stop = StopSignal::new();
        assert!(!stop.is_cancelled());
        assert!(stop.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn cancel_is_visible_to_clones() {
        let stop = StopSignal::new();
        let other = stop.clone();
        stop.cancel();
        stop.cancel();
        assert!(other.is_cancelled());
        assert!(!other.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn cancel_wakes_a_sleeping_waiter() {
        let stop = StopSignal::new();
        let waiter = stop.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let completed = waiter.wait_timeout(Duration::from_secs(10));
            (completed, start.elapsed())
        });

        std::thread::sleep(Duration::from_millis(20));
        stop.cancel();

        let (completed, elapsed) = handle.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(1), "woke after {elapsed:?}");
    }

    #[test]
    fn wait_returns_after_cancel() {
        let stop = StopSignal::new();
        let canceller = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            canceller.cancel();
        });
        stop.wait();
        assert!(stop.is_cancelled());
        stop.wait();
    }
}
