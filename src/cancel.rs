//! Cooperative cancellation signaling.
//!
//! Cancellation is polled, never pushed: the coordination service backing
//! the signal is external, and every blocking wait in the scan session
//! pairs with a periodic poll. [`CancellationPoller`] caps how often the
//! underlying signal is actually consulted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Consumed interface of the external coordination service.
pub trait CancellationSignal: Send + Sync {
    /// Whether the given scan session has been cancelled.
    fn is_cancelled(&self, session_id: &str) -> bool;
}

/// Signal that never reports cancellation.
#[derive(Debug, Default)]
pub struct NeverCancelled;

impl CancellationSignal for NeverCancelled {
    fn is_cancelled(&self, _session_id: &str) -> bool {
        false
    }
}

/// In-process signal toggled by tests or an embedding host.
#[derive(Debug, Default)]
pub struct ManualCancellation {
    cancelled: AtomicBool,
}

impl ManualCancellation {
    pub fn new() -> Self {
        ManualCancellation::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl CancellationSignal for ManualCancellation {
    fn is_cancelled(&self, _session_id: &str) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Wraps a signal with an interval cap: between polls the last observed
/// answer is returned. A positive answer is sticky.
pub struct CancellationPoller {
    signal: Arc<dyn CancellationSignal>,
    session_id: String,
    interval: Duration,
    state: Mutex<PollState>,
}

struct PollState {
    last_poll: Option<Instant>,
    cancelled: bool,
}

impl CancellationPoller {
    pub fn new(
        signal: Arc<dyn CancellationSignal>,
        session_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        CancellationPoller {
            signal,
            session_id: session_id.into(),
            interval,
            state: Mutex::new(PollState {
                last_poll: None,
                cancelled: false,
            }),
        }
    }

    /// Current cancellation state, re-polling the signal at most once per
    /// interval.
    pub fn check(&self) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            return true;
        }
        let due = match state.last_poll {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        };
        if due {
            state.last_poll = Some(Instant::now());
            state.cancelled = self.signal.is_cancelled(&self.session_id);
        }
        state.cancelled
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_cancellation() {
        let signal = ManualCancellation::new();
        assert!(!signal.is_cancelled("s1"));
        signal.cancel();
        assert!(signal.is_cancelled("s1"));
    }

    #[test]
    fn test_poller_caches_within_interval() {
        struct CountingSignal {
            polls: AtomicBool,
        }
        impl CancellationSignal for CountingSignal {
            fn is_cancelled(&self, _: &str) -> bool {
                // First poll answers false, any further poll would flip the
                // flag; with a long interval the second check must not poll.
                self.polls.swap(true, Ordering::SeqCst)
            }
        }

        let signal = Arc::new(CountingSignal {
            polls: AtomicBool::new(false),
        });
        let poller = CancellationPoller::new(signal, "s1", Duration::from_secs(3600));
        assert!(!poller.check());
        assert!(!poller.check());
    }

    #[test]
    fn test_poller_sticky_cancel() {
        let signal = Arc::new(ManualCancellation::new());
        let poller = CancellationPoller::new(signal.clone(), "s1", Duration::ZERO);
        assert!(!poller.check());
        signal.cancel();
        assert!(poller.check());
        assert!(poller.check());
    }
}
