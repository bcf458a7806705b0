//! Bounded wait for outstanding stop announces during shutdown.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use quay_events::InfoHash;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

/// One outstanding "stopped" announce.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BarrierToken {
    /// Transfer being stopped.
    pub info_hash: InfoHash,
    /// Tracker being notified.
    pub tracker: String,
}

impl BarrierToken {
    /// Token for the announce of `info_hash` to `tracker`.
    #[must_use]
    pub fn new(info_hash: InfoHash, tracker: impl Into<String>) -> Self {
        Self {
            info_hash,
            tracker: tracker.into(),
        }
    }
}

/// Result of [`ShutdownBarrier::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every registered token completed.
    AllCompleted,
    /// The timeout elapsed with tokens still pending.
    TimedOut,
}

/// Aggregates outstanding acknowledgements and releases waiters when all
/// completed or a deadline passes.
///
/// Clones share state, so the barrier can be handed to announce tasks.
#[derive(Debug, Clone, Default)]
pub struct ShutdownBarrier {
    inner: Arc<BarrierInner>,
}

#[derive(Debug, Default)]
struct BarrierInner {
    pending: Mutex<HashSet<BarrierToken>>,
    settled: Notify,
}

impl ShutdownBarrier {
    /// Create an empty barrier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `token` until it is completed. Returns `false` if it was already pending.
    pub fn register(&self, token: BarrierToken) -> bool {
        self.lock_pending().insert(token)
    }

    /// Mark `token` as settled. Returns `false` for unknown tokens.
    pub fn complete(&self, token: &BarrierToken) -> bool {
        let (removed, drained) = {
            let mut pending = self.lock_pending();
            let removed = pending.remove(token);
            (removed, pending.is_empty())
        };
        if removed && drained {
            self.inner.settled.notify_waiters();
        }
        removed
    }

    /// Number of tokens still outstanding.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock_pending().len()
    }

    /// Wait until every registered token completed or `timeout` elapsed.
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if self.pending() == 0 {
                return WaitOutcome::AllCompleted;
            }
            if timeout_at(deadline, settled).await.is_err() {
                return if self.pending() == 0 {
                    WaitOutcome::AllCompleted
                } else {
                    WaitOutcome::TimedOut
                };
            }
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashSet<BarrierToken>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(tracker: &str) -> BarrierToken {
        BarrierToken::new(InfoHash::new([9; 20]), tracker)
    }

    #[tokio::test]
    async fn empty_barrier_completes_immediately() {
        let barrier = ShutdownBarrier::new();
        assert_eq!(
            barrier.wait(Duration::from_millis(1)).await,
            WaitOutcome::AllCompleted
        );
    }

    #[tokio::test]
    async fn completes_when_all_tokens_settle() {
        let barrier = ShutdownBarrier::new();
        assert!(barrier.register(token("udp://a")));
        assert!(!barrier.register(token("udp://a")));
        assert!(barrier.register(token("udp://b")));

        let worker = barrier.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            worker.complete(&token("udp://a"));
            worker.complete(&token("udp://b"));
        });

        assert_eq!(
            barrier.wait(Duration::from_secs(5)).await,
            WaitOutcome::AllCompleted
        );
        handle.await.expect("worker finished");
        assert_eq!(barrier.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_pending_tokens() {
        let barrier = ShutdownBarrier::new();
        barrier.register(token("udp://slow"));
        assert_eq!(
            barrier.wait(Duration::from_secs(3)).await,
            WaitOutcome::TimedOut
        );
        assert_eq!(barrier.pending(), 1);
    }

    #[test]
    fn completing_unknown_tokens_is_ignored() {
        let barrier = ShutdownBarrier::new();
        assert!(!barrier.complete(&token("udp://never")));
    }
}
