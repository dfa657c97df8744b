//! Execution-time monitor for blocking statements.
//!
//! A rename that normally takes milliseconds can sit behind a metadata
//! lock indefinitely. The monitor races a timer against the call and
//! reports once if the threshold passes; it never interrupts the call.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

/// A running timer tied to one blocking call.
///
/// Dropping the monitor cancels the timer, so it cannot outlive the
/// scope that started it.
pub struct ExecutionMonitor {
    guard: DropGuard,
    handle: JoinHandle<bool>,
}

impl ExecutionMonitor {
    /// Start the timer. Returns `None` (no monitor) for a zero threshold.
    ///
    /// `on_slow` runs at most once, when `threshold` elapses before
    /// [`ExecutionMonitor::finish`] is called.
    pub fn start<F, Fut>(threshold: Duration, on_slow: F) -> Option<Self>
    where
        F: FnOnce(Duration) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if threshold.is_zero() {
            return None;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => false,
                _ = tokio::time::sleep(threshold) => {
                    log::warn!(
                        "Operation exceeded execution time threshold; threshold_secs={}",
                        threshold.as_secs_f64()
                    );
                    on_slow(threshold).await;
                    true
                }
            }
        });

        Some(Self {
            guard: token.drop_guard(),
            handle,
        })
    }

    /// Cancel the timer and wait for the task. Returns whether the warning fired.
    pub async fn finish(self) -> bool {
        drop(self.guard);
        match self.handle.await {
            Ok(fired) => fired,
            Err(e) => {
                log::warn!("Execution monitor task failed; error={}", e);
                false
            }
        }
    }
}

/// Run `operation` under an [`ExecutionMonitor`].
///
/// Returns the operation's output and whether the slow-operation callback ran.
pub async fn monitored<T, Op, F, Fut>(threshold: Duration, on_slow: F, operation: Op) -> (T, bool)
where
    Op: Future<Output = T>,
    F: FnOnce(Duration) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let monitor = ExecutionMonitor::start(threshold, on_slow);
    let output = operation.await;
    let fired = match monitor {
        Some(m) => m.finish().await,
        None => false,
    };
    (output, fired)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce(Duration) -> std::future::Ready<()> + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let on_slow = move |_: Duration| {
            c.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        };
        (count, on_slow)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_operation_warns_once() {
        let (count, on_slow) = counter();
        let (_, fired) = monitored(
            Duration::from_secs(1),
            on_slow,
            tokio::time::sleep(Duration::from_secs(2)),
        )
        .await;
        assert!(fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_stays_silent() {
        let (count, on_slow) = counter();
        let (_, fired) = monitored(
            Duration::from_secs(1),
            on_slow,
            tokio::time::sleep(Duration::from_millis(500)),
        )
        .await;
        assert!(!fired);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_threshold_starts_nothing() {
        let (count, on_slow) = counter();
        assert!(ExecutionMonitor::start(Duration::ZERO, on_slow).is_none());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_is_passed_through() {
        let (_, on_slow) = counter();
        let (value, _) = monitored(Duration::from_secs(5), on_slow, async { 42 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_monitor_cancels_timer() {
        let (count, on_slow) = counter();
        let monitor = ExecutionMonitor::start(Duration::from_secs(1), on_slow).unwrap();
        drop(monitor);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
