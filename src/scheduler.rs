//! Interval scheduling with explicit cancellation.
//!
//! Poll cadence and retry throttling run through this one abstraction
//! instead of ad hoc timers scattered per device variant. Cancellation is
//! immediate: dropping or cancelling the handle aborts the driving task.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Handle to a running interval task. Cancelling (or dropping) the handle
/// stops the ticks.
pub struct ScheduleHandle {
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl ScheduleHandle {
    /// Stop the interval task immediately.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Cancelling interval task");
            handle.abort();
        }
    }

    /// Check whether the task is still scheduled.
    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for ScheduleHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Run `tick` every `period` until the returned handle is cancelled.
///
/// A tick that overruns its period is skipped, not queued.
pub fn spawn_interval<F, Fut>(period: Duration, mut tick: F) -> ScheduleHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of tokio's interval fires immediately; consume it
        // so the first real tick lands one period after spawn.
        interval.tick().await;

        loop {
            interval.tick().await;
            tick().await;
        }
    });

    ScheduleHandle {
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let _handle = spawn_interval(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Let the interval task start before moving the clock.
        tokio::task::yield_now().await;
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();

        let mut handle = spawn_interval(Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;
        handle.cancel();
        let after_cancel = count.load(Ordering::SeqCst);

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        assert!(!handle.is_active());
    }
}
