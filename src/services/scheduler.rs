use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::debug;

/// A periodic unit of work scheduled by a coordination node.
pub type ScheduledTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Minimal fixed-rate scheduling capability the core depends on. Nodes never
/// talk to an executor directly, so tests can substitute their own pacing.
pub trait TaskScheduler: Send + Sync {
    /// Runs the task now and then every `interval` until the returned handle
    /// is cancelled.
    fn schedule_at_fixed_rate(&self, task: ScheduledTask, period: Duration) -> TaskHandle;
}

/// Cancellable handle to a scheduled task.
#[derive(Debug)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    join: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    /// Stops the periodic task. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.join.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Scheduler backed by the tokio runtime: one spawned interval loop per task.
#[derive(Debug, Default)]
pub struct TokioScheduler;

impl TaskScheduler for TokioScheduler {
    fn schedule_at_fixed_rate(&self, task: ScheduledTask, period: Duration) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let join = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }
                task().await;
            }
            debug!("scheduled task stopped");
        });

        TaskHandle { cancelled, join }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn runs_immediately_and_periodically() {
        let scheduler = TokioScheduler;
        let ticks = Arc::new(AtomicU32::new(0));
        let counter = ticks.clone();

        let task: ScheduledTask = Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::Relaxed);
            })
        });

        let handle = scheduler.schedule_at_fixed_rate(task, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(70)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let seen = ticks.load(Ordering::Relaxed);
        assert!(seen >= 2, "expected several ticks, saw {}", seen);

        // No further ticks after cancellation.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::Relaxed), seen);
        assert!(handle.is_cancelled());
    }
}
