//! Background Task Scheduler
//!
//! Runs periodic maintenance and fan-out work on the tokio runtime.
//!
//! Each task owns a [`CancellationToken`] and stops independently. A run
//! that returns an error or panics is logged and counted; the timer keeps
//! going and the next tick runs normally.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::infrastructure::metrics::{record_cycle_duration, record_cycle_failure};

/// Shortest period a task can be scheduled with.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Error starting background work.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// No tokio runtime is available to spawn on.
    #[error("cannot schedule task {0}: no tokio runtime")]
    NoRuntime(&'static str),
}

/// Handle to a spawned background task.
#[derive(Debug)]
pub struct TaskHandle {
    name: &'static str,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    /// Task name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Request the task to stop after its current run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait up to `grace` for the task to exit, aborting it after.
    pub async fn shutdown(self, grace: Duration) {
        self.cancel.cancel();
        let abort = self.join.abort_handle();
        match tokio::time::timeout(grace, self.join).await {
            Ok(Ok(())) => tracing::debug!(task = self.name, "Task stopped"),
            Ok(Err(error)) => tracing::warn!(task = self.name, %error, "Task ended abnormally"),
            Err(_) => {
                tracing::warn!(task = self.name, "Task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Spawn a future as a named background task.
///
/// # Errors
///
/// Returns [`SchedulerError::NoRuntime`] when called outside a tokio runtime.
pub fn spawn<Fut>(
    name: &'static str,
    cancel: CancellationToken,
    future: Fut,
) -> Result<TaskHandle, SchedulerError>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    let runtime = Handle::try_current().map_err(|_| SchedulerError::NoRuntime(name))?;
    let join = runtime.spawn(future);
    tracing::debug!(task = name, "Background task spawned");
    Ok(TaskHandle { name, cancel, join })
}

/// Spawn `task` to run every `period`, first after `initial_delay`.
///
/// # Errors
///
/// Returns [`SchedulerError::NoRuntime`] when called outside a tokio runtime.
pub fn spawn_periodic<F, Fut, E>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    task: F,
) -> Result<TaskHandle, SchedulerError>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display + 'static,
{
    let token = cancel.clone();
    spawn(
        name,
        cancel,
        run_periodic(name, initial_delay, period, token, task),
    )
}

/// Drive `task` on a fixed period until `cancel` fires.
///
/// Missed ticks are skipped rather than bursted. A run in progress when
/// cancellation arrives is allowed to finish.
pub async fn run_periodic<F, Fut, E>(
    name: &'static str,
    initial_delay: Duration,
    period: Duration,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    let mut interval =
        tokio::time::interval_at(Instant::now() + initial_delay, period.max(MIN_PERIOD));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!(task = name, "Periodic task cancelled");
                break;
            }
            _ = interval.tick() => {
                let started = Instant::now();
                match AssertUnwindSafe(task()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => {
                        record_cycle_failure(name);
                        tracing::error!(task = name, %error, "Periodic task run failed");
                    }
                    Err(panic) => {
                        record_cycle_failure(name);
                        tracing::error!(
                            task = name,
                            panic = panic_message(panic.as_ref()),
                            "Periodic task run panicked"
                        );
                    }
                }
                record_cycle_duration(name, started.elapsed());
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::Ready;

    use super::*;

    fn counting(runs: Arc<AtomicUsize>) -> impl FnMut() -> Ready<Result<(), String>> {
        move || {
            runs.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_period_after_initial_delay() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(
            "test",
            Duration::from_millis(100),
            Duration::from_millis(100),
            cancel.clone(),
            counting(Arc::clone(&runs)),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_stop_the_timer() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let cancel = CancellationToken::new();

        let handle = spawn_periodic(
            "failing",
            Duration::ZERO,
            Duration::from_millis(10),
            cancel,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Err("first run fails".to_string()),
                        1 => panic!("second run panics"),
                        _ => Ok(()),
                    }
                }
            },
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(45)).await;

        assert!(runs.load(Ordering::SeqCst) >= 4);
        assert!(!handle.is_finished());
        handle.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let handle = spawn_periodic(
            "cancelled",
            Duration::ZERO,
            Duration::from_millis(10),
            cancel.clone(),
            counting(Arc::clone(&runs)),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let after_cancel = runs.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_cancel);
        assert!(handle.is_finished());
    }

    #[test]
    fn spawning_without_runtime_fails() {
        let result = spawn_periodic(
            "orphan",
            Duration::ZERO,
            Duration::from_secs(1),
            CancellationToken::new(),
            || futures::future::ready(Ok::<(), String>(())),
        );

        assert!(matches!(result, Err(SchedulerError::NoRuntime("orphan"))));
    }

    #[test]
    fn panic_message_extraction() {
        let owned: Box<dyn Any + Send> = Box::new("boom".to_string());
        let borrowed: Box<dyn Any + Send> = Box::new("bang");
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(owned.as_ref()), "boom");
        assert_eq!(panic_message(borrowed.as_ref()), "bang");
        assert_eq!(panic_message(other.as_ref()), "unknown panic");
    }
}
