//! Bounded task spawning for background work.
//!
//! The sweeper and spawned session channels run through a [`TaskScheduler`]
//! so the runtime never holds more than a fixed number of background tasks.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span};

const DEFAULT_TASK_SLOTS: NonZeroUsize = match NonZeroUsize::new(64) {
    Some(slots) => slots,
    None => NonZeroUsize::MIN,
};

/// Slot limit for a [`TaskScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    task_slots: NonZeroUsize,
}

impl SchedulerConfig {
    /// Allows at most `task_slots` tasks to run at once.
    #[must_use]
    pub const fn new(task_slots: NonZeroUsize) -> Self {
        Self { task_slots }
    }

    /// Configured slot count.
    #[must_use]
    pub const fn task_slots(self) -> NonZeroUsize {
        self.task_slots
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_SLOTS)
    }
}

/// Spawns named tokio tasks, each holding one slot while it runs.
///
/// Tasks beyond the limit wait for a slot. Closing the scheduler rejects new
/// tasks and resolves waiting ones to `None` without running them.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    slots: Arc<Semaphore>,
    closed: Arc<AtomicBool>,
    config: SchedulerConfig,
}

impl TaskScheduler {
    /// Creates a scheduler with every slot free.
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(config.task_slots().get())),
            closed: Arc::new(AtomicBool::new(false)),
            config,
        }
    }

    /// Slot configuration.
    #[must_use]
    pub const fn config(&self) -> SchedulerConfig {
        self.config
    }

    /// Slots not currently held by a running task.
    #[must_use]
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Whether [`TaskScheduler::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting tasks. Running tasks are left alone.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("task scheduler closed");
        }
        self.slots.close();
    }

    /// Spawns `future` inside a `task` span carrying `name`.
    ///
    /// The handle yields `None` when the scheduler closed while the task was
    /// still waiting for a slot.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Closed`] when the scheduler is already closed.
    pub fn spawn<F, T>(&self, name: &'static str, future: F) -> SchedulerResult<JoinHandle<Option<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let slots = Arc::clone(&self.slots);
        let task = async move {
            let Ok(_slot) = slots.acquire_owned().await else {
                debug!("scheduler closed before the task started");
                return None;
            };
            Some(future.await)
        };
        Ok(tokio::spawn(task.instrument(info_span!("task", name))))
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// Errors produced by the scheduler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    /// Scheduler is closed and will not accept new tasks.
    #[error("scheduler closed")]
    Closed,
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn single_slot() -> TaskScheduler {
        TaskScheduler::new(SchedulerConfig::new(NonZeroUsize::MIN))
    }

    #[tokio::test]
    async fn second_task_waits_for_the_slot() {
        let scheduler = single_slot();
        let (release, held) = oneshot::channel::<()>();

        let first = scheduler
            .spawn("first", async move {
                let _ = held.await;
                1
            })
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(scheduler.available(), 0);

        let second = scheduler.spawn("second", async { 2 }).unwrap();
        tokio::task::yield_now().await;
        assert!(!second.is_finished());

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap(), Some(1));
        assert_eq!(second.await.unwrap(), Some(2));
        assert_eq!(scheduler.available(), 1);
    }

    #[tokio::test]
    async fn closing_resolves_waiting_tasks_to_none() {
        let scheduler = single_slot();
        let (release, held) = oneshot::channel::<()>();
        let running = scheduler
            .spawn("running", async move {
                let _ = held.await;
            })
            .unwrap();
        tokio::task::yield_now().await;
        let waiting = scheduler.spawn("waiting", async { "ran" }).unwrap();

        scheduler.close();
        assert_eq!(waiting.await.unwrap(), None);

        release.send(()).unwrap();
        assert_eq!(running.await.unwrap(), Some(()));
        assert_eq!(
            scheduler.spawn("late", async {}).unwrap_err(),
            SchedulerError::Closed
        );
    }

    #[test]
    fn default_allows_sixty_four_tasks() {
        assert_eq!(TaskScheduler::default().config().task_slots().get(), 64);
    }
}
