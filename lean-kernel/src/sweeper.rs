//! Background eviction of idle sessions.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lean_gateway::ProviderGateway;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::scheduler::{SchedulerResult, TaskScheduler};
use crate::session::SessionRegistry;

/// Handle to the periodic sweep task.
///
/// Dropping the handle stops the loop at its next tick.
pub struct Sweeper {
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<Option<()>>>,
}

impl fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sweeper")
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .field("worker_running", &self.worker.is_some())
            .finish()
    }
}

impl Sweeper {
    /// Spawns the sweep loop on `scheduler`.
    ///
    /// Every `interval` the registry drops idle sessions and each removed id is
    /// released from `gateway`.
    ///
    /// # Errors
    ///
    /// Returns a scheduler error when the scheduler is closed.
    pub fn start(
        registry: Arc<SessionRegistry>,
        gateway: Arc<dyn ProviderGateway>,
        interval: Duration,
        scheduler: &TaskScheduler,
    ) -> SchedulerResult<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let worker = scheduler.spawn("session-sweeper", async move {
            run_sweep_loop(registry, gateway, interval, flag).await;
        })?;

        Ok(Self {
            shutdown,
            worker: Some(worker),
        })
    }

    /// Signals the loop to stop and waits for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.abort();
            let _ = worker.await;
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

async fn run_sweep_loop(
    registry: Arc<SessionRegistry>,
    gateway: Arc<dyn ProviderGateway>,
    period: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    while !shutdown.load(Ordering::Acquire) {
        interval.tick().await;
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        for session in registry.sweep().await {
            gateway.release(session).await;
            debug!(session_id = %session, "released swept session");
        }
    }

    debug!("session sweeper stopped");
}
