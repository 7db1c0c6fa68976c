use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Shortest period a task runs at; a zero period is raised to this.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A job run every `period` on the tokio runtime until stopped.
///
/// Cancellation is only observed between runs: a run in progress always
/// completes, and `stop` waits for it.
pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawns the job. The first run starts immediately. If `wake` is given,
    /// a notification triggers an extra run without waiting for the period.
    pub fn spawn<F, Fut>(
        name: impl Into<String>,
        period: Duration,
        wake: Option<Arc<Notify>>,
        cancel: CancellationToken,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let period = if period.is_zero() {
            warn!(task = %name, min_period_ms = MIN_PERIOD.as_millis() as u64, "zero period, using minimum");
            MIN_PERIOD
        } else {
            period
        };
        let task_name = name.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = notified(wake.as_deref()) => {}
                }
                job().await;
            }
            debug!(task = %task_name, "periodic task stopped");
        });
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Requests cancellation and waits for the current run to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = %self.name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

async fn notified(wake: Option<&Notify>) {
    match wake {
        Some(n) => n.notified().await,
        None => std::future::pending::<()>().await,
    }
}
