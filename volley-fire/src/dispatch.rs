use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use volley_core::{metrics, Error, FireWindow, Result, WindowInstance};
use volley_state::OffsetCheckpointStore;

use crate::inflight::InFlightGuard;
use crate::registry::WindowInstanceRegistry;

/// An instance that won the in-flight claim and is waiting to be fired.
#[derive(Debug)]
pub struct FireTicket {
    pub instance: WindowInstance,
    guard: InFlightGuard,
}

impl FireTicket {
    pub fn new(instance: WindowInstance, guard: InFlightGuard) -> Self {
        Self { instance, guard }
    }

    pub fn id(&self) -> &str {
        self.guard.id()
    }
}

/// Calls into the owning window for one ticket and settles the outcome:
/// success removes the instance for good, failure returns it to pending.
pub struct Dispatcher {
    window: Weak<dyn FireWindow>,
    registry: Arc<WindowInstanceRegistry>,
    offsets: Arc<OffsetCheckpointStore>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        window: Weak<dyn FireWindow>,
        registry: Arc<WindowInstanceRegistry>,
        offsets: Arc<OffsetCheckpointStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            window,
            registry,
            offsets,
            shutdown,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Fires the ticket's instance and returns the downstream fire count.
    #[instrument(name = "fire_window_instance", skip_all, fields(instance_id = %ticket.id()))]
    pub async fn fire(&self, ticket: FireTicket) -> Result<usize> {
        let FireTicket { mut instance, guard } = ticket;
        let id = guard.id().to_string();
        if self.shutdown.is_cancelled() {
            debug!(instance_id = %id, "shutdown requested, not firing");
            return Err(Error::Shutdown);
        }
        if self.registry.is_fired(&id) {
            debug!(instance_id = %id, "instance already fired, dropping ticket");
            return Ok(0);
        }
        let Some(window) = self.window.upgrade() else {
            warn!(instance_id = %id, "owning window has been dropped, skipping fire");
            return Err(Error::WindowGone(id));
        };
        if instance.last_max_update_time.is_none() {
            instance.last_max_update_time = window.max_event_time(&instance.partition);
        }
        let offsets = self.offsets.get(&id);

        let started = Instant::now();
        let result = window.fire_window_instance(&instance, offsets.as_ref()).await;
        metrics::FIRE_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);

        match result {
            Ok(fire_count) => {
                // registry first, marker last: nobody can claim the id in between
                self.registry.complete(&id, &instance);
                window.window_instance_map().write().remove(&id);
                if let Err(e) = self.offsets.remove(&id).await {
                    warn!(instance_id = %id, error = %e, "could not drop offset checkpoint of fired instance");
                }
                metrics::INSTANCES_FIRED.with_label_values(&["fired"]).inc();
                debug!(instance_id = %id, window = window.name(), fire_count, "fired window instance");
                drop(guard);
                Ok(fire_count)
            }
            Err(cause) => {
                metrics::INSTANCES_FIRED.with_label_values(&["failed"]).inc();
                warn!(
                    instance_id = %id,
                    partition = %instance.partition,
                    window = window.name(),
                    error = %format!("{cause:#}"),
                    "firing window instance failed, back to pending"
                );
                drop(guard);
                Err(Error::Fire { instance_id: id, cause })
            }
        }
    }
}
