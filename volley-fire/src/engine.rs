use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use volley_core::{
    metrics, Clock, EngineSettings, Error, FireObserver, FireWindow, InstanceState, PartitionOffsets, Result,
    SystemClock, WindowInstance,
};
use volley_state::OffsetCheckpointStore;

use crate::buffer::{FireBuffer, FlushReport};
use crate::dispatch::{Dispatcher, FireTicket};
use crate::eligibility::{Eligibility, FirePolicy};
use crate::inflight::InFlightSet;
use crate::observer::NoopObserver;
use crate::registry::WindowInstanceRegistry;
use crate::timer::PeriodicTask;
use crate::watermark::WatermarkTracker;

/// Result of one attempt to move an instance into flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireAttempt {
    NotEligible(Eligibility),
    AlreadyInFlight,
    AlreadyFired,
    /// Fired synchronously; carries the downstream fire count.
    Fired(usize),
    /// Claimed and handed to the fire buffer.
    Buffered,
}

/// What one scheduler pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub considered: usize,
    pub fired: usize,
    pub buffered: usize,
    pub failed: usize,
    pub skipped_in_flight: usize,
    pub waiting: usize,
}

pub struct EngineBuilder {
    window: Weak<dyn FireWindow>,
    settings: EngineSettings,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn FireObserver>,
    offsets: Arc<OffsetCheckpointStore>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn FireObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn offset_store(mut self, offsets: Arc<OffsetCheckpointStore>) -> Self {
        self.offsets = offsets;
        self
    }

    pub fn build(self) -> FiringEngine {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(WindowInstanceRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(
            self.window.clone(),
            registry.clone(),
            self.offsets.clone(),
            shutdown.clone(),
        ));
        let buffer = Arc::new(FireBuffer::new(dispatcher.clone(), self.settings.max_batch_size));
        let inner = EngineInner {
            policy: FirePolicy::new(self.settings.grace_period),
            watermarks: WatermarkTracker::new(self.clock.clone()),
            settings: self.settings,
            window: self.window,
            clock: self.clock,
            registry,
            inflight: InFlightSet::new(),
            offsets: self.offsets,
            observer: self.observer,
            dispatcher,
            buffer,
            shutdown,
        };
        FiringEngine {
            inner: Arc::new(inner),
            tasks: Mutex::new(Vec::new()),
        }
    }
}

struct EngineInner {
    settings: EngineSettings,
    window: Weak<dyn FireWindow>,
    clock: Arc<dyn Clock>,
    policy: FirePolicy,
    watermarks: WatermarkTracker,
    registry: Arc<WindowInstanceRegistry>,
    inflight: InFlightSet,
    offsets: Arc<OffsetCheckpointStore>,
    observer: Arc<dyn FireObserver>,
    dispatcher: Arc<Dispatcher>,
    buffer: Arc<FireBuffer>,
    shutdown: CancellationToken,
}

/// Decides when pending window instances fire and fires each exactly once.
///
/// Message threads call [`on_message`](Self::on_message) to advance partition
/// watermarks and register buckets; a periodic scheduler walks the pending set
/// in firing order and claims eligible instances, which are fired either
/// directly or through the per-partition fire buffer.
pub struct FiringEngine {
    inner: Arc<EngineInner>,
    tasks: Mutex<Vec<PeriodicTask>>,
}

impl FiringEngine {
    /// The engine keeps only a weak reference to `window`; once the window is
    /// dropped, fire attempts are skipped with a warning.
    pub fn builder(window: &Arc<dyn FireWindow>) -> EngineBuilder {
        EngineBuilder {
            window: Arc::downgrade(window),
            settings: EngineSettings::default(),
            clock: Arc::new(SystemClock),
            observer: Arc::new(NoopObserver),
            offsets: Arc::new(OffsetCheckpointStore::new()),
        }
    }

    pub fn new(window: &Arc<dyn FireWindow>, settings: EngineSettings) -> Self {
        Self::builder(window).settings(settings).build()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Spawns the fire-check scheduler and the buffer auto-flusher. Idempotent.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.inner.shutdown.is_cancelled() {
            return;
        }
        let inner = self.inner.clone();
        tasks.push(PeriodicTask::spawn(
            "fire-check",
            self.inner.settings.fire_interval,
            None,
            self.inner.shutdown.child_token(),
            move || {
                let inner = inner.clone();
                async move {
                    inner.tick().await;
                }
            },
        ));
        let buffer = self.inner.buffer.clone();
        tasks.push(PeriodicTask::spawn(
            "fire-buffer-flush",
            self.inner.settings.auto_flush_interval,
            Some(self.inner.buffer.wake()),
            self.inner.shutdown.child_token(),
            move || {
                let buffer = buffer.clone();
                async move {
                    buffer.flush_all().await;
                }
            },
        ));
        info!(
            fire_interval_ms = self.inner.settings.fire_interval.as_millis() as u64,
            start_now = self.inner.settings.start_now,
            "firing engine started"
        );
    }

    /// Stops the periodic tasks, lets in-progress fires finish and returns
    /// still-buffered instances to pending. Nothing fires afterwards.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let tasks: Vec<PeriodicTask> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop().await;
        }
        let released = self.inner.buffer.release_all();
        info!(released, pending = self.inner.registry.len(), "firing engine stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Message-arrival path: advances the partition watermark, registers the
    /// instance if new and refreshes its last-update watermark.
    pub fn on_message(&self, instance: WindowInstance, event_time: DateTime<Utc>) -> bool {
        self.inner.watermarks.advance(&instance.partition, event_time);
        let inserted = self.register_if_absent(instance.clone());
        self.touch(&instance);
        inserted
    }

    pub fn register_if_absent(&self, instance: WindowInstance) -> bool {
        self.inner.register_if_absent(instance)
    }

    pub fn touch(&self, instance: &WindowInstance) -> bool {
        let watermark = self.inner.watermarks.max_event_time(&instance.partition);
        self.inner.registry.touch(instance, watermark)
    }

    pub fn advance_watermark(&self, partition: &str, event_time: DateTime<Utc>) -> bool {
        self.inner.watermarks.advance(partition, event_time)
    }

    pub fn max_event_time(&self, partition: &str) -> Option<DateTime<Utc>> {
        self.inner.watermarks.max_event_time(partition)
    }

    pub async fn record_offsets(&self, instance_id: &str, offsets: PartitionOffsets) -> Result<bool> {
        self.inner.offsets.record_offsets(instance_id, offsets).await
    }

    pub fn offsets(&self, instance_id: &str) -> Option<PartitionOffsets> {
        self.inner.offsets.get(instance_id)
    }

    /// Evaluates `instance` and, if eligible, claims it and fires it now
    /// (`start_now`) or hands it to the fire buffer.
    pub async fn execute_fire_task(&self, instance: &WindowInstance, start_now: bool) -> Result<FireAttempt> {
        self.inner.execute_fire_task(instance, start_now).await
    }

    /// Runs one scheduler pass.
    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }

    /// Flushes every buffered partition now.
    pub async fn flush(&self) -> FlushReport {
        self.inner.buffer.flush_all().await
    }

    pub async fn flush_partition(&self, partition: &str) -> FlushReport {
        self.inner.buffer.flush_partition(partition).await
    }

    /// Reloads persisted offsets and re-registers instances rebuilt from a
    /// checkpoint. Ids are deterministic, so duplicates collapse. Returns how
    /// many instances were newly registered.
    pub async fn recover<I>(&self, instances: I) -> Result<usize>
    where
        I: IntoIterator<Item = WindowInstance>,
    {
        let restored_offsets = self.inner.offsets.restore().await?;
        let registered = instances
            .into_iter()
            .filter(|w| self.inner.register_if_absent(w.clone()))
            .count();
        info!(registered, restored_offsets, "recovered window instances");
        Ok(registered)
    }

    pub fn state_of(&self, instance_id: &str) -> InstanceState {
        if self.inner.inflight.contains(instance_id) {
            InstanceState::InFlight
        } else if self.inner.registry.contains(instance_id) {
            InstanceState::Pending
        } else if self.inner.registry.is_fired(instance_id) {
            InstanceState::Fired
        } else {
            InstanceState::Unknown
        }
    }

    /// Pending instances in firing order.
    pub fn pending(&self) -> Vec<WindowInstance> {
        self.inner.registry.snapshot()
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }
}

impl EngineInner {
    fn register_if_absent(&self, instance: WindowInstance) -> bool {
        let id = instance.instance_id();
        if !instance.has_unambiguous_id() {
            warn!(instance_id = %id, "partition, namespace or window name contains ';', not registering");
            return false;
        }
        if !self.registry.register_if_absent(instance.clone()) {
            return false;
        }
        match self.window.upgrade() {
            Some(window) => {
                window.window_instance_map().write().insert(id.clone(), instance);
            }
            None => warn!(instance_id = %id, "owning window has been dropped, not publishing instance"),
        }
        debug!(instance_id = %id, "registered window instance");
        true
    }

    fn max_gap_seconds(&self, window: &dyn FireWindow) -> Option<u64> {
        window
            .max_allowed_gap_seconds()
            .or(self.settings.max_allowed_gap_seconds)
    }

    async fn execute_fire_task(&self, instance: &WindowInstance, start_now: bool) -> Result<FireAttempt> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let id = instance.instance_id();
        let Some(window) = self.window.upgrade() else {
            warn!(instance_id = %id, "can't find owning window");
            return Err(Error::WindowGone(id));
        };

        let partition = instance.partition.as_str();
        if let Some(reported) = window.max_event_time(partition) {
            self.watermarks.advance(partition, reported);
        }
        let eligibility = self.policy.evaluate(
            instance.fire_time,
            self.watermarks.max_event_time(partition),
            self.watermarks.last_advanced_at(partition),
            self.clock.now(),
            self.max_gap_seconds(window.as_ref()),
        );
        if !eligibility.is_eligible() {
            return Ok(FireAttempt::NotEligible(eligibility));
        }

        let Some(guard) = self.inflight.try_acquire(&id) else {
            return Ok(FireAttempt::AlreadyInFlight);
        };
        // a winner may have completed just before we claimed the id
        if self.registry.is_fired(&id) {
            return Ok(FireAttempt::AlreadyFired);
        }
        if let Eligibility::Stale { gap_ms, idle_ms } = eligibility {
            metrics::FORCED_FIRES.inc();
            warn!(instance_id = %id, gap_ms, idle_ms, "partition exceeded allowed gap, forcing fire");
        }

        let current = self.registry.get(&id).unwrap_or_else(|| instance.clone());
        let last_update = self.watermarks.last_advanced_at(partition);
        if let Err(e) = self.observer.on_in_flight(&current, last_update).await {
            metrics::OBSERVER_ERRORS.inc();
            debug!(instance_id = %id, error = %format!("{e:#}"), "in-flight notification failed");
        }
        // stop() may have run while the observer was awaited
        if self.shutdown.is_cancelled() {
            return Err(Error::Shutdown);
        }
        debug!(instance_id = %id, start_now, "window instance in flight");

        let ticket = FireTicket::new(current, guard);
        if start_now {
            let fire_count = self.dispatcher.fire(ticket).await?;
            Ok(FireAttempt::Fired(fire_count))
        } else if self.buffer.add_cache(ticket) {
            Ok(FireAttempt::Buffered)
        } else {
            Err(Error::Shutdown)
        }
    }

    #[instrument(name = "fire_check_tick", skip_all)]
    async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.shutdown.is_cancelled() {
            return report;
        }
        let started = Instant::now();
        let mut queue: VecDeque<WindowInstance> = self.registry.snapshot().into();
        let mut generation = self.registry.generation();
        let mut visited: HashSet<String> = HashSet::new();
        let mut blocked: HashSet<String> = HashSet::new();
        let start_now = self.settings.start_now;

        while let Some(instance) = queue.pop_front() {
            if self.shutdown.is_cancelled() {
                break;
            }
            let id = instance.instance_id();
            if !visited.insert(id.clone()) || blocked.contains(&instance.partition) {
                continue;
            }
            report.considered += 1;
            match self.execute_fire_task(&instance, start_now).await {
                Ok(FireAttempt::NotEligible(_)) => {
                    // later instances of this partition close later; keep their order
                    report.waiting += 1;
                    blocked.insert(instance.partition.clone());
                }
                Ok(FireAttempt::AlreadyInFlight) => report.skipped_in_flight += 1,
                Ok(FireAttempt::AlreadyFired) => {}
                Ok(FireAttempt::Fired(_)) => report.fired += 1,
                Ok(FireAttempt::Buffered) => report.buffered += 1,
                Err(Error::Shutdown) => break,
                Err(Error::WindowGone(_)) => {
                    report.failed += 1;
                    break;
                }
                Err(e) => {
                    // the dispatcher already warned with the cause
                    report.failed += 1;
                    debug!(instance_id = %id, error = %e, "fire task failed, retrying on a later tick");
                }
            }
            let current = self.registry.generation();
            if current != generation {
                generation = current;
                queue = self
                    .registry
                    .snapshot()
                    .into_iter()
                    .filter(|w| !visited.contains(&w.instance_id()))
                    .collect();
            }
        }

        self.housekeeping().await;
        metrics::TICK_LATENCY_MS.observe(started.elapsed().as_secs_f64() * 1_000.0);
        if report.considered > 0 {
            debug!(?report, "fire check finished");
        }
        report
    }

    async fn housekeeping(&self) {
        for partition in self.watermarks.partitions() {
            if let Some(watermark) = self.watermarks.max_event_time(&partition) {
                self.registry
                    .prune_fired(&partition, watermark, self.settings.fired_retention);
            }
        }
        let registry = self.registry.clone();
        if let Err(e) = self.offsets.retain(|id| !registry.is_fired(id)).await {
            warn!(error = %e, "offset checkpoint cleanup failed");
        }
        metrics::PENDING_INSTANCES.set(self.registry.len() as i64);
        metrics::INFLIGHT_INSTANCES.set(self.inflight.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use volley_core::{ManualClock, SharedInstanceMap};

    #[derive(Default)]
    struct StubWindow {
        fired: Mutex<Vec<String>>,
        map: SharedInstanceMap,
        gap: Option<u64>,
        reported: Mutex<HashMap<String, DateTime<Utc>>>,
    }

    #[async_trait]
    impl FireWindow for StubWindow {
        fn name(&self) -> &str {
            "stub"
        }
        fn max_event_time(&self, partition: &str) -> Option<DateTime<Utc>> {
            self.reported.lock().get(partition).copied()
        }
        fn max_allowed_gap_seconds(&self) -> Option<u64> {
            self.gap
        }
        fn window_instance_map(&self) -> SharedInstanceMap {
            self.map.clone()
        }
        async fn fire_window_instance(
            &self,
            instance: &WindowInstance,
            _offsets: Option<&PartitionOffsets>,
        ) -> anyhow::Result<usize> {
            self.fired.lock().push(instance.instance_id());
            Ok(1)
        }
    }

    fn t(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + ms).unwrap()
    }

    fn engine_for(window: &Arc<StubWindow>, clock: Arc<ManualClock>) -> FiringEngine {
        let handle: Arc<dyn FireWindow> = window.clone();
        FiringEngine::builder(&handle).clock(clock).build()
    }

    #[tokio::test]
    async fn window_reported_watermark_feeds_tracker() {
        let window = Arc::new(StubWindow::default());
        let engine = engine_for(&window, Arc::new(ManualClock::new(t(0))));
        let w = WindowInstance::new("q", "ns", "w", t(0), t(10_000));
        engine.register_if_absent(w.clone());

        let attempt = engine.execute_fire_task(&w, true).await.unwrap();
        assert_eq!(attempt, FireAttempt::NotEligible(Eligibility::NoWatermark));

        window.reported.lock().insert("q".into(), t(13_000));
        let attempt = engine.execute_fire_task(&w, true).await.unwrap();
        assert_eq!(attempt, FireAttempt::Fired(1));
        assert_eq!(engine.max_event_time("q"), Some(t(13_000)));
        assert_eq!(engine.state_of(&w.instance_id()), InstanceState::Fired);
    }

    #[tokio::test]
    async fn registration_is_published_and_cleared_on_fire() {
        let window = Arc::new(StubWindow::default());
        let engine = engine_for(&window, Arc::new(ManualClock::new(t(0))));
        let w = WindowInstance::new("q", "ns", "w", t(0), t(10_000));
        assert!(engine.on_message(w.clone(), t(500)));
        assert!(!engine.on_message(w.clone(), t(900)));
        assert!(window.map.read().contains_key(&w.instance_id()));
        assert_eq!(engine.pending()[0].last_max_update_time, Some(t(900)));

        engine.advance_watermark("q", t(13_000));
        engine.execute_fire_task(&w, true).await.unwrap();
        assert!(window.map.read().is_empty());
        assert!(!engine.register_if_absent(w));
    }

    #[tokio::test]
    async fn ambiguous_names_are_rejected() {
        let window = Arc::new(StubWindow::default());
        let engine = engine_for(&window, Arc::new(ManualClock::new(t(0))));
        let first = WindowInstance::new("a;b", "c", "w", t(0), t(10_000));
        let second = WindowInstance::new("a", "b;c", "w", t(0), t(10_000));
        assert!(!engine.register_if_absent(first));
        assert!(!engine.on_message(second.clone(), t(500)));
        assert!(engine.pending().is_empty());
        assert!(window.map.read().is_empty());
        assert_eq!(engine.state_of(&second.instance_id()), InstanceState::Unknown);
    }

    #[tokio::test]
    async fn gap_falls_back_to_engine_settings() {
        let window = Arc::new(StubWindow::default());
        let clock = Arc::new(ManualClock::new(t(0)));
        let handle: Arc<dyn FireWindow> = window.clone();
        let settings = EngineSettings {
            max_allowed_gap_seconds: Some(2),
            ..EngineSettings::default()
        };
        let engine = FiringEngine::builder(&handle).settings(settings).clock(clock.clone()).build();
        let w = WindowInstance::new("q", "ns", "w", t(0), t(10_000));
        engine.on_message(w.clone(), t(10_500));
        assert!(matches!(
            engine.execute_fire_task(&w, true).await.unwrap(),
            FireAttempt::NotEligible(Eligibility::Waiting { .. })
        ));
        clock.advance(Duration::milliseconds(2_001));
        assert_eq!(engine.execute_fire_task(&w, true).await.unwrap(), FireAttempt::Fired(1));
    }

    #[tokio::test]
    async fn dropped_window_is_reported_not_fatal() {
        let window = Arc::new(StubWindow::default());
        let engine = engine_for(&window, Arc::new(ManualClock::new(t(0))));
        let w = WindowInstance::new("q", "ns", "w", t(0), t(10_000));
        engine.on_message(w.clone(), t(20_000));
        drop(window);

        assert!(matches!(engine.execute_fire_task(&w, true).await, Err(Error::WindowGone(_))));
        let report = engine.tick().await;
        assert_eq!(report.failed, 1);
        assert_eq!(engine.state_of(&w.instance_id()), InstanceState::Pending);
    }

    #[tokio::test]
    async fn nothing_fires_after_stop() {
        let window = Arc::new(StubWindow::default());
        let engine = engine_for(&window, Arc::new(ManualClock::new(t(0))));
        let w = WindowInstance::new("q", "ns", "w", t(0), t(10_000));
        engine.on_message(w.clone(), t(20_000));
        engine.stop().await;

        assert_eq!(engine.tick().await, TickReport::default());
        assert!(matches!(engine.execute_fire_task(&w, true).await, Err(Error::Shutdown)));
        assert!(window.fired.lock().is_empty());
        assert_eq!(engine.state_of(&w.instance_id()), InstanceState::Pending);
    }
}
