use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use volley_core::{sort_for_firing, WindowInstance};

#[derive(Debug, Clone)]
struct FiredEntry {
    partition: String,
    fire_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<String, WindowInstance>,
    /// Ids confirmed fired, kept so late duplicates cannot register again.
    fired: HashMap<String, FiredEntry>,
}

/// Pending window instances keyed by instance id.
///
/// Registration is insert-if-absent; an existing entry's identity is never
/// overwritten. Snapshots are owned copies, so iterating one is unaffected by
/// concurrent inserts and removals.
#[derive(Debug, Default)]
pub struct WindowInstanceRegistry {
    inner: RwLock<Inner>,
    generation: AtomicU64,
}

impl WindowInstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `instance` unless its id is already pending or already fired.
    pub fn register_if_absent(&self, instance: WindowInstance) -> bool {
        let id = instance.instance_id();
        let mut inner = self.inner.write();
        if inner.pending.contains_key(&id) || inner.fired.contains_key(&id) {
            return false;
        }
        inner.pending.insert(id, instance);
        self.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Records the watermark seen when `instance` was last touched. Identity is untouched.
    pub fn touch(&self, instance: &WindowInstance, watermark: Option<DateTime<Utc>>) -> bool {
        let id = instance.instance_id();
        let mut inner = self.inner.write();
        match inner.pending.get_mut(&id) {
            Some(entry) => {
                if watermark.is_some() && watermark > entry.last_max_update_time {
                    entry.last_max_update_time = watermark;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, instance_id: &str) -> Option<WindowInstance> {
        self.inner.write().pending.remove(instance_id)
    }

    /// Removes a confirmed-fired instance and remembers its id.
    pub fn complete(&self, instance_id: &str, instance: &WindowInstance) -> Option<WindowInstance> {
        let mut inner = self.inner.write();
        inner.fired.insert(
            instance_id.to_string(),
            FiredEntry {
                partition: instance.partition.clone(),
                fire_time: instance.fire_time,
            },
        );
        inner.pending.remove(instance_id)
    }

    pub fn get(&self, instance_id: &str) -> Option<WindowInstance> {
        self.inner.read().pending.get(instance_id).cloned()
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.inner.read().pending.contains_key(instance_id)
    }

    pub fn is_fired(&self, instance_id: &str) -> bool {
        self.inner.read().fired.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumps on every successful registration.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Pending instances in firing order.
    pub fn snapshot(&self) -> Vec<WindowInstance> {
        let mut instances: Vec<WindowInstance> = self.inner.read().pending.values().cloned().collect();
        sort_for_firing(&mut instances);
        instances
    }

    /// Forgets fired ids of `partition` whose fire time is older than
    /// `watermark - retention`. Returns how many were forgotten.
    pub fn prune_fired(&self, partition: &str, watermark: DateTime<Utc>, retention: Duration) -> usize {
        let horizon = watermark - retention;
        let mut inner = self.inner.write();
        let before = inner.fired.len();
        inner
            .fired
            .retain(|_, e| e.partition != partition || e.fire_time >= horizon);
        before - inner.fired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn inst(partition: &str, start: i64, end: i64) -> WindowInstance {
        WindowInstance::new(partition, "ns", "w", t(start), t(end))
    }

    #[test]
    fn register_is_idempotent() {
        let reg = WindowInstanceRegistry::new();
        assert!(reg.register_if_absent(inst("q", 0, 10)));
        assert!(!reg.register_if_absent(inst("q", 0, 10)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.generation(), 1);
    }

    #[test]
    fn touch_keeps_identity_and_only_moves_forward() {
        let reg = WindowInstanceRegistry::new();
        let w = inst("q", 0, 10);
        reg.register_if_absent(w.clone());
        assert!(reg.touch(&w, Some(t(5))));
        assert!(reg.touch(&w, Some(t(3))));
        assert!(reg.touch(&w, None));
        let stored = reg.get(&w.instance_id()).unwrap();
        assert!(stored.same_identity(&w));
        assert_eq!(stored.last_max_update_time, Some(t(5)));
        assert!(!reg.touch(&inst("q", 10, 20), Some(t(5))));
    }

    #[test]
    fn snapshot_is_sorted_and_detached() {
        let reg = WindowInstanceRegistry::new();
        reg.register_if_absent(inst("q", 0, 20));
        reg.register_if_absent(inst("q", 0, 10));
        reg.register_if_absent(inst("q", 5, 10));
        let snap = reg.snapshot();
        reg.remove(&snap[0].instance_id());
        reg.register_if_absent(inst("q", 30, 40));
        let order: Vec<_> = snap.iter().map(|w| (w.start_time, w.fire_time)).collect();
        assert_eq!(order, vec![(t(5), t(10)), (t(0), t(10)), (t(0), t(20))]);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn fired_ids_cannot_come_back_until_pruned() {
        let reg = WindowInstanceRegistry::new();
        let w = inst("q", 0, 10);
        let id = w.instance_id();
        reg.register_if_absent(w.clone());
        assert!(reg.complete(&id, &w).is_some());
        assert!(reg.is_fired(&id));
        assert!(!reg.contains(&id));
        assert!(!reg.register_if_absent(w.clone()));

        assert_eq!(reg.prune_fired("other", t(10_000), Duration::seconds(60)), 0);
        assert_eq!(reg.prune_fired("q", t(40), Duration::seconds(60)), 0);
        assert_eq!(reg.prune_fired("q", t(100), Duration::seconds(60)), 1);
        assert!(reg.register_if_absent(w));
    }

    #[test]
    fn concurrent_duplicate_registration_inserts_once() {
        let reg = Arc::new(WindowInstanceRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                std::thread::spawn(move || (0..50).filter(|i| reg.register_if_absent(inst("q", *i, i + 1))).count())
            })
            .collect();
        let inserted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(inserted, 50);
        assert_eq!(reg.len(), 50);
    }
}
