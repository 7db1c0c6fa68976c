use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use volley_core::metrics;

/// Ids of instances currently being fired.
#[derive(Debug, Default, Clone)]
pub struct InFlightSet {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `instance_id`; only one caller wins until the returned guard drops.
    pub fn try_acquire(&self, instance_id: &str) -> Option<InFlightGuard> {
        if !self.ids.lock().insert(instance_id.to_string()) {
            return None;
        }
        metrics::INFLIGHT_INSTANCES.inc();
        Some(InFlightGuard {
            id: instance_id.to_string(),
            ids: self.ids.clone(),
        })
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.ids.lock().contains(instance_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ownership of one in-flight marker. Dropping it releases the marker, on
/// success and failure paths alike.
#[derive(Debug)]
pub struct InFlightGuard {
    id: String,
    ids: Arc<Mutex<HashSet<String>>>,
}

impl InFlightGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.ids.lock().remove(&self.id) {
            metrics::INFLIGHT_INSTANCES.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_claim_per_id() {
        let set = InFlightSet::new();
        let guard = set.try_acquire("a").unwrap();
        assert!(set.try_acquire("a").is_none());
        assert!(set.try_acquire("b").is_some());
        assert!(set.contains("a"));
        drop(guard);
        assert!(!set.contains("a"));
        assert!(set.try_acquire("a").is_some());
    }

    #[test]
    fn racing_threads_have_a_single_winner() {
        let set = InFlightSet::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let set = set.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // keep the guard alive past the race so losers cannot re-acquire
                    set.try_acquire("w").map(std::mem::forget).is_some()
                })
            })
            .collect();
        let winners = handles.into_iter().map(|h| h.join().unwrap()).filter(|w| *w).count();
        assert_eq!(winners, 1);
    }
}
