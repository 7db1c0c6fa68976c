use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use volley_core::Clock;

#[derive(Debug, Clone, Copy)]
struct PartitionMark {
    max_event_time: DateTime<Utc>,
    /// Wall-clock time of the last forward move.
    last_advanced_at: DateTime<Utc>,
}

/// Per-partition highest observed event time. Values only move forward:
/// concurrent advances resolve max-wins under the write lock.
#[derive(Debug)]
pub struct WatermarkTracker {
    clock: Arc<dyn Clock>,
    partitions: RwLock<HashMap<String, PartitionMark>>,
}

impl WatermarkTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            partitions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns `true` when `event_time` moved the partition watermark forward.
    pub fn advance(&self, partition: &str, event_time: DateTime<Utc>) -> bool {
        let mut partitions = self.partitions.write();
        match partitions.get_mut(partition) {
            Some(mark) if event_time > mark.max_event_time => {
                mark.max_event_time = event_time;
                mark.last_advanced_at = self.clock.now();
                true
            }
            Some(_) => false,
            None => {
                partitions.insert(
                    partition.to_string(),
                    PartitionMark {
                        max_event_time: event_time,
                        last_advanced_at: self.clock.now(),
                    },
                );
                true
            }
        }
    }

    /// `None` until the first event for `partition` is observed.
    pub fn max_event_time(&self, partition: &str) -> Option<DateTime<Utc>> {
        self.partitions.read().get(partition).map(|m| m.max_event_time)
    }

    pub fn last_advanced_at(&self, partition: &str) -> Option<DateTime<Utc>> {
        self.partitions.read().get(partition).map(|m| m.last_advanced_at)
    }

    pub fn partitions(&self) -> Vec<String> {
        self.partitions.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use volley_core::ManualClock;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn watermark_only_moves_forward() {
        let clock = Arc::new(ManualClock::new(t(0)));
        let wm = WatermarkTracker::new(clock.clone());
        assert_eq!(wm.max_event_time("q-0"), None);

        assert!(wm.advance("q-0", t(10)));
        clock.advance(Duration::seconds(1));
        assert!(wm.advance("q-0", t(30)));
        clock.advance(Duration::seconds(1));
        // Out of order earlier than max shouldn't decrease WM or count as progress
        assert!(!wm.advance("q-0", t(20)));
        assert!(!wm.advance("q-0", t(30)));
        assert_eq!(wm.max_event_time("q-0"), Some(t(30)));
        assert_eq!(wm.last_advanced_at("q-0"), Some(t(1)));
    }

    #[test]
    fn partitions_are_independent() {
        let wm = WatermarkTracker::new(Arc::new(ManualClock::new(t(0))));
        wm.advance("q-0", t(100));
        wm.advance("q-1", t(5));
        assert_eq!(wm.max_event_time("q-0"), Some(t(100)));
        assert_eq!(wm.max_event_time("q-1"), Some(t(5)));
        assert_eq!(wm.max_event_time("q-2"), None);
        let mut parts = wm.partitions();
        parts.sort();
        assert_eq!(parts, vec!["q-0".to_string(), "q-1".to_string()]);
    }

    #[test]
    fn concurrent_advances_keep_the_maximum() {
        let wm = Arc::new(WatermarkTracker::new(Arc::new(ManualClock::new(t(0)))));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let wm = wm.clone();
                std::thread::spawn(move || {
                    // each worker walks its own interleaving, some descending
                    for i in 0..200 {
                        let s = if worker % 2 == 0 { i } else { 199 - i };
                        wm.advance("q-0", t(s * 8 + worker));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wm.max_event_time("q-0"), Some(t(199 * 8 + 7)));
    }
}
