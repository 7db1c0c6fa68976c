use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Read position per source partition (queue/shard id -> opaque offset).
pub type PartitionOffsets = BTreeMap<String, String>;

/// Offsets captured when a window instance is fired, so consumption can resume
/// from the position the emitted result corresponds to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OffsetCheckpoint {
    pub window_instance_id: String,
    pub offsets: PartitionOffsets,
    pub recorded_at: DateTime<Utc>,
}

impl OffsetCheckpoint {
    pub fn new(window_instance_id: impl Into<String>, offsets: PartitionOffsets) -> Self {
        Self {
            window_instance_id: window_instance_id.into(),
            offsets,
            recorded_at: Utc::now(),
        }
    }
}
