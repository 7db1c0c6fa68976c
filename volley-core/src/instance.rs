use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const ID_SEPARATOR: &str = ";";

/// One concrete time bucket for one partition of one named window.
///
/// Identity is the tuple (partition, namespace, window name, start, end, fire).
/// Every id derived from it is a pure function of those fields, so two nodes
/// (or a node replaying a checkpoint) always agree on the id of a bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowInstance {
    pub partition: String,
    pub namespace: String,
    pub window_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    /// Watermark observed when the instance was last touched.
    #[serde(default)]
    pub last_max_update_time: Option<DateTime<Utc>>,
}

impl WindowInstance {
    /// Creates an instance that fires when its window closes (fire time == end time).
    pub fn new(
        partition: impl Into<String>,
        namespace: impl Into<String>,
        window_name: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            partition: partition.into(),
            namespace: namespace.into(),
            window_name: window_name.into(),
            start_time,
            end_time,
            fire_time: end_time,
            last_max_update_time: None,
        }
    }

    pub fn with_fire_time(mut self, fire_time: DateTime<Utc>) -> Self {
        self.fire_time = fire_time;
        self
    }

    /// Tumbling bucket of `size` containing `ts`, aligned to the epoch.
    pub fn tumbling(
        partition: impl Into<String>,
        namespace: impl Into<String>,
        window_name: impl Into<String>,
        ts: DateTime<Utc>,
        size: Duration,
    ) -> Self {
        let size_ms = size.num_milliseconds().max(1);
        let start_ms = ts.timestamp_millis().div_euclid(size_ms) * size_ms;
        let start = DateTime::<Utc>::from_timestamp_millis(start_ms).unwrap_or_default();
        Self::new(partition, namespace, window_name, start, start + Duration::milliseconds(size_ms))
    }

    /// Whether the `;`-joined ids identify this instance unambiguously, i.e.
    /// no name component contains the separator.
    pub fn has_unambiguous_id(&self) -> bool {
        [&self.partition, &self.namespace, &self.window_name]
            .iter()
            .all(|part| !part.contains(ID_SEPARATOR))
    }

    /// Unique id of this bucket: partition, namespace, name, start, end and fire time.
    ///
    /// Components are joined without escaping; two instances whose names differ
    /// only in where a `;` falls share an id. See [`has_unambiguous_id`](Self::has_unambiguous_id).
    pub fn instance_id(&self) -> String {
        [
            self.partition.as_str(),
            self.namespace.as_str(),
            self.window_name.as_str(),
            &self.start_time.timestamp_millis().to_string(),
            &self.end_time.timestamp_millis().to_string(),
            &self.fire_time.timestamp_millis().to_string(),
        ]
        .join(ID_SEPARATOR)
    }

    /// Coarser id shared by every fire time of the same bucket in the same partition.
    pub fn instance_partition_id(&self) -> String {
        [
            self.partition.as_str(),
            self.namespace.as_str(),
            self.window_name.as_str(),
            &self.start_time.timestamp_millis().to_string(),
            &self.end_time.timestamp_millis().to_string(),
        ]
        .join(ID_SEPARATOR)
    }

    /// Partition-independent key of the bucket.
    pub fn window_instance_key(&self) -> String {
        [
            self.namespace.as_str(),
            self.window_name.as_str(),
            &self.start_time.timestamp_millis().to_string(),
            &self.end_time.timestamp_millis().to_string(),
        ]
        .join(ID_SEPARATOR)
    }

    pub fn same_identity(&self, other: &WindowInstance) -> bool {
        self.partition == other.partition
            && self.namespace == other.namespace
            && self.window_name == other.window_name
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.fire_time == other.fire_time
    }
}

/// Firing order: earliest fire time first; on equal fire times the most
/// recently started bucket first; instance id breaks any remaining tie.
pub fn fire_order(a: &WindowInstance, b: &WindowInstance) -> Ordering {
    a.fire_time
        .cmp(&b.fire_time)
        .then_with(|| b.start_time.cmp(&a.start_time))
        .then_with(|| a.instance_id().cmp(&b.instance_id()))
}

pub fn sort_for_firing(instances: &mut [WindowInstance]) {
    instances.sort_by(fire_order);
}

/// Lifecycle of a window instance as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    InFlight,
    Fired,
    /// Never registered, or fired long enough ago to have been forgotten.
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "PENDING",
            InstanceState::InFlight => "IN_FLIGHT",
            InstanceState::Fired => "FIRED",
            InstanceState::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}
