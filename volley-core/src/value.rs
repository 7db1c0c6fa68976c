use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::WindowInstance;

/// Bookkeeping timestamps shared by every persisted value type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedMeta {
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl PersistedMeta {
    pub fn now() -> Self {
        let now = Utc::now();
        Self { created_at: now, modified_at: now }
    }

    pub fn touch(&mut self) {
        self.modified_at = Utc::now().max(self.modified_at);
    }
}

impl Default for PersistedMeta {
    fn default() -> Self {
        Self::now()
    }
}

/// One group-by row of aggregation state living inside a window instance.
///
/// The aggregation payload itself belongs to the owning window; this type only
/// carries the identity and versioning needed to store, dedup and merge rows.
#[derive(Debug, Serialize, Deserialize)]
pub struct WindowBaseValue {
    #[serde(flatten)]
    pub meta: PersistedMeta,
    /// `partition;namespace;window;start;fire;group_by`, unique per aggregation row.
    pub msg_key: String,
    /// Back-reference to the parent instance; not an owning link.
    pub window_instance_id: String,
    pub window_instance_partition_id: String,
    pub partition: String,
    /// Per-partition sequence number used to order and dedup rows on replay.
    pub partition_num: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub fire_time: DateTime<Utc>,
    update_version: AtomicU64,
}

impl WindowBaseValue {
    pub fn new(instance: &WindowInstance, group_by: &str, partition_num: u64) -> Self {
        Self {
            meta: PersistedMeta::now(),
            msg_key: Self::msg_key_for(instance, group_by),
            window_instance_id: instance.instance_id(),
            window_instance_partition_id: instance.instance_partition_id(),
            partition: instance.partition.clone(),
            partition_num,
            start_time: instance.start_time,
            end_time: instance.end_time,
            fire_time: instance.fire_time,
            update_version: AtomicU64::new(0),
        }
    }

    pub fn msg_key_for(instance: &WindowInstance, group_by: &str) -> String {
        format!(
            "{};{};{};{};{};{}",
            instance.partition,
            instance.namespace,
            instance.window_name,
            instance.start_time.timestamp_millis(),
            instance.fire_time.timestamp_millis(),
            group_by
        )
    }

    pub fn update_version(&self) -> u64 {
        self.update_version.load(Ordering::SeqCst)
    }

    /// Bumps the version and returns the new value.
    pub fn increment_update_version(&self) -> u64 {
        self.update_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Records one mutation of the row: new version plus a fresh `modified_at`.
    pub fn record_update(&mut self) -> u64 {
        self.meta.touch();
        self.increment_update_version()
    }

    /// Adopts a version seen elsewhere (replay, concurrent merge) if it is newer.
    /// Returns the version in effect afterwards.
    pub fn observe_version(&self, version: u64) -> u64 {
        let prev = self.update_version.fetch_max(version, Ordering::SeqCst);
        prev.max(version)
    }

    /// True when `other` carries changes this row has not seen yet.
    pub fn is_stale_against(&self, other: &WindowBaseValue) -> bool {
        self.msg_key == other.msg_key && other.update_version() > self.update_version()
    }
}

impl Clone for WindowBaseValue {
    fn clone(&self) -> Self {
        Self {
            meta: self.meta,
            msg_key: self.msg_key.clone(),
            window_instance_id: self.window_instance_id.clone(),
            window_instance_partition_id: self.window_instance_partition_id.clone(),
            partition: self.partition.clone(),
            partition_num: self.partition_num,
            start_time: self.start_time,
            end_time: self.end_time,
            fire_time: self.fire_time,
            update_version: AtomicU64::new(self.update_version()),
        }
    }
}

impl PartialEq for WindowBaseValue {
    fn eq(&self, other: &Self) -> bool {
        self.meta == other.meta
            && self.msg_key == other.msg_key
            && self.window_instance_id == other.window_instance_id
            && self.window_instance_partition_id == other.window_instance_partition_id
            && self.partition == other.partition
            && self.partition_num == other.partition_num
            && self.start_time == other.start_time
            && self.end_time == other.end_time
            && self.fire_time == other.fire_time
            && self.update_version() == other.update_version()
    }
}
