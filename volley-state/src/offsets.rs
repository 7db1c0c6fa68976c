use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};
use volley_core::{KvState, OffsetCheckpoint, PartitionOffsets, Result};

/// Maps a window instance id to the per-partition read offsets valid when it fired.
///
/// Entries are write-once. With a backend configured every write and delete is
/// mirrored to it (JSON under `ns_prefix + instance_id`) so a restarted engine can
/// `restore` what was recorded before it went down.
pub struct OffsetCheckpointStore {
    entries: RwLock<HashMap<String, OffsetCheckpoint>>,
    backend: Option<Arc<dyn KvState>>,
    ns_prefix: Vec<u8>,
}

impl Default for OffsetCheckpointStore {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            backend: None,
            ns_prefix: b"offsets:".to_vec(),
        }
    }
}

impl OffsetCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure an external KvState backend and a namespace prefix for persisted entries.
    pub fn with_backend(mut self, backend: Arc<dyn KvState>, ns_prefix: impl AsRef<[u8]>) -> Self {
        self.backend = Some(backend);
        self.ns_prefix = ns_prefix.as_ref().to_vec();
        self
    }

    fn make_key(&self, instance_id: &str) -> Vec<u8> {
        let mut k = self.ns_prefix.clone();
        k.extend_from_slice(instance_id.as_bytes());
        k
    }

    /// Stores `offsets` for `instance_id`. Returns `false` (and keeps the first
    /// entry) when offsets were already recorded for that instance.
    pub async fn record_offsets(&self, instance_id: &str, offsets: PartitionOffsets) -> Result<bool> {
        let checkpoint = {
            let mut entries = self.entries.write();
            if entries.contains_key(instance_id) {
                debug!(instance_id, "offsets already recorded, keeping first entry");
                return Ok(false);
            }
            let cp = OffsetCheckpoint::new(instance_id, offsets);
            entries.insert(instance_id.to_string(), cp.clone());
            cp
        };
        if let Some(backend) = &self.backend {
            let bytes = serde_json::to_vec(&checkpoint)?;
            backend.put(&self.make_key(instance_id), bytes).await?;
        }
        Ok(true)
    }

    pub fn get(&self, instance_id: &str) -> Option<PartitionOffsets> {
        self.entries.read().get(instance_id).map(|cp| cp.offsets.clone())
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.entries.read().contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn remove(&self, instance_id: &str) -> Result<Option<OffsetCheckpoint>> {
        let removed = self.entries.write().remove(instance_id);
        if removed.is_some() {
            if let Some(backend) = &self.backend {
                backend.delete(&self.make_key(instance_id)).await?;
            }
        }
        Ok(removed)
    }

    /// Drops every entry whose instance id fails `keep`; returns how many were dropped.
    pub async fn retain<F>(&self, keep: F) -> Result<usize>
    where
        F: Fn(&str) -> bool,
    {
        let dropped: Vec<String> = {
            let mut entries = self.entries.write();
            let ids: Vec<String> = entries.keys().filter(|id| !keep(id)).cloned().collect();
            for id in &ids {
                entries.remove(id);
            }
            ids
        };
        if let Some(backend) = &self.backend {
            for id in &dropped {
                backend.delete(&self.make_key(id)).await?;
            }
        }
        Ok(dropped.len())
    }

    /// Reloads persisted entries from the backend; entries already in memory win.
    pub async fn restore(&self) -> Result<usize> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        let persisted = backend.iter_prefix(Some(&self.ns_prefix)).await?;
        let mut restored = 0;
        let mut entries = self.entries.write();
        for (key, bytes) in persisted {
            match serde_json::from_slice::<OffsetCheckpoint>(&bytes) {
                Ok(cp) => {
                    if !entries.contains_key(&cp.window_instance_id) {
                        entries.insert(cp.window_instance_id.clone(), cp);
                        restored += 1;
                    }
                }
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(&key), error = %e, "skipping unreadable offset checkpoint");
                }
            }
        }
        Ok(restored)
    }
}
