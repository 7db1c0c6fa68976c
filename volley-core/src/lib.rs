//! volley-core: fundamental types and traits of the window instance firing engine.
//!
//! Goal: provide what the firing engine and the windows it serves agree on:
//! - `WindowInstance` and its deterministic ids, plus the firing order
//! - `WindowBaseValue`, the versioned aggregation row stored per instance
//! - Traits for the collaborators: `FireWindow`, `FireObserver`, `KvState`
//! - Configuration, a pluggable wall clock and prometheus metrics
//!
//! Quick example:
//! ```no_run
//! use std::sync::Arc;
//! use volley_core::{FireWindow, PartitionOffsets, SharedInstanceMap, WindowInstance};
//!
//! struct CountingWindow {
//!     instances: SharedInstanceMap,
//! }
//!
//! #[async_trait::async_trait]
//! impl FireWindow for CountingWindow {
//!     fn name(&self) -> &str { "counting" }
//!     fn max_event_time(&self, _partition: &str) -> Option<chrono::DateTime<chrono::Utc>> { None }
//!     fn max_allowed_gap_seconds(&self) -> Option<u64> { Some(30) }
//!     fn window_instance_map(&self) -> SharedInstanceMap { self.instances.clone() }
//!     async fn fire_window_instance(
//!         &self,
//!         _instance: &WindowInstance,
//!         _offsets: Option<&PartitionOffsets>,
//!     ) -> anyhow::Result<usize> {
//!         Ok(1)
//!     }
//! }
//! let _window: Arc<dyn FireWindow> = Arc::new(CountingWindow { instances: Default::default() });
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod instance;
pub mod metrics;
pub mod value;

pub use checkpoint::{OffsetCheckpoint, PartitionOffsets};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, EngineSettings};
pub use instance::{fire_order, sort_for_firing, InstanceState, WindowInstance};
pub use value::{PersistedMeta, WindowBaseValue};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("owning window is no longer available (instance {0})")]
    WindowGone(String),
    #[error("firing window instance {instance_id} failed: {cause:#}")]
    Fire { instance_id: String, cause: anyhow::Error },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("engine is shutting down")]
    Shutdown,
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Instances known to the engine, keyed by instance id, shared with the owning
/// window so it can observe what is currently pending.
pub type SharedInstanceMap = Arc<RwLock<HashMap<String, WindowInstance>>>;

/// The window whose instances are being fired. Implemented by the aggregation layer.
#[async_trait::async_trait]
pub trait FireWindow: Send + Sync {
    fn name(&self) -> &str;

    /// Highest event time the window has seen for `partition`, if any.
    fn max_event_time(&self, partition: &str) -> Option<DateTime<Utc>>;

    /// How long a partition may stay quiet before pending instances are forced out.
    fn max_allowed_gap_seconds(&self) -> Option<u64>;

    fn window_instance_map(&self) -> SharedInstanceMap;

    /// Emits the aggregated result of `instance`; returns how many rows were fired.
    async fn fire_window_instance(
        &self,
        instance: &WindowInstance,
        offsets: Option<&PartitionOffsets>,
    ) -> anyhow::Result<usize>;
}

/// Best-effort diagnostic sink notified whenever an instance goes in flight.
#[async_trait::async_trait]
pub trait FireObserver: Send + Sync {
    async fn on_in_flight(
        &self,
        instance: &WindowInstance,
        last_update: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait KvState: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<()>;
    async fn delete(&self, key: &[u8]) -> Result<()>;
    async fn iter_prefix(&self, prefix: Option<&[u8]>) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

pub mod prelude {
    pub use super::{
        Clock, EngineConfig, EngineSettings, Error, FireObserver, FireWindow, InstanceState, KvState,
        PartitionOffsets, Result, SharedInstanceMap, WindowBaseValue, WindowInstance,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fire_error_names_instance() {
        let err = Error::Fire {
            instance_id: "q;ns;w;0;1;1".into(),
            cause: anyhow::anyhow!("sink unavailable"),
        };
        let msg = err.to_string();
        assert!(msg.contains("q;ns;w;0;1;1"));
        assert!(msg.contains("sink unavailable"));
    }

    #[test]
    fn config_errors_convert_from_toml() {
        let err = EngineConfig::from_toml_str("[scheduler\nfire_interval = 1").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }
}
