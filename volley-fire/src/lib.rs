//! volley-fire: decides when window instances fire and fires each one exactly once.
//!
//! Building blocks:
//! - `WatermarkTracker`: per-partition max event time, monotone
//! - `FirePolicy`: grace period and partition-staleness eligibility
//! - `WindowInstanceRegistry`: pending set plus the fired ledger
//! - `InFlightSet`: claim markers released when the guard drops
//! - `FireBuffer`: per-partition batches flushed in firing order
//! - `FiringEngine`: the periodic scheduler tying it all together
//!
//! ```no_run
//! # async fn demo(window: std::sync::Arc<dyn volley_core::FireWindow>) {
//! use volley_fire::FiringEngine;
//!
//! let engine = FiringEngine::builder(&window).build();
//! engine.start();
//! // feed messages with engine.on_message(..)
//! engine.stop().await;
//! # }
//! ```

pub mod buffer;
pub mod dispatch;
pub mod eligibility;
pub mod engine;
pub mod inflight;
pub mod observer;
pub mod registry;
pub mod timer;
pub mod watermark;

pub use buffer::{FireBuffer, FlushReport};
pub use dispatch::{Dispatcher, FireTicket};
pub use eligibility::{Eligibility, FirePolicy, DEFAULT_GRACE_PERIOD_MS};
pub use engine::{EngineBuilder, FireAttempt, FiringEngine, TickReport};
pub use inflight::{InFlightGuard, InFlightSet};
pub use observer::{JsonlObserver, NoopObserver, TracingObserver};
pub use registry::WindowInstanceRegistry;
pub use timer::PeriodicTask;
pub use watermark::WatermarkTracker;
