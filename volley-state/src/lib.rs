//! volley-state: state layer
//! Provides the `InMemoryState` key/value backend and the offset checkpoint store.

pub mod mem;
pub mod offsets;

pub use mem::InMemoryState;
pub use offsets::OffsetCheckpointStore;
