//! Persistence contract and the in-memory backend.
//!
//! The engine talks to storage only through [`CounterStore`]. The in-memory
//! backend is intended for embedded usage, tests, and as a reference.

mod memory;
mod traits;

pub use memory::InMemoryCounterStore;
pub use traits::{CounterStore, StorageError};
