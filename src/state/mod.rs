//! Durable operation state.
//!
//! Every operation is persisted as an `OperationRecord` after each decision
//! loop iteration so a restarted server can resume it with its chain intact.

mod store;

pub use store::{JsonFileStore, MemoryStore, OperationStore};
