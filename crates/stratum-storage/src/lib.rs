//! stratum-storage
//!
//! Persisted state snapshot for the provisioning engine. Thin layer over the
//! local filesystem: versioned JSON, atomic writes, and a lock file that keeps
//! two runs from interleaving writes.

pub mod error;
pub mod lock;
pub mod snapshot;
pub mod store;

pub use crate::error::StorageError;
pub use crate::lock::StateLock;
pub use crate::snapshot::{Snapshot, SnapshotEntry, SNAPSHOT_VERSION};
pub use crate::store::StateStore;
