//! stratum-secrets
//!
//! Secret lifecycle: generate values from a composition policy, store them as
//! immutable versions, and hand out `name@version` references. Raw values
//! leave this crate only through [`SecretManager::access`], the channel a
//! consuming runtime uses to bind a reference.

pub mod error;
pub mod manager;
pub mod policy;
pub mod record;
pub mod store;
pub mod value;

pub use crate::error::SecretError;
pub use crate::manager::SecretManager;
pub use crate::policy::GenerationPolicy;
pub use crate::record::{SecretMeta, SecretRecord, VersionMeta};
pub use crate::store::{MemorySecretStore, SecretStore};
pub use crate::value::SecretValue;
