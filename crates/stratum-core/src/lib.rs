//! stratum-core
//!
//! Pure domain vocabulary for the provisioning engine: resource kinds, specs,
//! attribute values, secret references, and per-run resource state.
//! No provider, storage, or secret-store dependency lives here.

pub mod addr;
pub mod error;
pub mod kind;
pub mod spec;
pub mod state;
pub mod value;

pub use crate::addr::ResourceAddr;
pub use crate::error::CoreError;
pub use crate::kind::{Consistency, ResourceKind};
pub use crate::spec::ResourceSpec;
pub use crate::state::{FailureKind, ResourceError, ResourceState, ResourceStatus};
pub use crate::value::{AttrRef, AttrValue, Observed, SecretRef, SecretSelector};
