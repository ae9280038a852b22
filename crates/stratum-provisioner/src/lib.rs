//! stratum-provisioner
//!
//! Dependency-ordered provisioning engine. Validates a resource graph,
//! schedules it into waves, and reconciles each resource against a provider
//! client, a secret manager, and a persisted state snapshot.
//!
//! Public API:
//! - `ResourceGraph::build()`: validate specs into an acyclic graph
//! - `Schedule::build()`: group a graph into dependency waves
//! - `Engine::plan()`: refresh state and compute the actions an apply would take
//! - `Engine::apply()`: converge, wave by wave, and resolve outputs
//! - `Engine::destroy()`: tear down everything in state, dependents first
//! - `Engine::rotate_secret()`: append a new secret version

pub mod config;
mod diff;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod outputs;
pub mod plan;
pub mod provider;
mod reconcile;
mod resolve;
pub mod retry;
pub mod scheduler;
pub mod waiter;

pub use crate::config::{load_config, save_config, EngineConfig, RetryConfig, WaitConfig};
pub use crate::engine::{ApplyOptions, ApplyOutcome, ApplyReport, Engine};
pub use crate::error::{
    format_err_chain, PermanentClass, ProviderError, ProvisionerError, ValidationError,
};
pub use crate::events::{ApplyEvent, EventSink, WaitStrategyKind};
pub use crate::graph::ResourceGraph;
pub use crate::outputs::{resolve_outputs, OutputDef, OutputExpr, ResolvedOutput};
pub use crate::plan::{Action, Cause, FieldDrift, Plan, PlanEntry, PlanSummary};
pub use crate::provider::{BoxFuture, ProviderClient, ResolvedSpec, ResolvedValue, KNOWN_AFTER_APPLY};
pub use crate::retry::{with_retry, OperationError};
pub use crate::scheduler::Schedule;
pub use crate::waiter::{wait_until_ready, WaitError, WaitOutcome};
