use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde_json::Value;
use stratum_core::{Observed, ResourceAddr, ResourceKind, SecretRef};

use crate::error::ProviderError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Rendering of a reference whose target has not been created yet.
pub const KNOWN_AFTER_APPLY: &str = "(known after apply)";

/// A desired attribute after references and secrets have been looked up.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedValue {
    Known(Value),
    /// Secret-typed attribute. Only the reference is carried; the consuming
    /// runtime binds it through the secret manager.
    Secret(SecretRef),
    /// A secret whose first version has not been generated yet. Plan-only.
    PendingSecret(String),
    /// Produced by a dependency that has not been created yet. Plan-only.
    Unknown,
}

impl ResolvedValue {
    /// JSON rendering used in plans, state, and drift comparison. Secrets
    /// render as their `name@version` token.
    pub fn render(&self) -> Value {
        match self {
            ResolvedValue::Known(v) => v.clone(),
            ResolvedValue::Secret(r) => Value::String(r.token()),
            ResolvedValue::PendingSecret(name) => Value::String(format!("{name}@pending")),
            ResolvedValue::Unknown => Value::String(KNOWN_AFTER_APPLY.to_string()),
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, ResolvedValue::Known(_) | ResolvedValue::Secret(_))
    }
}

/// A spec with every attribute resolved, handed to the provider client.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedSpec {
    pub id: String,
    pub kind: ResourceKind,
    pub attributes: BTreeMap<String, ResolvedValue>,
}

impl ResolvedSpec {
    pub fn addr(&self) -> ResourceAddr {
        ResourceAddr::new(self.kind, self.id.clone())
    }

    pub fn get(&self, key: &str) -> Option<&ResolvedValue> {
        self.attributes.get(key)
    }

    /// All attributes rendered to JSON, secrets as tokens.
    pub fn rendered(&self) -> BTreeMap<String, Value> {
        self.attributes
            .iter()
            .map(|(k, v)| (k.clone(), v.render()))
            .collect()
    }

    /// Keys whose values are secret references.
    pub fn secret_keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().filter_map(|(k, v)| match v {
            ResolvedValue::Secret(_) | ResolvedValue::PendingSecret(_) => Some(k.as_str()),
            _ => None,
        })
    }
}

/// The only boundary to the cloud backend.
///
/// One implementation serves every [`ResourceKind`] and matches on
/// `spec.kind` internally. Errors must be classified as transient or
/// permanent; the reconciler retries only the former.
pub trait ProviderClient: Send + Sync {
    /// Create the resource and return what the backend reports for it.
    fn create<'a>(
        &'a self,
        spec: &'a ResolvedSpec,
    ) -> BoxFuture<'a, Result<Observed, ProviderError>>;

    /// Read the live resource. `None` = it no longer exists.
    fn read<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        observed: &'a Observed,
    ) -> BoxFuture<'a, Result<Option<Observed>, ProviderError>>;

    /// Change mutable attributes in place.
    fn update<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        spec: &'a ResolvedSpec,
        observed: &'a Observed,
    ) -> BoxFuture<'a, Result<Observed, ProviderError>>;

    fn destroy<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        observed: &'a Observed,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;

    /// Readiness predicate for eventually consistent kinds.
    ///
    /// Returns `None` when the backend offers no way to check, in which
    /// case the waiter falls back to a fixed delay.
    fn readiness<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        observed: &'a Observed,
    ) -> Option<BoxFuture<'a, Result<bool, ProviderError>>> {
        let _ = (addr, observed);
        None
    }
}
