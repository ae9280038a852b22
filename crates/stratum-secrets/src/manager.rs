use stratum_core::{SecretRef, SecretSelector};

use crate::error::SecretError;
use crate::policy::GenerationPolicy;
use crate::store::SecretStore;
use crate::value::SecretValue;

/// Generates, versions, and references secrets held in a [`SecretStore`].
///
/// Every operation except [`SecretManager::access`] returns a [`SecretRef`],
/// never a value.
#[derive(Debug)]
pub struct SecretManager<S> {
    store: S,
}

impl<S: SecretStore> SecretManager<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Make sure `name` has at least one version.
    ///
    /// Returns the latest reference and whether a value was generated. An
    /// existing secret is left untouched, so re-applying an unchanged graph
    /// never adds a version.
    pub async fn ensure(
        &self,
        name: &str,
        policy: &GenerationPolicy,
    ) -> Result<(SecretRef, bool), SecretError> {
        if let Some(latest) = self.latest(name).await? {
            tracing::debug!(secret = %latest, "secret already has a version, skipping generation");
            return Ok((latest, false));
        }

        match self.create(name, policy).await {
            Ok(created) => Ok((created, true)),
            // Lost a race with another writer; theirs is the first version.
            Err(SecretError::Conflict { .. }) => {
                let latest = self
                    .latest(name)
                    .await?
                    .ok_or_else(|| SecretError::NotFound {
                        name: name.to_string(),
                    })?;
                Ok((latest, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Generate and store the first version of a new secret.
    pub async fn create(
        &self,
        name: &str,
        policy: &GenerationPolicy,
    ) -> Result<SecretRef, SecretError> {
        let value = policy.generate()?;
        let version = self
            .store
            .create(name, Some(policy.clone()), value)
            .await?;
        let reference = SecretRef::new(name, version);
        tracing::info!(secret = %reference, "secret generated");
        Ok(reference)
    }

    /// Store a caller-supplied value as the first version of a new secret.
    pub async fn put(&self, name: &str, value: SecretValue) -> Result<SecretRef, SecretError> {
        if value.is_empty() {
            return Err(SecretError::InvalidPolicy(format!(
                "refusing to store an empty value for {name}"
            )));
        }
        let version = self.store.create(name, None, value).await?;
        let reference = SecretRef::new(name, version);
        tracing::info!(secret = %reference, "secret stored");
        Ok(reference)
    }

    /// Append a freshly generated version. Earlier versions stay readable.
    pub async fn rotate(&self, name: &str) -> Result<SecretRef, SecretError> {
        let meta = self
            .store
            .describe(name)
            .await?
            .ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
            })?;
        let policy = meta.policy.unwrap_or_default();
        let value = policy.generate()?;
        let version = self.store.append(name, value).await?;
        let reference = SecretRef::new(name, version);
        tracing::info!(secret = %reference, "secret rotated");
        Ok(reference)
    }

    pub async fn latest(&self, name: &str) -> Result<Option<SecretRef>, SecretError> {
        Ok(self
            .store
            .describe(name)
            .await?
            .and_then(|meta| meta.latest())
            .map(|version| SecretRef::new(name, version)))
    }

    pub async fn version_count(&self, name: &str) -> Result<usize, SecretError> {
        Ok(self
            .store
            .describe(name)
            .await?
            .map_or(0, |meta| meta.versions.len()))
    }

    /// Turn a selector into a concrete reference. A pinned version must
    /// exist; an unpinned selector follows the latest version.
    pub async fn resolve(&self, selector: &SecretSelector) -> Result<SecretRef, SecretError> {
        let meta = self
            .store
            .describe(&selector.name)
            .await?
            .ok_or_else(|| SecretError::NotFound {
                name: selector.name.clone(),
            })?;

        let version = match selector.version {
            Some(pinned) if meta.versions.iter().any(|v| v.number == pinned) => pinned,
            Some(pinned) => {
                return Err(SecretError::VersionNotFound {
                    name: selector.name.clone(),
                    version: pinned,
                })
            }
            None => meta.latest().ok_or_else(|| SecretError::NotFound {
                name: selector.name.clone(),
            })?,
        };
        Ok(SecretRef::new(selector.name.clone(), version))
    }

    /// Read the value behind a reference.
    ///
    /// This is the runtime binding channel for the resource that consumes
    /// the secret. Plans, state, events and outputs never go through here.
    pub async fn access(&self, reference: &SecretRef) -> Result<SecretValue, SecretError> {
        self.store.access(&reference.name, reference.version).await
    }
}
