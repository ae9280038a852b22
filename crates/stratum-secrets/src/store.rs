use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::RwLock;

use crate::error::SecretError;
use crate::policy::GenerationPolicy;
use crate::record::{SecretMeta, SecretRecord};
use crate::value::SecretValue;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Backend holding secret versions, e.g. a cloud secret manager.
///
/// Methods return boxed futures for dyn compatibility.
pub trait SecretStore: Send + Sync {
    /// Metadata for `name`, or `None` if the secret does not exist.
    fn describe<'a>(&'a self, name: &'a str)
        -> BoxFuture<'a, Result<Option<SecretMeta>, SecretError>>;

    /// Create the secret with `value` as version 1. Fails with
    /// [`SecretError::Conflict`] if the secret already exists.
    fn create<'a>(
        &'a self,
        name: &'a str,
        policy: Option<GenerationPolicy>,
        value: SecretValue,
    ) -> BoxFuture<'a, Result<u32, SecretError>>;

    /// Append a new version to an existing secret.
    fn append<'a>(&'a self, name: &'a str, value: SecretValue)
        -> BoxFuture<'a, Result<u32, SecretError>>;

    /// Read one version's value.
    fn access<'a>(&'a self, name: &'a str, version: u32)
        -> BoxFuture<'a, Result<SecretValue, SecretError>>;
}

/// In-process store. Backs tests and single-process runs.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn describe<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<SecretMeta>, SecretError>> {
        Box::pin(async move { Ok(self.records.read().await.get(name).map(|r| r.meta())) })
    }

    fn create<'a>(
        &'a self,
        name: &'a str,
        policy: Option<GenerationPolicy>,
        value: SecretValue,
    ) -> BoxFuture<'a, Result<u32, SecretError>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            if records.contains_key(name) {
                return Err(SecretError::Conflict {
                    name: name.to_string(),
                });
            }
            let mut record = SecretRecord::new(name, policy);
            let version = record.append(value);
            records.insert(name.to_string(), record);
            Ok(version)
        })
    }

    fn append<'a>(
        &'a self,
        name: &'a str,
        value: SecretValue,
    ) -> BoxFuture<'a, Result<u32, SecretError>> {
        Box::pin(async move {
            let mut records = self.records.write().await;
            let record = records.get_mut(name).ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
            })?;
            Ok(record.append(value))
        })
    }

    fn access<'a>(
        &'a self,
        name: &'a str,
        version: u32,
    ) -> BoxFuture<'a, Result<SecretValue, SecretError>> {
        Box::pin(async move {
            let records = self.records.read().await;
            let record = records.get(name).ok_or_else(|| SecretError::NotFound {
                name: name.to_string(),
            })?;
            record
                .value(version)
                .cloned()
                .ok_or_else(|| SecretError::VersionNotFound {
                    name: name.to_string(),
                    version,
                })
        })
    }
}
