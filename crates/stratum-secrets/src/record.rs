use serde::{Deserialize, Serialize};

use crate::policy::GenerationPolicy;
use crate::value::SecretValue;

/// Metadata of one stored version. Never carries the value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMeta {
    pub number: u32,
    pub created_at: jiff::Timestamp,
}

/// Everything about a secret except its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretMeta {
    pub name: String,
    /// `None` for secrets whose value was supplied rather than generated.
    pub policy: Option<GenerationPolicy>,
    pub versions: Vec<VersionMeta>,
}

impl SecretMeta {
    pub fn latest(&self) -> Option<u32> {
        self.versions.last().map(|v| v.number)
    }
}

#[derive(Debug, Clone)]
struct StoredVersion {
    meta: VersionMeta,
    value: SecretValue,
}

/// A named secret and its append-only version list.
///
/// Versions are numbered from 1 and never modified once stored.
#[derive(Debug, Clone)]
pub struct SecretRecord {
    name: String,
    policy: Option<GenerationPolicy>,
    versions: Vec<StoredVersion>,
}

impl SecretRecord {
    pub fn new(name: impl Into<String>, policy: Option<GenerationPolicy>) -> Self {
        Self {
            name: name.into(),
            policy,
            versions: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> Option<&GenerationPolicy> {
        self.policy.as_ref()
    }

    /// Store `value` as the next version and return its number.
    pub fn append(&mut self, value: SecretValue) -> u32 {
        let number = self.versions.len() as u32 + 1;
        self.versions.push(StoredVersion {
            meta: VersionMeta {
                number,
                created_at: jiff::Timestamp::now(),
            },
            value,
        });
        number
    }

    pub fn value(&self, version: u32) -> Option<&SecretValue> {
        self.versions
            .iter()
            .find(|v| v.meta.number == version)
            .map(|v| &v.value)
    }

    pub fn meta(&self) -> SecretMeta {
        SecretMeta {
            name: self.name.clone(),
            policy: self.policy.clone(),
            versions: self.versions.iter().map(|v| v.meta.clone()).collect(),
        }
    }
}
