use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Attributes a provider reports for a live resource.
pub type Observed = BTreeMap<String, Value>;

/// A desired attribute value as written in the graph input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    /// A plain JSON value, used as-is.
    Literal(Value),
    /// Another resource's produced attribute. Implies a dependency edge.
    Ref(AttrRef),
    /// A managed secret. Only ever resolved to a [`SecretRef`], never to the
    /// secret's value.
    Secret(SecretSelector),
}

impl AttrValue {
    pub fn literal(value: impl Into<Value>) -> Self {
        AttrValue::Literal(value.into())
    }

    pub fn reference(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        AttrValue::Ref(AttrRef {
            resource: resource.into(),
            attribute: attribute.into(),
        })
    }

    pub fn secret(name: impl Into<String>) -> Self {
        AttrValue::Secret(SecretSelector {
            name: name.into(),
            version: None,
        })
    }

    pub fn is_secret(&self) -> bool {
        matches!(self, AttrValue::Secret(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttrRef {
    pub resource: String,
    pub attribute: String,
}

impl fmt::Display for AttrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// Names a secret and optionally pins a version. `None` follows the latest
/// version, so a rotation shows up as a change on every consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretSelector {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// Opaque pointer to one immutable secret version.
///
/// Renders as `<name>@<version>`. This token is the only form in which a
/// secret-typed attribute appears in plans, state, events, and outputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub version: u32,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    pub fn token(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for SecretRef {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) = s
            .rsplit_once('@')
            .ok_or_else(|| CoreError::InvalidSecretRef(s.to_string()))?;
        if name.is_empty() {
            return Err(CoreError::InvalidSecretRef(s.to_string()));
        }
        let version = version
            .parse::<u32>()
            .map_err(|_| CoreError::InvalidSecretRef(s.to_string()))?;
        Ok(SecretRef::new(name, version))
    }
}
