use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::addr::ResourceAddr;
use crate::kind::ResourceKind;
use crate::value::{AttrRef, AttrValue, SecretSelector};

/// Every resource in a graph is declared as a `ResourceSpec`.
///
/// Holds the desired state for one resource. It is built from the
/// graph input at plan time and never mutated during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Unique within the graph, e.g. "vpc" or "db-password"
    pub id: String,
    pub kind: ResourceKind,
    /// Desired attributes. Values may reference other resources or secrets.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    /// Explicit ordering hints on top of the edges implied by references.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceSpec {
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn addr(&self) -> ResourceAddr {
        ResourceAddr::new(self.kind, self.id.clone())
    }

    /// Set a literal attribute.
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes
            .insert(key.into(), AttrValue::Literal(value.into()));
        self
    }

    /// Set an attribute to another resource's produced attribute.
    pub fn reference(
        mut self,
        key: impl Into<String>,
        resource: impl Into<String>,
        attribute: impl Into<String>,
    ) -> Self {
        self.attributes
            .insert(key.into(), AttrValue::reference(resource, attribute));
        self
    }

    /// Bind an attribute to the latest version of a managed secret.
    pub fn secret(mut self, key: impl Into<String>, name: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), AttrValue::secret(name));
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// All attribute references, in attribute-key order.
    pub fn references(&self) -> impl Iterator<Item = &AttrRef> {
        self.attributes.values().filter_map(|v| match v {
            AttrValue::Ref(r) => Some(r),
            _ => None,
        })
    }

    /// All secret selectors, in attribute-key order.
    pub fn secret_selectors(&self) -> impl Iterator<Item = &SecretSelector> {
        self.attributes.values().filter_map(|v| match v {
            AttrValue::Secret(s) => Some(s),
            _ => None,
        })
    }

    /// Explicit dependencies followed by reference targets, deduplicated,
    /// first occurrence wins.
    pub fn declared_dependencies(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let refs = self.references().map(|r| &r.resource);
        for id in self.depends_on.iter().chain(refs) {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }

    /// The literal string value of an attribute, if it is one.
    pub fn literal_str(&self, key: &str) -> Option<&str> {
        match self.attributes.get(key) {
            Some(AttrValue::Literal(Value::String(s))) => Some(s),
            _ => None,
        }
    }

    /// For `secret-version` resources: the name of the secret it manages.
    pub fn managed_secret_name(&self) -> Option<&str> {
        if self.kind == ResourceKind::SecretVersion {
            self.literal_str("secret")
        } else {
            None
        }
    }
}
