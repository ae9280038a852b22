use std::fmt;

use serde::{Deserialize, Serialize};

use crate::kind::ResourceKind;

/// Kind-qualified identity of a resource, handed to provider clients.
///
/// Ids are unique within a graph on their own; the kind travels along so a
/// single provider client can route the call without a lookup.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ResourceAddr {
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceAddr {
    pub fn new(kind: ResourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.id)
    }
}
