use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// The closed set of resource kinds a graph may contain.
///
/// Each kind carries a static contract: which attributes it produces for
/// dependents to reference, which desired attributes force a replacement when
/// changed, and whether the backend reports "created" before the resource is
/// actually usable.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    Subnet,
    PrivateConnection,
    Connector,
    ManagedDatabase,
    DatabaseUser,
    Secret,
    SecretVersion,
    Registry,
    ComputeService,
    IamBinding,
    LogMetric,
    LogSink,
    AlertPolicy,
    Dashboard,
}

/// Whether a kind is safe to consume as soon as its create call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Immediate,
    /// Create returns before dependents can use the resource; the
    /// reconciler waits on a readiness predicate (or a fixed fallback delay).
    Eventual,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 15] = [
        ResourceKind::Network,
        ResourceKind::Subnet,
        ResourceKind::PrivateConnection,
        ResourceKind::Connector,
        ResourceKind::ManagedDatabase,
        ResourceKind::DatabaseUser,
        ResourceKind::Secret,
        ResourceKind::SecretVersion,
        ResourceKind::Registry,
        ResourceKind::ComputeService,
        ResourceKind::IamBinding,
        ResourceKind::LogMetric,
        ResourceKind::LogSink,
        ResourceKind::AlertPolicy,
        ResourceKind::Dashboard,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::PrivateConnection => "private-connection",
            ResourceKind::Connector => "connector",
            ResourceKind::ManagedDatabase => "managed-database",
            ResourceKind::DatabaseUser => "database-user",
            ResourceKind::Secret => "secret",
            ResourceKind::SecretVersion => "secret-version",
            ResourceKind::Registry => "registry",
            ResourceKind::ComputeService => "compute-service",
            ResourceKind::IamBinding => "iam-binding",
            ResourceKind::LogMetric => "log-metric",
            ResourceKind::LogSink => "log-sink",
            ResourceKind::AlertPolicy => "alert-policy",
            ResourceKind::Dashboard => "dashboard",
        }
    }

    /// Attributes the backend fills in on create, available to dependents
    /// through `AttrValue::Ref`. Every kind produces `id`.
    pub fn producible_attributes(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Network => &["id", "name", "self_link"],
            ResourceKind::Subnet => &["id", "name", "self_link", "ip_cidr_range", "gateway_address"],
            ResourceKind::PrivateConnection => &["id", "network", "peering", "reserved_range"],
            ResourceKind::Connector => &["id", "name", "self_link", "state"],
            ResourceKind::ManagedDatabase => &[
                "id",
                "name",
                "connection_name",
                "private_ip_address",
                "public_ip_address",
                "self_link",
            ],
            ResourceKind::DatabaseUser => &["id", "name", "instance"],
            ResourceKind::Secret => &["id", "name", "secret_id"],
            ResourceKind::SecretVersion => &["id", "secret", "version", "ref"],
            ResourceKind::Registry => &["id", "name", "repository_url"],
            ResourceKind::ComputeService => &["id", "name", "url", "latest_revision", "service_account"],
            ResourceKind::IamBinding => &["id", "etag"],
            ResourceKind::LogMetric => &["id", "name"],
            ResourceKind::LogSink => &["id", "name", "writer_identity"],
            ResourceKind::AlertPolicy => &["id", "name"],
            ResourceKind::Dashboard => &["id"],
        }
    }

    /// Desired attributes that cannot be changed in place; a mismatch on any
    /// of these plans a replacement instead of an update.
    pub fn immutable_attributes(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Network => &["name", "auto_create_subnetworks"],
            ResourceKind::Subnet => &["name", "network", "region"],
            ResourceKind::PrivateConnection => &["network", "service"],
            ResourceKind::Connector => &["name", "region", "network", "ip_cidr_range"],
            ResourceKind::ManagedDatabase => &["name", "region", "database_version"],
            ResourceKind::DatabaseUser => &["name", "instance"],
            ResourceKind::Secret => &["secret_id", "replication"],
            ResourceKind::SecretVersion => &["secret"],
            ResourceKind::Registry => &["name", "location", "format"],
            ResourceKind::ComputeService => &["name", "location"],
            ResourceKind::IamBinding => &["resource", "role"],
            ResourceKind::LogMetric => &["name"],
            ResourceKind::LogSink => &["name"],
            ResourceKind::AlertPolicy => &[],
            ResourceKind::Dashboard => &[],
        }
    }

    pub fn consistency(&self) -> Consistency {
        match self {
            ResourceKind::PrivateConnection
            | ResourceKind::Connector
            | ResourceKind::ManagedDatabase
            | ResourceKind::IamBinding
            | ResourceKind::ComputeService => Consistency::Eventual,
            _ => Consistency::Immediate,
        }
    }

    pub fn is_producible(&self, attribute: &str) -> bool {
        self.producible_attributes().contains(&attribute)
    }

    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable_attributes().contains(&attribute)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}
