use serde_json::Value;
use stratum_core::{Observed, ResourceKind, SecretRef};
use stratum_storage::SnapshotEntry;

use crate::plan::{Action, Cause, FieldDrift};
use crate::provider::ResolvedSpec;

/// What is known about a resource before deciding its action.
#[derive(Debug, Clone, Default)]
pub(crate) struct Baseline {
    /// Last persisted entry, already updated by refresh.
    pub entry: Option<SnapshotEntry>,
    /// Refresh found the resource gone from the provider.
    pub missing: bool,
    /// Refresh found live attributes different from the persisted ones.
    pub drifted: bool,
}

impl Baseline {
    pub(crate) fn observed(&self) -> Option<&Observed> {
        self.entry.as_ref().map(|e| &e.observed)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Decision {
    pub action: Action,
    pub cause: Cause,
    pub drift: Vec<FieldDrift>,
}

impl Decision {
    fn new(action: Action, cause: Cause) -> Self {
        Self {
            action,
            cause,
            drift: Vec::new(),
        }
    }
}

/// Field-level comparison of desired attributes against observed ones.
/// Only desired keys are compared; extra produced attributes are ignored.
pub(crate) fn diff_attributes(spec: &ResolvedSpec, observed: &Observed) -> Vec<FieldDrift> {
    spec.attributes
        .iter()
        .filter_map(|(field, value)| {
            let expected = value.render();
            let actual = observed.get(field).cloned().unwrap_or(Value::Null);
            (expected != actual).then(|| FieldDrift {
                field: field.clone(),
                expected,
                actual,
                immutable: spec.kind.is_immutable(field),
            })
        })
        .collect()
}

/// Choose the action for a provider-backed resource.
pub(crate) fn decide(spec: &ResolvedSpec, baseline: &Baseline) -> Decision {
    let Some(entry) = &baseline.entry else {
        let cause = if baseline.missing {
            Cause::Missing
        } else {
            Cause::FirstProvision
        };
        return Decision::new(Action::Create, cause);
    };

    if entry.kind != spec.kind {
        return kind_changed(entry, spec.kind);
    }

    if !entry.is_ready() {
        // Something may exist half-built; start over from scratch.
        return if entry.observed.is_empty() {
            Decision::new(Action::Create, Cause::FirstProvision)
        } else {
            Decision::new(Action::Replace, Cause::Tainted)
        };
    }

    let drift = diff_attributes(spec, &entry.observed);
    if drift.is_empty() {
        return Decision::new(Action::NoOp, Cause::InSync);
    }

    let action = if drift.iter().any(|d| d.immutable) {
        Action::Replace
    } else {
        Action::Update
    };
    let cause = if baseline.drifted {
        Cause::Drift
    } else {
        Cause::SpecChanged
    };
    Decision {
        action,
        cause,
        drift,
    }
}

/// The persisted resource has to go before one of the new kind is created.
/// With nothing observed there is nothing to tear down.
fn kind_changed(entry: &SnapshotEntry, desired: ResourceKind) -> Decision {
    if entry.observed.is_empty() {
        return Decision::new(Action::Create, Cause::KindChanged);
    }
    Decision {
        action: Action::Replace,
        cause: Cause::KindChanged,
        drift: vec![FieldDrift {
            field: "kind".to_string(),
            expected: Value::String(desired.to_string()),
            actual: Value::String(entry.kind.to_string()),
            immutable: true,
        }],
    }
}

/// Choose the action for a `secret-version` resource. The secret store is
/// the source of truth; existing versions are never replaced.
pub(crate) fn decide_secret(baseline: &Baseline, latest: Option<&SecretRef>) -> Decision {
    if let Some(entry) = baseline
        .entry
        .as_ref()
        .filter(|e| e.kind != ResourceKind::SecretVersion)
    {
        return kind_changed(entry, ResourceKind::SecretVersion);
    }

    let Some(latest) = latest else {
        let cause = if baseline.entry.is_some() || baseline.missing {
            Cause::Missing
        } else {
            Cause::FirstProvision
        };
        return Decision::new(Action::Create, cause);
    };

    let Some(entry) = baseline.entry.as_ref() else {
        return Decision::new(Action::Create, Cause::FirstProvision);
    };
    if !entry.is_ready() {
        return Decision::new(Action::Create, Cause::Tainted);
    }

    let expected = Value::String(latest.token());
    let actual = entry.observed.get("ref").cloned().unwrap_or(Value::Null);
    if expected == actual {
        return Decision::new(Action::NoOp, Cause::InSync);
    }
    Decision {
        action: Action::Update,
        cause: Cause::Drift,
        drift: vec![FieldDrift {
            field: "ref".to_string(),
            expected,
            actual,
            immutable: ResourceKind::SecretVersion.is_immutable("ref"),
        }],
    }
}
