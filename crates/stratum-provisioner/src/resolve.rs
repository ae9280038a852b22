use std::collections::{BTreeMap, HashMap};

use stratum_core::{AttrValue, Observed, ResourceSpec, ResourceState, SecretRef, SecretSelector};
use stratum_secrets::{SecretError, SecretManager, SecretStore};

use crate::provider::{ResolvedSpec, ResolvedValue};

/// Where dependency attributes are looked up during resolution.
pub(crate) trait ObservedSource {
    fn observed(&self, id: &str) -> Option<&Observed>;
}

/// During apply only Ready dependencies are visible.
impl ObservedSource for HashMap<String, ResourceState> {
    fn observed(&self, id: &str) -> Option<&Observed> {
        self.get(id).filter(|s| s.is_ready()).map(|s| &s.observed)
    }
}

impl ObservedSource for HashMap<String, Observed> {
    fn observed(&self, id: &str) -> Option<&Observed> {
        self.get(id)
    }
}

/// Known versions per secret name, as reported by the secret store.
#[derive(Debug, Clone, Default)]
pub(crate) struct SecretIndex {
    versions: HashMap<String, Vec<u32>>,
}

impl SecretIndex {
    pub(crate) async fn load<'n, S: SecretStore>(
        manager: &SecretManager<S>,
        names: impl IntoIterator<Item = &'n str>,
    ) -> Result<Self, SecretError> {
        let mut versions = HashMap::new();
        for name in names {
            if versions.contains_key(name) {
                continue;
            }
            let known = manager
                .store()
                .describe(name)
                .await?
                .map(|meta| meta.versions.iter().map(|v| v.number).collect())
                .unwrap_or_default();
            versions.insert(name.to_string(), known);
        }
        Ok(Self { versions })
    }

    pub(crate) fn latest(&self, name: &str) -> Option<SecretRef> {
        self.versions
            .get(name)
            .and_then(|v| v.iter().max())
            .map(|&n| SecretRef::new(name, n))
    }

    /// A pinned selector resolves only if that version exists; an unpinned
    /// one follows the latest. Anything else is still pending generation.
    pub(crate) fn resolve(&self, selector: &SecretSelector) -> ResolvedValue {
        let found = match selector.version {
            Some(pinned) => self
                .versions
                .get(&selector.name)
                .filter(|v| v.contains(&pinned))
                .map(|_| SecretRef::new(selector.name.clone(), pinned)),
            None => self.latest(&selector.name),
        };
        match found {
            Some(r) => ResolvedValue::Secret(r),
            None => ResolvedValue::PendingSecret(selector.name.clone()),
        }
    }
}

/// Resolve every desired attribute of `spec`.
///
/// A reference is taken from the dependency's observed attributes only;
/// until the dependency has been provisioned it stays
/// [`ResolvedValue::Unknown`]. Secrets resolve to references only.
pub(crate) fn resolve_spec(
    spec: &ResourceSpec,
    observed: &impl ObservedSource,
    secrets: &SecretIndex,
) -> ResolvedSpec {
    let attributes: BTreeMap<String, ResolvedValue> = spec
        .attributes
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                AttrValue::Literal(v) => ResolvedValue::Known(v.clone()),
                AttrValue::Secret(selector) => secrets.resolve(selector),
                AttrValue::Ref(r) => observed
                    .observed(&r.resource)
                    .and_then(|o| o.get(&r.attribute))
                    .cloned()
                    .map_or(ResolvedValue::Unknown, ResolvedValue::Known),
            };
            (key.clone(), resolved)
        })
        .collect();

    ResolvedSpec {
        id: spec.id.clone(),
        kind: spec.kind,
        attributes,
    }
}

/// First attribute that could not be resolved, for apply-time failures.
pub(crate) fn first_unresolved(spec: &ResolvedSpec) -> Option<(&str, &ResolvedValue)> {
    spec.attributes
        .iter()
        .find(|(_, v)| !v.is_known())
        .map(|(k, v)| (k.as_str(), v))
}

/// Make provider-reported attributes safe to persist: secret-typed keys
/// hold the reference token, and desired keys the provider did not echo
/// are recorded as applied.
pub(crate) fn sanitize_observed(mut observed: Observed, spec: &ResolvedSpec) -> Observed {
    for (key, value) in &spec.attributes {
        match value {
            ResolvedValue::Secret(_) | ResolvedValue::PendingSecret(_) => {
                observed.insert(key.clone(), value.render());
            }
            _ => {
                observed.entry(key.clone()).or_insert_with(|| value.render());
            }
        }
    }
    observed
}
