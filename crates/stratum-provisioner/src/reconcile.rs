use std::collections::{BTreeMap, HashMap, HashSet};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use stratum_core::{
    AttrValue, Consistency, FailureKind, Observed, ResourceAddr, ResourceError, ResourceKind,
    ResourceSpec, ResourceState, ResourceStatus, SecretRef,
};
use stratum_secrets::{GenerationPolicy, SecretError, SecretManager, SecretStore};
use stratum_storage::SnapshotEntry;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::diff::{decide, decide_secret, Baseline, Decision};
use crate::error::{format_err_chain, ProvisionerError};
use crate::events::{ApplyEvent, EventSink};
use crate::graph::ResourceGraph;
use crate::plan::Action;
use crate::provider::{ProviderClient, ResolvedSpec};
use crate::resolve::{first_unresolved, resolve_spec, sanitize_observed, SecretIndex};
use crate::retry::{with_retry, OperationError};
use crate::scheduler::Schedule;
use crate::waiter::{wait_until_ready, WaitError, WaitOutcome};

/// Result of reconciling one resource.
#[derive(Debug)]
pub(crate) struct NodeOutcome {
    pub state: ResourceState,
    /// `None` when the run failed before an action was chosen.
    pub action: Option<Action>,
}

#[derive(Debug)]
pub(crate) struct WaveRun {
    pub states: HashMap<String, ResourceState>,
    pub actions: HashMap<String, Action>,
    pub cancelled: bool,
}

#[derive(Debug)]
pub(crate) struct TeardownRun {
    /// In teardown order; resources never reached stay Pending.
    pub states: Vec<ResourceState>,
    pub cancelled: bool,
}

/// Drives resources toward their desired state, one wave at a time.
///
/// Only this type mutates [`ResourceState`]. Every mutation goes through
/// [`ResourceState::transition`], so status never regresses within a run.
pub(crate) struct Reconciler<'a, P, S> {
    pub provider: &'a P,
    pub secrets: &'a SecretManager<S>,
    pub config: &'a EngineConfig,
    pub events: &'a EventSink,
    pub cancel: &'a CancellationToken,
}

impl<P: ProviderClient, S: SecretStore> Reconciler<'_, P, S> {
    // ── Apply ────────────────────────────────────────────────────

    /// Run every wave of `schedule`. Waves are sequential; resources
    /// within a wave run concurrently up to `max_parallel`. Results are
    /// merged after each wave, so a wave only ever sees settled states.
    pub(crate) async fn apply(
        &self,
        graph: &ResourceGraph,
        schedule: &Schedule,
        baselines: &HashMap<String, Baseline>,
    ) -> Result<WaveRun, ProvisionerError> {
        let mut states: HashMap<String, ResourceState> = graph
            .specs()
            .iter()
            .map(|s| (s.id.clone(), ResourceState::pending(s.id.clone(), s.kind)))
            .collect();
        let mut actions = HashMap::new();
        let no_baseline = Baseline::default();

        for (index, wave) in schedule.waves().iter().enumerate() {
            if self.cancel.is_cancelled() {
                let remaining_waves = schedule.len() - index;
                tracing::warn!(wave = index, remaining_waves, "apply cancelled, not starting further waves");
                self.events.emit(ApplyEvent::Cancelled { remaining_waves });
                return Ok(WaveRun {
                    states,
                    actions,
                    cancelled: true,
                });
            }

            tracing::info!(wave = index, resources = wave.len(), "starting wave");
            self.events.emit(ApplyEvent::WaveStarted {
                index,
                resources: wave.clone(),
            });

            let mut runnable: Vec<&ResourceSpec> = Vec::with_capacity(wave.len());
            for id in wave {
                let blocker = graph
                    .dependencies(id)
                    .into_iter()
                    .find(|dep| !states.get(*dep).is_some_and(|s| s.is_ready()));
                match (blocker, graph.get(id)) {
                    (Some(blocked_by), _) => {
                        tracing::info!(resource = %id, blocked_by, "dependency not ready, not attempting");
                        self.events.emit(ApplyEvent::Skipped {
                            resource: id.clone(),
                            blocked_by: blocked_by.to_string(),
                        });
                    }
                    (None, Some(spec)) => runnable.push(spec),
                    (None, None) => {
                        return Err(ProvisionerError::Internal(format!(
                            "scheduled resource {id} is missing from the graph"
                        )));
                    }
                }
            }

            let outcomes: Vec<Result<NodeOutcome, ProvisionerError>> = stream::iter(runnable)
                .map(|spec| {
                    let baseline = baselines.get(&spec.id).unwrap_or(&no_baseline);
                    self.reconcile_node(spec, &states, baseline)
                })
                .buffer_unordered(self.config.max_parallel)
                .collect()
                .await;

            for outcome in outcomes {
                let outcome = outcome?;
                if let Some(action) = outcome.action {
                    actions.insert(outcome.state.id.clone(), action);
                }
                states.insert(outcome.state.id.clone(), outcome.state);
            }
        }

        Ok(WaveRun {
            states,
            actions,
            cancelled: false,
        })
    }

    async fn reconcile_node(
        &self,
        spec: &ResourceSpec,
        states: &HashMap<String, ResourceState>,
        baseline: &Baseline,
    ) -> Result<NodeOutcome, ProvisionerError> {
        if spec.kind == ResourceKind::SecretVersion {
            return self.reconcile_secret(spec, baseline).await;
        }

        let mut state = ResourceState::pending(spec.id.clone(), spec.kind);
        let names = spec.secret_selectors().map(|s| s.name.as_str());
        let index = match SecretIndex::load(self.secrets, names).await {
            Ok(index) => index,
            Err(e) => {
                let error = ResourceError::new(FailureKind::Secret, format_err_chain(&e));
                self.fail(&mut state, error)?;
                return Ok(NodeOutcome { state, action: None });
            }
        };

        let resolved = resolve_spec(spec, states, &index);
        if let Some((key, value)) = first_unresolved(&resolved) {
            let error = ResourceError::new(
                FailureKind::Resolution,
                format!("attribute {key} could not be resolved ({})", value.render()),
            );
            self.fail(&mut state, error)?;
            return Ok(NodeOutcome { state, action: None });
        }

        let decision = decide(&resolved, baseline);
        self.announce(&spec.addr(), &decision);

        let prior = baseline.observed().cloned().unwrap_or_default();
        let prior_kind = baseline.entry.as_ref().map_or(spec.kind, |e| e.kind);
        match decision.action {
            Action::NoOp => {
                state.observed = prior;
                self.step(&mut state, ResourceStatus::Ready)?;
            }
            Action::Create => self.create(&mut state, &resolved).await?,
            Action::Update => self.update(&mut state, &resolved, prior).await?,
            Action::Replace => {
                let prior_addr = ResourceAddr::new(prior_kind, spec.id.clone());
                self.replace(&mut state, &resolved, &prior_addr, prior).await?
            }
            Action::Destroy => {
                return Err(ProvisionerError::Internal(format!(
                    "destroy chosen for declared resource {}",
                    spec.id
                )));
            }
        }

        Ok(NodeOutcome {
            state,
            action: Some(decision.action),
        })
    }

    async fn create(
        &self,
        state: &mut ResourceState,
        spec: &ResolvedSpec,
    ) -> Result<(), ProvisionerError> {
        self.step(state, ResourceStatus::Creating)?;
        let created = with_retry(
            &state.id,
            "create",
            &self.config.retry,
            self.config.operation_timeout(),
            self.events,
            || self.provider.create(spec),
        )
        .await;
        match created {
            Ok(observed) => state.observed = sanitize_observed(observed, spec),
            Err(e) => return self.fail(state, e.into_resource_error("create")),
        }
        self.settle(state, &spec.addr()).await
    }

    async fn update(
        &self,
        state: &mut ResourceState,
        spec: &ResolvedSpec,
        prior: Observed,
    ) -> Result<(), ProvisionerError> {
        self.step(state, ResourceStatus::Creating)?;
        let addr = spec.addr();
        let updated = with_retry(
            &state.id,
            "update",
            &self.config.retry,
            self.config.operation_timeout(),
            self.events,
            || self.provider.update(&addr, spec, &prior),
        )
        .await;
        match updated {
            Ok(observed) => state.observed = sanitize_observed(observed, spec),
            Err(e) => {
                state.observed = prior;
                return self.fail(state, e.into_resource_error("update"));
            }
        }
        self.settle(state, &addr).await
    }

    /// Destroy then create, both in this resource's slot. `prior_addr`
    /// carries the persisted kind, which differs from the desired one when
    /// the identifier was reused for another kind.
    async fn replace(
        &self,
        state: &mut ResourceState,
        spec: &ResolvedSpec,
        prior_addr: &ResourceAddr,
        prior: Observed,
    ) -> Result<(), ProvisionerError> {
        self.step(state, ResourceStatus::Destroying)?;
        if let Err(e) = self.destroy_at_provider(prior_addr, &prior).await {
            // Persist what is still out there under the kind it really has.
            state.kind = prior_addr.kind;
            state.observed = prior;
            return self.fail(state, e.into_resource_error("destroy for replacement"));
        }
        self.create(state, spec).await
    }

    /// Secret versions and entries with nothing observed have no provider
    /// counterpart.
    async fn destroy_at_provider(
        &self,
        addr: &ResourceAddr,
        observed: &Observed,
    ) -> Result<(), OperationError> {
        if addr.kind == ResourceKind::SecretVersion || observed.is_empty() {
            tracing::debug!(resource = %addr, "nothing to destroy at the provider");
            return Ok(());
        }
        tracing::info!(resource = %addr, "destroying resource");
        with_retry(
            &addr.id,
            "destroy",
            &self.config.retry,
            self.config.operation_timeout(),
            self.events,
            || self.provider.destroy(addr, observed),
        )
        .await
    }

    /// Wait out eventual consistency, then mark Ready.
    async fn settle(
        &self,
        state: &mut ResourceState,
        addr: &ResourceAddr,
    ) -> Result<(), ProvisionerError> {
        if state.kind.consistency() == Consistency::Eventual {
            self.step(state, ResourceStatus::Waiting)?;
            let observed = state.observed.clone();
            let provider = self.provider;
            let check = provider.readiness(addr, &observed).is_some().then(|| {
                let observed = &observed;
                move || async move {
                    match provider.readiness(addr, observed) {
                        Some(check) => check.await,
                        None => Ok(false),
                    }
                }
            });

            let wait = self.config.wait_for(state.kind);
            match wait_until_ready(&state.id, check, wait, self.events).await {
                Ok(WaitOutcome::PredicateSatisfied { elapsed, polls }) => {
                    tracing::info!(
                        resource = %addr,
                        polls,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "resource consistent"
                    );
                }
                Ok(WaitOutcome::DelayElapsed { delay }) => {
                    tracing::info!(resource = %addr, delay_secs = delay.as_secs(), "fallback delay elapsed");
                }
                Err(e @ WaitError::Timeout { .. }) => {
                    let error = ResourceError::new(FailureKind::ConsistencyTimeout, e.to_string());
                    return self.fail(state, error);
                }
                Err(WaitError::Check(e)) => {
                    let error = ResourceError::new(
                        FailureKind::Permanent,
                        format!("readiness check: {e}"),
                    );
                    return self.fail(state, error);
                }
            }
        }
        self.step(state, ResourceStatus::Ready)?;
        tracing::info!(resource = %addr, "resource ready");
        Ok(())
    }

    // ── Secrets ──────────────────────────────────────────────────

    /// `secret-version` resources are reconciled against the secret
    /// manager. An existing secret is never regenerated; the node only
    /// records which version is current.
    async fn reconcile_secret(
        &self,
        spec: &ResourceSpec,
        baseline: &Baseline,
    ) -> Result<NodeOutcome, ProvisionerError> {
        let mut state = ResourceState::pending(spec.id.clone(), spec.kind);
        let name = spec.managed_secret_name().ok_or_else(|| {
            ProvisionerError::Internal(format!("{} passed validation without a secret name", spec.id))
        })?;

        let policy = match generation_policy(spec) {
            Ok(policy) => policy,
            Err(message) => {
                self.fail(&mut state, ResourceError::new(FailureKind::Secret, message))?;
                return Ok(NodeOutcome { state, action: None });
            }
        };

        let latest = match self.secrets.latest(name).await {
            Ok(latest) => latest,
            Err(e) => {
                self.fail(&mut state, secret_failure(&e))?;
                return Ok(NodeOutcome { state, action: None });
            }
        };

        let decision = decide_secret(baseline, latest.as_ref());
        self.announce(&spec.addr(), &decision);

        if decision.action == Action::Replace {
            if let Some(entry) = &baseline.entry {
                self.step(&mut state, ResourceStatus::Destroying)?;
                let prior_addr = ResourceAddr::new(entry.kind, spec.id.clone());
                if let Err(e) = self.destroy_at_provider(&prior_addr, &entry.observed).await {
                    state.kind = entry.kind;
                    state.observed = entry.observed.clone();
                    self.fail(&mut state, e.into_resource_error("destroy for replacement"))?;
                    return Ok(NodeOutcome {
                        state,
                        action: Some(decision.action),
                    });
                }
            }
        }

        let reference = match (decision.action, latest) {
            (Action::Create | Action::Replace, _) => {
                self.step(&mut state, ResourceStatus::Creating)?;
                match self.secrets.ensure(name, &policy).await {
                    Ok((reference, created)) => {
                        tracing::info!(secret = %reference, created, "secret version ensured");
                        reference
                    }
                    Err(e) => {
                        self.fail(&mut state, secret_failure(&e))?;
                        return Ok(NodeOutcome {
                            state,
                            action: Some(decision.action),
                        });
                    }
                }
            }
            (_, Some(latest)) => latest,
            (action, None) => {
                return Err(ProvisionerError::Internal(format!(
                    "{action} chosen for secret {name} with no versions"
                )));
            }
        };

        state.observed = secret_observed(spec, &reference);
        self.step(&mut state, ResourceStatus::Ready)?;
        Ok(NodeOutcome {
            state,
            action: Some(decision.action),
        })
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Destroy persisted resources wave by wave, dependents first.
    ///
    /// A resource whose dependent failed to go away is left alone.
    pub(crate) async fn teardown(
        &self,
        waves: Vec<Vec<String>>,
        entries: &BTreeMap<String, SnapshotEntry>,
    ) -> Result<TeardownRun, ProvisionerError> {
        let dependents = dependents_of(entries);
        let mut done: HashMap<String, ResourceStatus> = HashMap::new();
        let mut states = Vec::new();
        let total = waves.len();

        for (index, wave) in waves.into_iter().enumerate() {
            if self.cancel.is_cancelled() {
                tracing::warn!(remaining_waves = total - index, "teardown cancelled");
                self.events.emit(ApplyEvent::Cancelled {
                    remaining_waves: total - index,
                });
                return Ok(TeardownRun {
                    states,
                    cancelled: true,
                });
            }

            let mut runnable = Vec::new();
            for id in wave {
                let Some(entry) = entries.get(&id) else {
                    continue;
                };
                let blocker = dependents
                    .get(id.as_str())
                    .into_iter()
                    .flatten()
                    .find(|d| done.get(**d).is_some_and(|s| *s != ResourceStatus::Destroyed));
                if let Some(blocked_by) = blocker {
                    tracing::info!(resource = %id, blocked_by, "dependent still present, not destroying");
                    self.events.emit(ApplyEvent::Skipped {
                        resource: id.clone(),
                        blocked_by: blocked_by.to_string(),
                    });
                    done.insert(id.clone(), ResourceStatus::Pending);
                    states.push(ResourceState::pending(id, entry.kind));
                    continue;
                }
                runnable.push((id, entry));
            }

            let outcomes: Vec<Result<ResourceState, ProvisionerError>> = stream::iter(runnable)
                .map(|(id, entry)| self.destroy_node(id, entry))
                .buffer_unordered(self.config.max_parallel)
                .collect()
                .await;
            for outcome in outcomes {
                let state = outcome?;
                done.insert(state.id.clone(), state.status);
                states.push(state);
            }
        }

        Ok(TeardownRun {
            states,
            cancelled: false,
        })
    }

    async fn destroy_node(
        &self,
        id: String,
        entry: &SnapshotEntry,
    ) -> Result<ResourceState, ProvisionerError> {
        let addr = ResourceAddr::new(entry.kind, id.clone());
        let mut state = ResourceState {
            id,
            kind: entry.kind,
            status: ResourceStatus::Pending,
            observed: entry.observed.clone(),
            last_error: None,
        };
        self.events.emit(ApplyEvent::ActionChosen {
            resource: state.id.clone(),
            action: Action::Destroy,
        });
        self.step(&mut state, ResourceStatus::Destroying)?;

        // Secret versions stay in the store; only the state entry goes.
        if let Err(e) = self.destroy_at_provider(&addr, &entry.observed).await {
            self.fail(&mut state, e.into_resource_error("destroy"))?;
            return Ok(state);
        }

        state.observed.clear();
        self.step(&mut state, ResourceStatus::Destroyed)?;
        Ok(state)
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn announce(&self, addr: &ResourceAddr, decision: &Decision) {
        tracing::info!(
            resource = %addr,
            action = %decision.action,
            cause = ?decision.cause,
            drifted_fields = decision.drift.len(),
            "action chosen"
        );
        self.events.emit(ApplyEvent::ActionChosen {
            resource: addr.id.clone(),
            action: decision.action,
        });
    }

    fn step(&self, state: &mut ResourceState, next: ResourceStatus) -> Result<(), ProvisionerError> {
        let from = state.transition(next)?;
        tracing::debug!(resource = %state.id, %from, to = %next, "status changed");
        self.events.transition(&state.id, from, next);
        Ok(())
    }

    fn fail(&self, state: &mut ResourceState, error: ResourceError) -> Result<(), ProvisionerError> {
        tracing::error!(
            resource = %state.id,
            kind = ?error.kind,
            error = %error.message,
            "resource failed"
        );
        state.last_error = Some(error);
        self.step(state, ResourceStatus::Failed)
    }
}

/// Teardown waves for `ids`, dependents first, from the dependencies
/// persisted with each entry. Dependencies outside `ids` are ignored.
pub(crate) fn teardown_waves(
    ids: &[String],
    entries: &BTreeMap<String, SnapshotEntry>,
) -> Vec<Vec<String>> {
    let set: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut remaining: BTreeMap<&str, usize> = ids
        .iter()
        .map(|id| {
            let deps = entries
                .get(id)
                .map_or(0, |e| e.dependencies.iter().filter(|d| set.contains(d.as_str())).count());
            (id.as_str(), deps)
        })
        .collect();

    let mut waves: Vec<Vec<String>> = Vec::new();
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }
        for id in &ready {
            remaining.remove(id);
        }
        for (id, n) in remaining.iter_mut() {
            if let Some(entry) = entries.get(*id) {
                *n -= entry
                    .dependencies
                    .iter()
                    .filter(|d| ready.contains(&d.as_str()))
                    .count();
            }
        }
        waves.push(ready.into_iter().map(str::to_string).collect());
    }

    // Persisted dependencies should never form a cycle; if they do, tear
    // those resources down first rather than leak them.
    if !remaining.is_empty() {
        tracing::warn!(resources = remaining.len(), "cycle in persisted dependencies");
        waves.push(remaining.into_keys().map(str::to_string).collect());
    }

    waves.reverse();
    waves
}

fn dependents_of(entries: &BTreeMap<String, SnapshotEntry>) -> HashMap<&str, Vec<&str>> {
    let mut out: HashMap<&str, Vec<&str>> = HashMap::new();
    for (id, entry) in entries {
        for dep in &entry.dependencies {
            out.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }
    out
}

fn generation_policy(spec: &ResourceSpec) -> Result<GenerationPolicy, String> {
    let policy = match spec.attributes.get("policy") {
        None => GenerationPolicy::default(),
        Some(AttrValue::Literal(value)) => serde_json::from_value(value.clone())
            .map_err(|e| format!("invalid generation policy: {e}"))?,
        Some(_) => return Err("generation policy must be a literal".to_string()),
    };
    policy.validate().map_err(|e| e.to_string())?;
    Ok(policy)
}

fn secret_failure(err: &SecretError) -> ResourceError {
    let kind = match err {
        SecretError::Conflict { .. } => FailureKind::SecretConflict,
        _ => FailureKind::Secret,
    };
    ResourceError::new(kind, format_err_chain(err))
}

pub(crate) fn secret_observed(spec: &ResourceSpec, reference: &SecretRef) -> Observed {
    let mut observed = Observed::new();
    observed.insert("id".into(), Value::String(reference.token()));
    observed.insert("secret".into(), Value::String(reference.name.clone()));
    observed.insert("version".into(), Value::from(reference.version));
    observed.insert("ref".into(), Value::String(reference.token()));
    if let Some(AttrValue::Literal(policy)) = spec.attributes.get("policy") {
        observed.insert("policy".into(), policy.clone());
    }
    observed
}
