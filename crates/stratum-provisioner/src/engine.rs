use std::collections::{BTreeMap, HashMap};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use stratum_core::{
    AttrValue, Observed, ResourceAddr, ResourceKind, ResourceSpec, ResourceState, ResourceStatus, SecretRef,
};
use stratum_secrets::{SecretManager, SecretStore};
use stratum_storage::{Snapshot, SnapshotEntry, StateStore};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::diff::{decide, decide_secret, Baseline};
use crate::error::ProvisionerError;
use crate::events::EventSink;
use crate::graph::ResourceGraph;
use crate::outputs::{resolve_outputs, OutputDef, ResolvedOutput};
use crate::plan::{Action, Cause, Plan, PlanEntry};
use crate::provider::ProviderClient;
use crate::reconcile::{secret_observed, teardown_waves, Reconciler, TeardownRun};
use crate::resolve::{resolve_spec, SecretIndex};
use crate::retry::with_retry;
use crate::scheduler::Schedule;

/// Per-run knobs that are not part of the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub events: EventSink,
    /// Cancelling stops new waves from starting. In-flight operations run
    /// to completion and their results are persisted.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// Every declared resource is Ready and every orphan is gone.
    Success,
    PartialFailure,
    Cancelled,
}

/// Per-resource result table for one run.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub run_id: Uuid,
    pub outcome: ApplyOutcome,
    /// Declared resources in declaration order.
    pub states: Vec<ResourceState>,
    /// Action taken per attempted resource.
    pub actions: BTreeMap<String, Action>,
    /// Resources torn down: orphans on apply, everything on destroy.
    pub teardown: Vec<ResourceState>,
    pub outputs: BTreeMap<String, ResolvedOutput>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.outcome == ApplyOutcome::Success
    }

    pub fn state(&self, id: &str) -> Option<&ResourceState> {
        self.states
            .iter()
            .chain(&self.teardown)
            .find(|s| s.id == id)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ResourceState> {
        self.states
            .iter()
            .chain(&self.teardown)
            .filter(|s| s.status == ResourceStatus::Failed)
    }

    pub fn not_attempted(&self) -> impl Iterator<Item = &ResourceState> {
        self.states
            .iter()
            .chain(&self.teardown)
            .filter(|s| !s.was_attempted())
    }

    pub fn destroyed(&self) -> impl Iterator<Item = &str> {
        self.teardown
            .iter()
            .filter(|s| s.status == ResourceStatus::Destroyed)
            .map(|s| s.id.as_str())
    }
}

/// Entry point: plan, apply, and destroy resource graphs against one
/// provider, one secret store, and one state directory.
///
/// Runs against the same engine are serialized; the state directory lock
/// keeps separate processes apart.
pub struct Engine<P, S> {
    provider: P,
    secrets: SecretManager<S>,
    store: StateStore,
    config: EngineConfig,
    run_gate: Mutex<()>,
}

impl<P: ProviderClient, S: SecretStore> Engine<P, S> {
    pub fn new(provider: P, secret_store: S, config: EngineConfig) -> Result<Self, ProvisionerError> {
        config.validate()?;
        Ok(Self {
            provider,
            secrets: SecretManager::new(secret_store),
            store: StateStore::new(&config.state_dir),
            config,
            run_gate: Mutex::new(()),
        })
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn secrets(&self) -> &SecretManager<S> {
        &self.secrets
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ── Plan ─────────────────────────────────────────────────────

    /// Compute what an apply would do, without changing anything.
    ///
    /// Secret-typed values appear as `name@version` (or `name@pending`
    /// before the first generation); values produced by resources not yet
    /// created render as `(known after apply)`.
    pub async fn plan(&self, specs: Vec<ResourceSpec>) -> Result<Plan, ProvisionerError> {
        let graph = ResourceGraph::build(specs)?;
        let schedule = Schedule::build(&graph)?;
        let snapshot = self.store.load().await?;
        let baselines = self.baselines(&snapshot, &graph, &EventSink::none()).await;

        let names = graph.specs().iter().filter_map(|s| s.managed_secret_name());
        let index = SecretIndex::load(&self.secrets, names).await?;
        let no_baseline = Baseline::default();

        // Observed attributes that will still hold after apply, i.e. of
        // resources that are left in place.
        let mut known: HashMap<String, Observed> = HashMap::new();
        let mut entries = Vec::with_capacity(graph.len());

        for (wave, ids) in schedule.waves().iter().enumerate() {
            for id in ids {
                let spec = graph.get(id).ok_or_else(|| {
                    ProvisionerError::Internal(format!("scheduled resource {id} is missing from the graph"))
                })?;
                let baseline = baselines.get(id).unwrap_or(&no_baseline);

                let (decision, attributes) = match spec.managed_secret_name() {
                    Some(name) => {
                        let latest = index.latest(name);
                        let token = latest
                            .as_ref()
                            .map_or_else(|| format!("{name}@pending"), SecretRef::token);
                        if let Some(latest) = &latest {
                            known.insert(id.clone(), secret_observed(spec, latest));
                        }
                        let attributes = BTreeMap::from([
                            ("secret".to_string(), Value::String(name.to_string())),
                            ("ref".to_string(), Value::String(token)),
                        ]);
                        (decide_secret(baseline, latest.as_ref()), attributes)
                    }
                    None => {
                        let resolved = resolve_spec(spec, &known, &index);
                        let decision = decide(&resolved, baseline);
                        if matches!(decision.action, Action::NoOp | Action::Update) {
                            if let Some(observed) = baseline.observed() {
                                known.insert(id.clone(), observed.clone());
                            }
                        }
                        (decision, resolved.rendered())
                    }
                };

                entries.push(PlanEntry {
                    resource_id: id.clone(),
                    kind: spec.kind,
                    action: decision.action,
                    cause: decision.cause,
                    drift: decision.drift,
                    attributes,
                    wave: Some(wave),
                });
            }
        }

        let current = refreshed_entries(&baselines);
        let orphans = orphan_ids(&current, &graph);
        for id in teardown_waves(&orphans, &current).into_iter().flatten() {
            if let Some(entry) = current.get(&id) {
                entries.push(PlanEntry {
                    resource_id: id,
                    kind: entry.kind,
                    action: Action::Destroy,
                    cause: Cause::Orphaned,
                    drift: Vec::new(),
                    attributes: BTreeMap::new(),
                    wave: None,
                });
            }
        }

        let plan = Plan { entries };
        tracing::info!(summary = %plan.summary(), "plan computed");
        Ok(plan)
    }

    // ── Apply ────────────────────────────────────────────────────

    /// Converge the live system on `specs`.
    ///
    /// Validation runs first; an invalid graph fails before the state
    /// directory is touched or the provider is called. Resource failures
    /// do not fail the call, they show up in the report.
    pub async fn apply(
        &self,
        specs: Vec<ResourceSpec>,
        outputs: &[OutputDef],
        options: ApplyOptions,
    ) -> Result<ApplyReport, ProvisionerError> {
        let graph = ResourceGraph::build(specs)?;
        let schedule = Schedule::build(&graph)?;
        let run_id = Uuid::new_v4();

        let _gate = self.run_gate.lock().await;
        let lock = self
            .store
            .lock(&run_id.to_string(), self.config.lock_stale_after())
            .await?;
        tracing::info!(run_id = %run_id, resources = graph.len(), waves = schedule.len(), "apply started");

        // On error the lock guard is dropped, which removes the lock file.
        let report = self
            .apply_locked(run_id, &graph, &schedule, outputs, &options)
            .await?;
        lock.release().await?;

        tracing::info!(
            run_id = %run_id,
            outcome = ?report.outcome,
            failed = report.failed().count(),
            not_attempted = report.not_attempted().count(),
            "apply finished"
        );
        Ok(report)
    }

    async fn apply_locked(
        &self,
        run_id: Uuid,
        graph: &ResourceGraph,
        schedule: &Schedule,
        outputs: &[OutputDef],
        options: &ApplyOptions,
    ) -> Result<ApplyReport, ProvisionerError> {
        let mut snapshot = self.store.load().await?;
        let baselines = self.baselines(&snapshot, graph, &options.events).await;
        snapshot.resources = refreshed_entries(&baselines);

        let reconciler = self.reconciler(options);
        let run = reconciler.apply(graph, schedule, &baselines).await?;

        let orphans = orphan_ids(&snapshot.resources, graph);
        let teardown = if run.cancelled {
            not_reached(&orphans, &snapshot.resources)
        } else {
            let waves = teardown_waves(&orphans, &snapshot.resources);
            reconciler.teardown(waves, &snapshot.resources).await?
        };

        for spec in graph.specs() {
            if let Some(state) = run.states.get(&spec.id) {
                let dependencies = graph.dependencies(&spec.id).into_iter().map(str::to_string).collect();
                merge_state(&mut snapshot, state, run.actions.get(&spec.id).copied(), dependencies);
            }
        }
        merge_teardown(&mut snapshot, &teardown.states);
        self.store.save(&mut snapshot).await?;

        let states: Vec<ResourceState> = graph
            .specs()
            .iter()
            .filter_map(|s| run.states.get(&s.id).cloned())
            .collect();
        let outcome = if run.cancelled || teardown.cancelled {
            ApplyOutcome::Cancelled
        } else if states.iter().all(ResourceState::is_ready)
            && teardown.states.iter().all(|s| s.status == ResourceStatus::Destroyed)
        {
            ApplyOutcome::Success
        } else {
            ApplyOutcome::PartialFailure
        };

        Ok(ApplyReport {
            run_id,
            outcome,
            outputs: resolve_outputs(outputs, &states),
            states,
            actions: run.actions.into_iter().collect(),
            teardown: teardown.states,
        })
    }

    // ── Destroy ──────────────────────────────────────────────────

    /// Tear down everything in state: resources no longer declared first,
    /// then the declared graph in reverse wave order.
    pub async fn destroy(
        &self,
        specs: Vec<ResourceSpec>,
        options: ApplyOptions,
    ) -> Result<ApplyReport, ProvisionerError> {
        let graph = ResourceGraph::build(specs)?;
        let schedule = Schedule::build(&graph)?;
        let run_id = Uuid::new_v4();

        let _gate = self.run_gate.lock().await;
        let lock = self
            .store
            .lock(&run_id.to_string(), self.config.lock_stale_after())
            .await?;
        tracing::info!(run_id = %run_id, "destroy started");

        let mut snapshot = self.store.load().await?;
        let orphans = orphan_ids(&snapshot.resources, &graph);
        let mut waves = teardown_waves(&orphans, &snapshot.resources);
        waves.extend(schedule.teardown_order().filter_map(|wave| {
            let present: Vec<String> = wave
                .iter()
                .filter(|id| snapshot.resources.contains_key(*id))
                .cloned()
                .collect();
            (!present.is_empty()).then_some(present)
        }));

        let teardown = self
            .reconciler(&options)
            .teardown(waves, &snapshot.resources)
            .await?;
        merge_teardown(&mut snapshot, &teardown.states);
        self.store.save(&mut snapshot).await?;
        lock.release().await?;

        let outcome = if teardown.cancelled {
            ApplyOutcome::Cancelled
        } else if teardown.states.iter().all(|s| s.status == ResourceStatus::Destroyed) {
            ApplyOutcome::Success
        } else {
            ApplyOutcome::PartialFailure
        };
        tracing::info!(run_id = %run_id, outcome = ?outcome, "destroy finished");

        Ok(ApplyReport {
            run_id,
            outcome,
            states: Vec::new(),
            actions: teardown
                .states
                .iter()
                .filter(|s| s.was_attempted())
                .map(|s| (s.id.clone(), Action::Destroy))
                .collect(),
            teardown: teardown.states,
            outputs: BTreeMap::new(),
        })
    }

    // ── Secrets ──────────────────────────────────────────────────

    /// Append a new version of `name`. Consumers that follow the latest
    /// version plan an update on the next apply.
    pub async fn rotate_secret(&self, name: &str) -> Result<SecretRef, ProvisionerError> {
        let _gate = self.run_gate.lock().await;
        Ok(self.secrets.rotate(name).await?)
    }

    // ── Helpers ──────────────────────────────────────────────────

    fn reconciler<'a>(&'a self, options: &'a ApplyOptions) -> Reconciler<'a, P, S> {
        Reconciler {
            provider: &self.provider,
            secrets: &self.secrets,
            config: &self.config,
            events: &options.events,
            cancel: &options.cancel,
        }
    }

    /// Re-read every Ready resource so decisions reflect the live system.
    /// A read that fails leaves the persisted entry as it was.
    async fn baselines(
        &self,
        snapshot: &Snapshot,
        graph: &ResourceGraph,
        events: &EventSink,
    ) -> HashMap<String, Baseline> {
        let refreshes = stream::iter(&snapshot.resources)
            .map(|(id, entry)| async move {
                let baseline = if self.should_refresh(entry) {
                    self.refresh_entry(id, entry, graph.get(id), events).await
                } else {
                    Baseline {
                        entry: Some(entry.clone()),
                        ..Baseline::default()
                    }
                };
                (id.clone(), baseline)
            })
            .buffer_unordered(self.config.max_parallel)
            .collect::<Vec<_>>()
            .await;
        refreshes.into_iter().collect()
    }

    fn should_refresh(&self, entry: &SnapshotEntry) -> bool {
        self.config.refresh && entry.is_ready() && entry.kind != ResourceKind::SecretVersion
    }

    async fn refresh_entry(
        &self,
        id: &str,
        entry: &SnapshotEntry,
        declared: Option<&ResourceSpec>,
        events: &EventSink,
    ) -> Baseline {
        let addr = ResourceAddr::new(entry.kind, id);
        let read = with_retry(
            id,
            "read",
            &self.config.retry,
            self.config.operation_timeout(),
            events,
            || self.provider.read(&addr, &entry.observed),
        )
        .await;

        match read {
            Ok(None) => {
                tracing::warn!(resource = %addr, "resource missing from provider");
                Baseline {
                    entry: None,
                    missing: true,
                    drifted: false,
                }
            }
            Ok(Some(live)) => {
                let mut observed = live;
                for (key, value) in &entry.observed {
                    observed.entry(key.clone()).or_insert_with(|| value.clone());
                }
                mask_secret_values(&mut observed, &entry.observed, declared);
                let drifted = observed != entry.observed;
                if drifted {
                    tracing::info!(resource = %addr, "live attributes differ from state");
                }
                Baseline {
                    entry: Some(SnapshotEntry {
                        observed,
                        ..entry.clone()
                    }),
                    missing: false,
                    drifted,
                }
            }
            Err(e) => {
                tracing::warn!(resource = %addr, error = %e, "refresh failed, using persisted state");
                Baseline {
                    entry: Some(entry.clone()),
                    ..Baseline::default()
                }
            }
        }
    }
}

/// A provider may report secret-typed attributes in plaintext. Keep the persisted
/// `name@version` token for those keys and drop any that has none.
fn mask_secret_values(
    observed: &mut Observed,
    persisted: &Observed,
    declared: Option<&ResourceSpec>,
) {
    let declared_secret = |key: &str| {
        declared.is_some_and(|s| matches!(s.attributes.get(key), Some(AttrValue::Secret(_))))
    };
    let keys: Vec<String> = observed.keys().cloned().collect();
    for key in keys {
        let token = persisted
            .get(&key)
            .filter(|v| v.as_str().is_some_and(|s| s.parse::<SecretRef>().is_ok()));
        match token {
            Some(token) => {
                observed.insert(key, token.clone());
            }
            None if declared_secret(&key) => {
                observed.remove(&key);
            }
            None => {}
        }
    }
}

fn refreshed_entries(baselines: &HashMap<String, Baseline>) -> BTreeMap<String, SnapshotEntry> {
    baselines
        .iter()
        .filter_map(|(id, b)| b.entry.clone().map(|e| (id.clone(), e)))
        .collect()
}

fn orphan_ids(entries: &BTreeMap<String, SnapshotEntry>, graph: &ResourceGraph) -> Vec<String> {
    entries
        .keys()
        .filter(|id| !graph.contains(id))
        .cloned()
        .collect()
}

fn not_reached(ids: &[String], entries: &BTreeMap<String, SnapshotEntry>) -> TeardownRun {
    TeardownRun {
        states: ids
            .iter()
            .filter_map(|id| entries.get(id).map(|e| ResourceState::pending(id.clone(), e.kind)))
            .collect(),
        cancelled: true,
    }
}

/// Fold one declared resource's end-of-run state into the snapshot.
///
/// Pending resources keep their previous entry. A failed update leaves the
/// resource as it was and only records the error; a failed create or
/// replace records whatever exists now, so the next run can replace it.
fn merge_state(
    snapshot: &mut Snapshot,
    state: &ResourceState,
    action: Option<Action>,
    dependencies: Vec<String>,
) {
    let now = jiff::Timestamp::now();
    match (state.status, action) {
        (ResourceStatus::Ready, _) => snapshot.upsert(
            state.id.clone(),
            SnapshotEntry {
                kind: state.kind,
                status: ResourceStatus::Ready,
                observed: state.observed.clone(),
                dependencies,
                last_error: None,
                updated_at: now,
            },
        ),
        (ResourceStatus::Failed, None | Some(Action::Update)) => {
            if let Some(prior) = snapshot.resources.get_mut(&state.id) {
                prior.last_error = state.last_error.clone();
                prior.updated_at = now;
            }
        }
        (ResourceStatus::Failed, Some(_)) => snapshot.upsert(
            state.id.clone(),
            SnapshotEntry {
                kind: state.kind,
                status: ResourceStatus::Failed,
                observed: state.observed.clone(),
                dependencies,
                last_error: state.last_error.clone(),
                updated_at: now,
            },
        ),
        (ResourceStatus::Pending, _) => {}
        (status, _) => {
            tracing::warn!(resource = %state.id, %status, "run ended with resource in a transient status");
        }
    }
}

fn merge_teardown(snapshot: &mut Snapshot, states: &[ResourceState]) {
    for state in states {
        match state.status {
            ResourceStatus::Destroyed => {
                snapshot.remove(&state.id);
            }
            ResourceStatus::Failed => {
                if let Some(prior) = snapshot.resources.get_mut(&state.id) {
                    prior.last_error = state.last_error.clone();
                    prior.updated_at = jiff::Timestamp::now();
                }
            }
            _ => {}
        }
    }
}
