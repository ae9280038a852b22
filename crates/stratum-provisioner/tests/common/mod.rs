#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use stratum_core::{Observed, ResourceAddr, ResourceKind};
use stratum_provisioner::{
    ApplyEvent, BoxFuture, Engine, EngineConfig, PermanentClass, ProviderClient, ProviderError,
    ResolvedSpec, RetryConfig, WaitConfig,
};
use stratum_secrets::MemorySecretStore;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Create,
    Read,
    Update,
    Destroy,
    Ready,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub kind: ResourceKind,
    pub id: String,
    /// Attributes as the provider received them, secrets as tokens.
    pub attributes: BTreeMap<String, Value>,
}

/// Per-resource behaviour of the fake backend.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Transient errors returned by create/update before succeeding.
    pub transient_failures: u32,
    pub permanent: bool,
    pub fail_destroy: bool,
    /// Readiness turns true this long after create. `None` = immediately.
    pub ready_after: Option<Duration>,
    /// The backend has no readiness check for this resource.
    pub no_readiness: bool,
    /// Cancelled as soon as this resource's create is called.
    pub cancel_on_create: Option<CancellationToken>,
    /// Create takes this long before answering.
    pub create_delay: Option<Duration>,
    /// Create never answers.
    pub hang_create: bool,
}

/// In-memory stand-in for a cloud backend. Records every call.
#[derive(Debug, Default)]
pub struct FakeProvider {
    calls: Mutex<Vec<Call>>,
    scripts: Mutex<HashMap<String, Script>>,
    live: Mutex<HashMap<String, Observed>>,
    created_at: Mutex<HashMap<String, Instant>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, id: &str, script: Script) {
        self.scripts.lock().unwrap().insert(id.to_string(), script);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Mutating calls only (create, update, destroy).
    pub fn mutations(&self) -> Vec<(Op, String)> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c.op, Op::Create | Op::Update | Op::Destroy))
            .map(|c| (c.op, c.id))
            .collect()
    }

    pub fn count(&self, op: Op, id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.op == op && c.id == id)
            .count()
    }

    /// Most creates that were running at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn live(&self, id: &str) -> Option<Observed> {
        self.live.lock().unwrap().get(id).cloned()
    }

    /// Change a live attribute behind the engine's back.
    pub fn set_live_attr(&self, id: &str, key: &str, value: Value) {
        if let Some(observed) = self.live.lock().unwrap().get_mut(id) {
            observed.insert(key.to_string(), value);
        }
    }

    /// Delete a resource behind the engine's back.
    pub fn remove_live(&self, id: &str) {
        self.live.lock().unwrap().remove(id);
    }

    fn record(&self, op: Op, kind: ResourceKind, id: &str, attributes: BTreeMap<String, Value>) {
        self.calls.lock().unwrap().push(Call {
            op,
            kind,
            id: id.to_string(),
            attributes,
        });
    }

    fn scripted_failure(&self, id: &str) -> Option<ProviderError> {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.get_mut(id)?;
        if script.permanent {
            return Some(ProviderError::permanent(
                PermanentClass::InvalidConfig,
                format!("{id} rejected"),
            ));
        }
        if script.transient_failures > 0 {
            script.transient_failures -= 1;
            return Some(ProviderError::transient("rate limited"));
        }
        None
    }

    fn script_for(&self, id: &str) -> Script {
        self.scripts.lock().unwrap().get(id).cloned().unwrap_or_default()
    }

    async fn create_now(&self, spec: &ResolvedSpec) -> Result<Observed, ProviderError> {
        self.record(Op::Create, spec.kind, &spec.id, spec.rendered());
        let script = self.script_for(&spec.id);
        if let Some(token) = script.cancel_on_create {
            token.cancel();
        }
        if script.hang_create {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = script.create_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.scripted_failure(&spec.id) {
            return Err(err);
        }

        let mut observed = spec.rendered();
        for attr in spec.kind.producible_attributes() {
            observed
                .entry(attr.to_string())
                .or_insert_with(|| json!(format!("{}-{attr}", spec.id)));
        }
        self.live
            .lock()
            .unwrap()
            .insert(spec.id.clone(), observed.clone());
        self.created_at
            .lock()
            .unwrap()
            .insert(spec.id.clone(), Instant::now());
        Ok(observed)
    }
}

impl ProviderClient for FakeProvider {
    fn create<'a>(
        &'a self,
        spec: &'a ResolvedSpec,
    ) -> BoxFuture<'a, Result<Observed, ProviderError>> {
        Box::pin(async move {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
            let created = self.create_now(spec).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            created
        })
    }

    fn read<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        _observed: &'a Observed,
    ) -> BoxFuture<'a, Result<Option<Observed>, ProviderError>> {
        Box::pin(async move {
            self.record(Op::Read, addr.kind, &addr.id, BTreeMap::new());
            Ok(self.live(&addr.id))
        })
    }
    fn update<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        spec: &'a ResolvedSpec,
        observed: &'a Observed,
    ) -> BoxFuture<'a, Result<Observed, ProviderError>> {
        Box::pin(async move {
            self.record(Op::Update, addr.kind, &addr.id, spec.rendered());
            if let Some(err) = self.scripted_failure(&addr.id) {
                return Err(err);
            }
            let mut updated = self.live(&addr.id).unwrap_or_else(|| observed.clone());
            updated.extend(spec.rendered());
            self.live
                .lock()
                .unwrap()
                .insert(addr.id.clone(), updated.clone());
            Ok(updated)
        })
    }

    fn destroy<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        _observed: &'a Observed,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            self.record(Op::Destroy, addr.kind, &addr.id, BTreeMap::new());
            if self.script_for(&addr.id).fail_destroy {
                return Err(ProviderError::permanent(
                    PermanentClass::Unauthorized,
                    "not allowed to delete",
                ));
            }
            self.remove_live(&addr.id);
            Ok(())
        })
    }

    fn readiness<'a>(
        &'a self,
        addr: &'a ResourceAddr,
        _observed: &'a Observed,
    ) -> Option<BoxFuture<'a, Result<bool, ProviderError>>> {
        let script = self.script_for(&addr.id);
        if script.no_readiness {
            return None;
        }
        Some(Box::pin(async move {
            self.record(Op::Ready, addr.kind, &addr.id, BTreeMap::new());
            let Some(after) = script.ready_after else {
                return Ok(true);
            };
            let created = self.created_at.lock().unwrap().get(&addr.id).copied();
            Ok(created.is_some_and(|at| at.elapsed() >= after))
        }))
    }
}

/// Engine settings for tests: short backoff, 5 s polls, 120 s waits.
pub fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        state_dir: dir.to_path_buf(),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 400,
        },
        wait: WaitConfig {
            interval_ms: 5_000,
            timeout_secs: 120,
            fallback_delay_secs: 10,
        },
        wait_overrides: BTreeMap::new(),
        ..EngineConfig::default()
    }
}

pub fn engine(dir: &Path) -> Engine<FakeProvider, MemorySecretStore> {
    engine_with(test_config(dir))
}

pub fn engine_with(config: EngineConfig) -> Engine<FakeProvider, MemorySecretStore> {
    Engine::new(FakeProvider::new(), MemorySecretStore::new(), config).unwrap()
}

pub fn drain(rx: &mut UnboundedReceiver<ApplyEvent>) -> Vec<ApplyEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
