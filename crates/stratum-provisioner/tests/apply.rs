mod common;

use std::time::Duration;

use serde_json::json;
use stratum_core::{FailureKind, ResourceKind, ResourceSpec, ResourceStatus, SecretRef};
use stratum_provisioner::{
    Action, ApplyEvent, ApplyOptions, ApplyOutcome, Cause, EngineConfig, EventSink, OutputDef,
    OutputExpr, ProvisionerError, ResolvedOutput, ValidationError, WaitStrategyKind,
    KNOWN_AFTER_APPLY,
};
use stratum_storage::{StateStore, StorageError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use common::{drain, engine, engine_with, test_config, Op, Script};

fn base() -> Vec<ResourceSpec> {
    vec![
        ResourceSpec::new("vpc", ResourceKind::Network).attr("name", "main"),
        ResourceSpec::new("subnet", ResourceKind::Subnet)
            .attr("name", "app")
            .attr("region", "europe-west1")
            .reference("network", "vpc", "self_link"),
        ResourceSpec::new("registry", ResourceKind::Registry)
            .attr("name", "images")
            .attr("location", "europe"),
    ]
}

fn with_secrets() -> Vec<ResourceSpec> {
    vec![
        ResourceSpec::new("db-password-v", ResourceKind::SecretVersion)
            .attr("secret", "db-password")
            .attr("policy", json!({"length": 24, "special": false})),
        ResourceSpec::new("db", ResourceKind::ManagedDatabase)
            .attr("name", "db")
            .attr("region", "europe-west1"),
        ResourceSpec::new("user", ResourceKind::DatabaseUser)
            .attr("name", "app")
            .reference("instance", "db", "connection_name")
            .secret("password", "db-password"),
    ]
}

fn status(report: &stratum_provisioner::ApplyReport, id: &str) -> ResourceStatus {
    report.state(id).unwrap().status
}

fn failure(report: &stratum_provisioner::ApplyReport, id: &str) -> FailureKind {
    report.state(id).unwrap().last_error.as_ref().unwrap().kind
}

#[tokio::test(start_paused = true)]
async fn apply_converges_and_replan_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = ApplyOptions {
        events: EventSink::new(tx),
        ..Default::default()
    };
    let report = engine.apply(base(), &[], options).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    assert!(report.states.iter().all(|s| s.is_ready()));
    assert_eq!(
        report.state("subnet").unwrap().observed["network"],
        json!("vpc-self_link")
    );
    assert_eq!(report.actions["vpc"], Action::Create);

    let events = drain(&mut rx);
    let waves = events
        .iter()
        .filter(|e| matches!(e, ApplyEvent::WaveStarted { .. }))
        .count();
    assert_eq!(waves, 2);
    assert!(events.contains(&ApplyEvent::Transition {
        resource: "subnet".into(),
        from: ResourceStatus::Pending,
        to: ResourceStatus::Creating,
    }));
    assert!(events.contains(&ApplyEvent::Transition {
        resource: "subnet".into(),
        from: ResourceStatus::Creating,
        to: ResourceStatus::Ready,
    }));

    let plan = engine.plan(base()).await.unwrap();
    assert!(!plan.has_changes(), "{plan:?}");
    assert_eq!(plan.summary().unchanged, 3);

    let mutations = engine.provider().mutations().len();
    let again = engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();
    assert!(again.is_success());
    assert!(again.actions.values().all(|a| *a == Action::NoOp));
    assert_eq!(engine.provider().mutations().len(), mutations);
}

#[tokio::test(start_paused = true)]
async fn invalid_graph_fails_before_any_provider_call() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let specs = vec![
        ResourceSpec::new("a", ResourceKind::Network).depends_on("b"),
        ResourceSpec::new("b", ResourceKind::Network).depends_on("a"),
    ];

    let err = engine.apply(specs, &[], ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionerError::Validation(ValidationError::Cycle { .. })
    ));
    assert!(engine.provider().calls().is_empty());
    assert!(!engine.store().state_path().exists());
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_blocks_the_chain() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.provider().script(
        "a",
        Script {
            permanent: true,
            ..Default::default()
        },
    );
    let specs = vec![
        ResourceSpec::new("a", ResourceKind::Network),
        ResourceSpec::new("b", ResourceKind::Subnet).reference("network", "a", "self_link"),
        ResourceSpec::new("c", ResourceKind::Dashboard).depends_on("b"),
    ];
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = ApplyOptions {
        events: EventSink::new(tx),
        ..Default::default()
    };
    let report = engine.apply(specs, &[], options).await.unwrap();

    assert_eq!(report.outcome, ApplyOutcome::PartialFailure);
    assert_eq!(status(&report, "a"), ResourceStatus::Failed);
    assert_eq!(failure(&report, "a"), FailureKind::Permanent);
    assert_eq!(status(&report, "b"), ResourceStatus::Pending);
    assert_eq!(status(&report, "c"), ResourceStatus::Pending);
    assert_eq!(report.not_attempted().count(), 2);
    assert_eq!(engine.provider().mutations(), vec![(Op::Create, "a".to_string())]);

    let events = drain(&mut rx);
    assert!(events.contains(&ApplyEvent::Skipped {
        resource: "b".into(),
        blocked_by: "a".into(),
    }));
    assert!(events.contains(&ApplyEvent::Skipped {
        resource: "c".into(),
        blocked_by: "b".into(),
    }));
}

#[tokio::test(start_paused = true)]
async fn independent_branches_complete_when_one_fails() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.provider().script(
        "vpc",
        Script {
            permanent: true,
            ..Default::default()
        },
    );

    let report = engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();

    assert_eq!(report.outcome, ApplyOutcome::PartialFailure);
    assert_eq!(status(&report, "registry"), ResourceStatus::Ready);
    assert_eq!(status(&report, "subnet"), ResourceStatus::Pending);
    assert_eq!(report.failed().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["vpc"]);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_are_retried_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.provider().script(
        "vpc",
        Script {
            transient_failures: 2,
            ..Default::default()
        },
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = ApplyOptions {
        events: EventSink::new(tx),
        ..Default::default()
    };
    let report = engine.apply(base(), &[], options).await.unwrap();

    assert!(report.is_success());
    assert_eq!(engine.provider().count(Op::Create, "vpc"), 3);
    let delays: Vec<Duration> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ApplyEvent::Retrying { delay, .. } => Some(delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![Duration::from_millis(100), Duration::from_millis(200)]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_resource() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.provider().script(
        "registry",
        Script {
            transient_failures: 10,
            ..Default::default()
        },
    );

    let report = engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();

    assert_eq!(status(&report, "registry"), ResourceStatus::Failed);
    assert_eq!(failure(&report, "registry"), FailureKind::RetriesExhausted);
    assert_eq!(engine.provider().count(Op::Create, "registry"), 3);
    assert_eq!(status(&report, "subnet"), ResourceStatus::Ready);
}

// ── Eventual consistency ─────────────────────────────────────────

fn database_and_service() -> Vec<ResourceSpec> {
    vec![
        ResourceSpec::new("db", ResourceKind::ManagedDatabase)
            .attr("name", "db")
            .attr("region", "europe-west1"),
        ResourceSpec::new("app", ResourceKind::ComputeService)
            .attr("name", "app")
            .attr("location", "europe-west1")
            .attr("image", "europe-docker.pkg.dev/proj/images/app:1")
            .reference("database", "db", "connection_name"),
    ]
}

#[tokio::test(start_paused = true)]
async fn hung_operation_times_out_and_blocks_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(EngineConfig {
        operation_timeout_secs: 30,
        ..test_config(dir.path())
    });
    engine.provider().script(
        "vpc",
        Script {
            hang_create: true,
            ..Default::default()
        },
    );

    let start = Instant::now();
    let report = engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();

    assert_eq!(report.outcome, ApplyOutcome::PartialFailure);
    assert_eq!(failure(&report, "vpc"), FailureKind::OperationTimeout);
    assert_eq!(status(&report, "subnet"), ResourceStatus::Pending);
    assert_eq!(status(&report, "registry"), ResourceStatus::Ready);
    assert_eq!(engine.provider().count(Op::Create, "vpc"), 1);
    assert_eq!(engine.provider().count(Op::Create, "subnet"), 0);
    assert!(start.elapsed() >= Duration::from_secs(30));
    assert!(start.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn wave_concurrency_is_capped_by_max_parallel() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(EngineConfig {
        max_parallel: 2,
        ..test_config(dir.path())
    });
    let specs: Vec<ResourceSpec> = (0..6)
        .map(|n| {
            let id = format!("registry-{n}");
            engine.provider().script(
                &id,
                Script {
                    create_delay: Some(Duration::from_secs(10)),
                    ..Default::default()
                },
            );
            ResourceSpec::new(id, ResourceKind::Registry).attr("name", format!("images-{n}"))
        })
        .collect();

    let start = Instant::now();
    let report = engine.apply(specs, &[], ApplyOptions::default()).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(engine.provider().peak_in_flight(), 2);
    // Six ten-second creates, two at a time.
    assert!(start.elapsed() >= Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn eventual_resource_is_waited_for_before_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.provider().script(
        "db",
        Script {
            ready_after: Some(Duration::from_secs(30)),
            ..Default::default()
        },
    );
    engine.provider().script(
        "app",
        Script {
            no_readiness: true,
            ..Default::default()
        },
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let options = ApplyOptions {
        events: EventSink::new(tx),
        ..Default::default()
    };
    let report = engine.apply(database_and_service(), &[], options).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(engine.provider().count(Op::Ready, "db"), 7);

    let events = drain(&mut rx);
    assert!(events.contains(&ApplyEvent::Transition {
        resource: "db".into(),
        from: ResourceStatus::Creating,
        to: ResourceStatus::Waiting,
    }));
    assert!(events.contains(&ApplyEvent::WaitStrategy {
        resource: "db".into(),
        strategy: WaitStrategyKind::Predicate,
    }));
    assert!(events.contains(&ApplyEvent::WaitStrategy {
        resource: "app".into(),
        strategy: WaitStrategyKind::FixedDelay,
    }));
}

#[tokio::test(start_paused = true)]
async fn consistency_timeout_fails_resource_and_blocks_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.provider().script(
        "db",
        Script {
            ready_after: Some(Duration::from_secs(150)),
            ..Default::default()
        },
    );
    let start = Instant::now();

    let report = engine
        .apply(database_and_service(), &[], ApplyOptions::default())
        .await
        .unwrap();

    assert_eq!(status(&report, "db"), ResourceStatus::Failed);
    assert_eq!(failure(&report, "db"), FailureKind::ConsistencyTimeout);
    assert!(report.state("db").unwrap().observed.contains_key("connection_name"));
    assert_eq!(status(&report, "app"), ResourceStatus::Pending);
    assert_eq!(engine.provider().count(Op::Create, "app"), 0);
    assert!(start.elapsed() >= Duration::from_secs(120));

    // The half-built database is replaced on the next run.
    let plan = engine.plan(database_and_service()).await.unwrap();
    let db = plan.entry("db").unwrap();
    assert_eq!((db.action, db.cause), (Action::Replace, Cause::Tainted));
    assert_eq!(plan.action_for("app"), Some(Action::Create));
}

// ── Secrets ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn secret_is_generated_once_across_applies() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    let plan = engine.plan(with_secrets()).await.unwrap();
    let user = plan.entry("user").unwrap();
    assert_eq!(user.attributes["password"], json!("db-password@pending"));
    assert_eq!(user.attributes["instance"], json!(KNOWN_AFTER_APPLY));

    let first = engine.apply(with_secrets(), &[], ApplyOptions::default()).await.unwrap();
    assert!(first.is_success(), "{first:?}");
    assert_eq!(
        first.state("user").unwrap().observed["password"],
        json!("db-password@1")
    );
    assert_eq!(
        first.state("db-password-v").unwrap().observed["ref"],
        json!("db-password@1")
    );

    let second = engine.apply(with_secrets(), &[], ApplyOptions::default()).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.actions["db-password-v"], Action::NoOp);
    assert_eq!(engine.secrets().version_count("db-password").await.unwrap(), 1);

    let created = engine.provider().calls().into_iter().find(|c| c.op == Op::Create && c.id == "user");
    assert_eq!(created.unwrap().attributes["password"], json!("db-password@1"));
}

#[tokio::test(start_paused = true)]
async fn raw_secret_never_leaves_the_secret_store() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let outputs = vec![
        OutputDef::new("password", OutputExpr::reference("user", "password")),
        OutputDef::new("password_ref", OutputExpr::reference("db-password-v", "ref")),
        OutputDef::new("connection", OutputExpr::reference("db", "connection_name")).sensitive(),
    ];

    let report = engine
        .apply(with_secrets(), &outputs, ApplyOptions::default())
        .await
        .unwrap();
    let plan = engine.plan(with_secrets()).await.unwrap();

    let value = engine
        .secrets()
        .access(&SecretRef::new("db-password", 1))
        .await
        .unwrap();
    let raw = value.expose();
    assert_eq!(raw.chars().count(), 24);

    let state_file = std::fs::read_to_string(engine.store().state_path()).unwrap();
    let report_json = serde_json::to_string(&report).unwrap();
    let plan_json = serde_json::to_string(&plan).unwrap();
    let calls = format!("{:?}", engine.provider().calls());
    for (what, text) in [
        ("state", &state_file),
        ("report", &report_json),
        ("plan", &plan_json),
        ("provider calls", &calls),
    ] {
        assert!(!text.contains(raw), "raw secret leaked into {what}");
    }

    assert_eq!(
        report.outputs["password"],
        ResolvedOutput::Value(json!("db-password@1"))
    );
    assert_eq!(
        report.outputs["password_ref"],
        ResolvedOutput::Value(json!("db-password@1"))
    );
    assert_eq!(report.outputs["connection"], ResolvedOutput::Sensitive);
}

#[tokio::test(start_paused = true)]
async fn refresh_keeps_secret_tokens_when_provider_echoes_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(with_secrets(), &[], ApplyOptions::default()).await.unwrap();

    let value = engine
        .secrets()
        .access(&SecretRef::new("db-password", 1))
        .await
        .unwrap();
    let raw = value.expose().to_string();
    engine.provider().set_live_attr("user", "password", json!(raw));

    let plan = engine.plan(with_secrets()).await.unwrap();
    assert_eq!(plan.action_for("user"), Some(Action::NoOp));
    assert!(!serde_json::to_string(&plan).unwrap().contains(&raw), "raw secret leaked into plan");

    let report = engine.apply(with_secrets(), &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(
        report.state("user").unwrap().observed["password"],
        json!("db-password@1")
    );
    let state_file = std::fs::read_to_string(engine.store().state_path()).unwrap();
    assert!(!state_file.contains(&raw), "raw secret leaked into state");
    assert!(!serde_json::to_string(&report).unwrap().contains(&raw), "raw secret leaked into report");
}

#[tokio::test(start_paused = true)]
async fn rotation_appends_a_version_and_updates_consumers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(with_secrets(), &[], ApplyOptions::default()).await.unwrap();

    let rotated = engine.rotate_secret("db-password").await.unwrap();
    assert_eq!(rotated, SecretRef::new("db-password", 2));

    let plan = engine.plan(with_secrets()).await.unwrap();
    assert_eq!(plan.action_for("db-password-v"), Some(Action::Update));
    assert_eq!(plan.action_for("db"), Some(Action::NoOp));
    let user = plan.entry("user").unwrap();
    assert_eq!(user.action, Action::Update);
    assert_eq!(user.drift.len(), 1);
    assert_eq!(user.drift[0].field, "password");
    assert_eq!(user.drift[0].expected, json!("db-password@2"));
    assert_eq!(user.drift[0].actual, json!("db-password@1"));

    let report = engine.apply(with_secrets(), &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(engine.provider().count(Op::Update, "user"), 1);
    assert_eq!(
        report.state("user").unwrap().observed["password"],
        json!("db-password@2")
    );
    assert_eq!(engine.secrets().version_count("db-password").await.unwrap(), 2);
}

// ── Changes, drift and teardown ──────────────────────────────────

#[tokio::test(start_paused = true)]
async fn mutable_change_updates_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();

    let mut changed = base();
    changed[1] = changed[1].clone().attr("description", "app tier");

    let plan = engine.plan(changed.clone()).await.unwrap();
    let subnet = plan.entry("subnet").unwrap();
    assert_eq!((subnet.action, subnet.cause), (Action::Update, Cause::SpecChanged));
    assert_eq!(subnet.drift[0].field, "description");
    assert!(!subnet.drift[0].immutable);

    let report = engine.apply(changed, &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(engine.provider().count(Op::Update, "subnet"), 1);
    assert_eq!(engine.provider().count(Op::Create, "subnet"), 1);
}

#[tokio::test(start_paused = true)]
async fn immutable_change_replaces() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();

    let mut changed = base();
    changed[2] = changed[2].clone().attr("name", "artifacts");

    let plan = engine.plan(changed.clone()).await.unwrap();
    let registry = plan.entry("registry").unwrap();
    assert_eq!(registry.action, Action::Replace);
    assert!(registry.drift.iter().any(|d| d.field == "name" && d.immutable));

    let before = engine.provider().mutations().len();
    let report = engine.apply(changed, &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(
        engine.provider().mutations()[before..],
        [
            (Op::Destroy, "registry".to_string()),
            (Op::Create, "registry".to_string())
        ]
    );
    assert_eq!(
        engine.provider().live("registry").unwrap()["name"],
        json!("artifacts")
    );
}

#[tokio::test(start_paused = true)]
async fn kind_change_destroys_the_old_kind_before_creating_the_new() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();

    let mut changed = base();
    changed[2] = ResourceSpec::new("registry", ResourceKind::LogMetric).attr("name", "images");

    let plan = engine.plan(changed.clone()).await.unwrap();
    let registry = plan.entry("registry").unwrap();
    assert_eq!((registry.action, registry.cause), (Action::Replace, Cause::KindChanged));
    assert_eq!(registry.kind, ResourceKind::LogMetric);
    assert_eq!(registry.drift[0].field, "kind");
    assert_eq!(registry.drift[0].actual, json!("registry"));

    // The old resource survives a failed teardown and stays in state under
    // its old kind.
    engine.provider().script(
        "registry",
        Script {
            fail_destroy: true,
            ..Default::default()
        },
    );
    let report = engine.apply(changed.clone(), &[], ApplyOptions::default()).await.unwrap();
    assert_eq!(status(&report, "registry"), ResourceStatus::Failed);
    let snapshot = engine.store().load().await.unwrap();
    assert_eq!(snapshot.get("registry").unwrap().kind, ResourceKind::Registry);
    assert!(engine.provider().live("registry").is_some());

    engine.provider().script("registry", Script::default());
    let before = engine.provider().calls().len();
    let report = engine.apply(changed, &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success(), "{report:?}");
    let mutations: Vec<(Op, ResourceKind)> = engine.provider().calls()[before..]
        .iter()
        .filter(|c| c.id == "registry" && matches!(c.op, Op::Create | Op::Destroy))
        .map(|c| (c.op, c.kind))
        .collect();
    assert_eq!(
        mutations,
        vec![
            (Op::Destroy, ResourceKind::Registry),
            (Op::Create, ResourceKind::LogMetric)
        ]
    );
    let snapshot = engine.store().load().await.unwrap();
    assert_eq!(snapshot.get("registry").unwrap().kind, ResourceKind::LogMetric);
}

#[tokio::test(start_paused = true)]
async fn failed_update_keeps_the_resource_in_state() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();
    engine.provider().script(
        "subnet",
        Script {
            permanent: true,
            ..Default::default()
        },
    );

    let mut changed = base();
    changed[1] = changed[1].clone().attr("description", "app tier");
    let report = engine.apply(changed.clone(), &[], ApplyOptions::default()).await.unwrap();
    assert_eq!(status(&report, "subnet"), ResourceStatus::Failed);

    let snapshot = engine.store().load().await.unwrap();
    let entry = snapshot.get("subnet").unwrap();
    assert!(entry.is_ready());
    assert!(entry.last_error.is_some());

    let plan = engine.plan(changed).await.unwrap();
    assert_eq!(plan.action_for("subnet"), Some(Action::Update));
}

#[tokio::test(start_paused = true)]
async fn refresh_detects_drift_and_missing_resources() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();

    engine.provider().set_live_attr("subnet", "region", json!("us-east1"));
    engine.provider().remove_live("registry");

    let plan = engine.plan(base()).await.unwrap();
    let subnet = plan.entry("subnet").unwrap();
    assert_eq!((subnet.action, subnet.cause), (Action::Replace, Cause::Drift));
    assert_eq!(subnet.drift[0].actual, json!("us-east1"));
    let registry = plan.entry("registry").unwrap();
    assert_eq!((registry.action, registry.cause), (Action::Create, Cause::Missing));
    assert_eq!(plan.action_for("vpc"), Some(Action::NoOp));

    let report = engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(engine.provider().count(Op::Create, "registry"), 2);
    assert_eq!(
        engine.provider().live("subnet").unwrap()["region"],
        json!("europe-west1")
    );
}

#[tokio::test(start_paused = true)]
async fn orphans_are_destroyed_dependents_first() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let mut specs = base();
    specs.push(
        ResourceSpec::new("connector", ResourceKind::Connector)
            .attr("name", "conn")
            .attr("region", "europe-west1")
            .reference("network", "vpc", "name")
            .depends_on("subnet"),
    );
    engine.apply(specs, &[], ApplyOptions::default()).await.unwrap();

    let remaining = vec![base().remove(2)];
    let plan = engine.plan(remaining.clone()).await.unwrap();
    let destroys: Vec<&str> = plan
        .by_action(Action::Destroy)
        .map(|e| e.resource_id.as_str())
        .collect();
    assert_eq!(destroys, vec!["connector", "subnet", "vpc"]);
    assert!(plan.by_action(Action::Destroy).all(|e| e.cause == Cause::Orphaned));
    assert_eq!(plan.action_for("registry"), Some(Action::NoOp));

    let before = engine.provider().mutations().len();
    let report = engine.apply(remaining, &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.destroyed().collect::<Vec<_>>(), vec!["connector", "subnet", "vpc"]);
    assert_eq!(
        engine.provider().mutations()[before..],
        [
            (Op::Destroy, "connector".to_string()),
            (Op::Destroy, "subnet".to_string()),
            (Op::Destroy, "vpc".to_string()),
        ]
    );

    let snapshot = engine.store().load().await.unwrap();
    assert_eq!(snapshot.resources.keys().collect::<Vec<_>>(), vec!["registry"]);
}

#[tokio::test(start_paused = true)]
async fn orphan_with_failed_dependent_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();
    engine.provider().script(
        "subnet",
        Script {
            fail_destroy: true,
            ..Default::default()
        },
    );

    let report = engine.apply(Vec::new(), &[], ApplyOptions::default()).await.unwrap();

    assert_eq!(report.outcome, ApplyOutcome::PartialFailure);
    assert_eq!(status(&report, "subnet"), ResourceStatus::Failed);
    assert_eq!(status(&report, "vpc"), ResourceStatus::Pending);
    assert_eq!(status(&report, "registry"), ResourceStatus::Destroyed);
    assert_eq!(engine.provider().count(Op::Destroy, "vpc"), 0);

    let snapshot = engine.store().load().await.unwrap();
    assert!(snapshot.get("vpc").is_some());
    assert!(snapshot.get("subnet").unwrap().last_error.is_some());
    assert!(snapshot.get("registry").is_none());
}

#[tokio::test(start_paused = true)]
async fn destroy_tears_down_in_reverse_wave_order() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();
    let before = engine.provider().mutations().len();

    let report = engine.destroy(base(), ApplyOptions::default()).await.unwrap();

    assert!(report.is_success(), "{report:?}");
    let destroyed: Vec<(Op, String)> = engine.provider().mutations()[before..].to_vec();
    assert_eq!(destroyed.len(), 3);
    assert_eq!(destroyed[0], (Op::Destroy, "subnet".to_string()));
    assert!(destroyed.iter().all(|(op, _)| *op == Op::Destroy));
    assert!(engine.store().load().await.unwrap().resources.is_empty());
}

// ── Run control ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancellation_stops_new_waves() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let cancel = CancellationToken::new();
    engine.provider().script(
        "vpc",
        Script {
            cancel_on_create: Some(cancel.clone()),
            ..Default::default()
        },
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = engine
        .apply(
            base(),
            &[],
            ApplyOptions {
                events: EventSink::new(tx),
                cancel,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.outcome, ApplyOutcome::Cancelled);
    assert_eq!(status(&report, "vpc"), ResourceStatus::Ready);
    assert_eq!(status(&report, "registry"), ResourceStatus::Ready);
    assert_eq!(status(&report, "subnet"), ResourceStatus::Pending);
    assert!(drain(&mut rx).contains(&ApplyEvent::Cancelled { remaining_waves: 1 }));

    let snapshot = engine.store().load().await.unwrap();
    assert!(snapshot.get("vpc").is_some());
    assert!(snapshot.get("subnet").is_none());
}

#[tokio::test(start_paused = true)]
async fn held_state_lock_rejects_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    let other = StateStore::new(dir.path());
    let held = other
        .lock("another-run", Duration::from_secs(3600))
        .await
        .unwrap();

    let err = engine.apply(base(), &[], ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        ProvisionerError::Storage(StorageError::Locked { ref holder, .. }) if holder == "another-run"
    ));
    assert!(engine.provider().calls().is_empty());

    held.release().await.unwrap();
    let report = engine.apply(base(), &[], ApplyOptions::default()).await.unwrap();
    assert!(report.is_success());
    assert!(!dir.path().join("state.lock").exists());
}
