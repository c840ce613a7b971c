//! End-to-end scenarios for the execution kernel.
//!
//! Each test drives a real supervisor over temp-dir storage with a scripted
//! executor, and asserts on statuses, node states, the event stream and the
//! on-disk checkpoint layout.

use async_trait::async_trait;
use maestro_hive::breaker::FailureCategory;
use maestro_hive::catalog::{
    BlueprintCatalog, IoContract, PersonaCatalog, PersonaSpec, ReuseDecision, ReusePlan,
};
use maestro_hive::config::EngineConfig;
use maestro_hive::errors::EngineError;
use maestro_hive::events::Event;
use maestro_hive::phase::PhaseState;
use maestro_hive::policy::{
    ExitCriterion, GateSpec, MasterContract, PhaseSlo, PhaseSlos, PolicyBundle, PolicyEngine,
};
use maestro_hive::reuse::{ReusableArtifact, ReuseSource};
use maestro_hive::runner::{
    ArtifactPayload, ExecuteOutput, ExecuteRequest, Executor, ExecutorFailure, MetricValue,
};
use maestro_hive::supervisor::{
    ExecutionSnapshot, ExecutionStatus, ExecutionSupervisor, StartRequest,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// =============================================================================
// Harness
// =============================================================================

#[derive(Clone)]
enum Behavior {
    /// Produce `out.md` plus passing metrics.
    Succeed,
    /// Produce `out.md` plus the given numeric metrics (missing keys default
    /// to passing values).
    SucceedWithMetrics(HashMap<String, f64>),
    /// Fail every attempt with the given failure.
    AlwaysFail(ExecutorFailure),
    /// Park until cancelled (crash and pause scenarios).
    Hang,
    /// Wait on a shared barrier, then succeed; proves concurrent dispatch.
    Rendezvous(Arc<tokio::sync::Barrier>),
}

struct ScriptedExecutor {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set(&self, persona_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(persona_id.to_string(), behavior);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn passing_output(metrics_override: Option<&HashMap<String, f64>>) -> ExecuteOutput {
        let mut metrics = HashMap::from([
            ("stub_rate".to_string(), MetricValue::Number(1.0)),
            ("test_coverage".to_string(), MetricValue::Number(0.9)),
        ]);
        if let Some(overrides) = metrics_override {
            for (k, v) in overrides {
                metrics.insert(k.clone(), MetricValue::Number(*v));
            }
        }
        ExecuteOutput {
            artifacts: vec![ArtifactPayload::inline("out.md", "produced")],
            metrics,
        }
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutput, ExecutorFailure> {
        self.calls.lock().unwrap().push(request.persona_id.clone());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&request.persona_id)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        match behavior {
            Behavior::Succeed => Ok(Self::passing_output(None)),
            Behavior::SucceedWithMetrics(overrides) => Ok(Self::passing_output(Some(&overrides))),
            Behavior::AlwaysFail(failure) => Err(failure),
            Behavior::Hang => {
                request.cancel.cancelled().await;
                Err(ExecutorFailure::error("cancelled"))
            }
            Behavior::Rendezvous(barrier) => {
                barrier.wait().await;
                Ok(Self::passing_output(None))
            }
        }
    }
}

fn persona(id: &str, phase: &str, deps: &[&str], parallel: bool, max_retries: u32) -> PersonaSpec {
    PersonaSpec {
        persona_id: id.to_string(),
        phase_id: phase.to_string(),
        dependencies: deps.iter().map(|d| d.to_string()).collect(),
        parallel_capable: parallel,
        timeout_secs: 30,
        max_retries,
        inputs: IoContract::default(),
        outputs: IoContract {
            required: vec!["out.md".into()],
            optional: vec![],
        },
        executor_selector: format!("agent:{id}"),
        backoff: None,
    }
}

fn policy_bundle() -> PolicyBundle {
    PolicyBundle {
        contract: MasterContract {
            default_gates: vec![GateSpec::blocking("stub_rate", 1.0)],
            persona_gates: HashMap::new(),
        },
        slos: PhaseSlos::new(
            vec![
                PhaseSlo::new("requirements", 0),
                PhaseSlo::new("implementation", 1),
                PhaseSlo::new("testing", 2),
            ],
            PhaseSlos::default_scale(),
        )
        .unwrap(),
    }
}

fn config(dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default()
        .with_storage_root(dir)
        .with_max_workers(2)
        .with_max_phase_iterations(5);
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_max_ms = 5;
    config.retry.backoff_jitter = 0.0;
    config.retry.breaker_threshold = 3;
    config.retry.breaker_cooldown_secs = 1;
    config
}

fn supervisor(
    config: EngineConfig,
    personas: Vec<PersonaSpec>,
    bundle: PolicyBundle,
    executor: Arc<ScriptedExecutor>,
) -> ExecutionSupervisor {
    ExecutionSupervisor::new(
        config,
        PolicyEngine::new(bundle),
        PersonaCatalog::new(personas).unwrap(),
        BlueprintCatalog::default(),
    )
    .unwrap()
    .with_executor(executor)
}

fn start_request(id: &str, personas: &[&str]) -> StartRequest {
    StartRequest {
        execution_id: Some(id.to_string()),
        requirement: "Build a REST API for task tracking".to_string(),
        personas: personas.iter().map(|p| p.to_string()).collect(),
        blueprint_id: None,
        reuse: ReusePlan::default(),
    }
}

async fn wait_until(
    supervisor: &ExecutionSupervisor,
    execution_id: &str,
    pred: impl Fn(&ExecutionSnapshot) -> bool,
) -> ExecutionSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = supervisor.status(execution_id).await.unwrap();
        if pred(&snapshot) {
            return snapshot;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached; last snapshot: {snapshot:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn read_events(dir: &Path, execution_id: &str) -> Vec<Event> {
    let path = dir.join("checkpoints").join(execution_id).join("events.log");
    std::fs::read_to_string(&path)
        .unwrap_or_default()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn events_of_type<'a>(events: &'a [Event], type_name: &str) -> Vec<&'a Event> {
    events
        .iter()
        .filter(|e| {
            serde_json::to_value(e).unwrap()["type"]
                .as_str()
                .is_some_and(|t| t == type_name)
        })
        .collect()
}

fn node_state(snapshot: &ExecutionSnapshot, node_id: &str) -> maestro_hive::dag::node::NodeState {
    snapshot
        .nodes
        .iter()
        .find(|n| n.node_id == node_id)
        .unwrap_or_else(|| panic!("node {node_id} missing"))
        .state
}

// =============================================================================
// Scenario A: linear happy path across three phases
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_a_linear_happy_path() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], false, 1),
            persona("qa_engineer", "testing", &["backend_developer"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup.start(start_request("exec-a", &[
        "requirement_analyst",
        "backend_developer",
        "qa_engineer",
    ]))
    .await
    .unwrap();

    let status = sup.wait(&id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let snapshot = sup.status(&id).await.unwrap();
    assert_eq!(snapshot.progress_percent, 100.0);
    for phase in &snapshot.phases {
        assert_eq!(phase.state, PhaseState::Completed);
        assert_eq!(phase.iteration_index, 0);
    }

    // Three node_completed events in dependency order.
    let events = read_events(dir.path(), &id);
    let completed = events_of_type(&events, "node_completed");
    let order: Vec<String> = completed
        .iter()
        .map(|e| serde_json::to_value(e).unwrap()["node_id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(
        order,
        vec!["requirement_analyst", "backend_developer", "qa_engineer"]
    );

    // Sequence numbers strictly increase.
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[1] > w[0]));

    assert_eq!(
        executor.calls(),
        vec!["requirement_analyst", "backend_developer", "qa_engineer"]
    );
}

// =============================================================================
// Scenario B: parallel wave in the implementation phase
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_b_parallel_wave_runs_concurrently() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    // Both implementation nodes must be in flight at once to pass the
    // barrier; a sequential scheduler would deadlock here.
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    executor.set("backend_developer", Behavior::Rendezvous(barrier.clone()));
    executor.set("frontend_developer", Behavior::Rendezvous(barrier));

    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], true, 1),
            persona("frontend_developer", "implementation", &["requirement_analyst"], true, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup.start(start_request("exec-b", &[
        "requirement_analyst",
        "backend_developer",
        "frontend_developer",
    ]))
    .await
    .unwrap();

    let status = tokio::time::timeout(Duration::from_secs(10), sup.wait(&id))
        .await
        .expect("parallel wave deadlocked")
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    // The analyst finished before either implementation node started.
    let events = read_events(dir.path(), &id);
    let analyst_done = events_of_type(&events, "node_completed")
        .iter()
        .find(|e| serde_json::to_value(e).unwrap()["node_id"] == "requirement_analyst")
        .map(|e| e.sequence)
        .unwrap();
    for started in events_of_type(&events, "node_started") {
        let value = serde_json::to_value(started).unwrap();
        if value["node_id"] != "requirement_analyst" {
            assert!(started.sequence > analyst_done);
        }
    }
}

// =============================================================================
// Scenario C: the phase refuses to advance on incomplete work
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_c_failing_gate_reworks_then_blocks() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    // backend reports success but with a stub_rate the gate rejects.
    executor.set(
        "backend_developer",
        Behavior::SucceedWithMetrics(HashMap::from([("stub_rate".to_string(), 0.5)])),
    );

    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], false, 1),
            persona("qa_engineer", "testing", &["backend_developer"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup.start(start_request("exec-c", &[
        "requirement_analyst",
        "backend_developer",
        "qa_engineer",
    ]))
    .await
    .unwrap();

    let status = sup.wait(&id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let snapshot = sup.status(&id).await.unwrap();
    let impl_phase = snapshot
        .phases
        .iter()
        .find(|p| p.phase_id == "implementation")
        .unwrap();
    assert_eq!(impl_phase.state, PhaseState::Blocked);
    assert_eq!(impl_phase.iteration_index, 4);

    // The backend node ran once per iteration; testing never started.
    let backend_runs = executor
        .calls()
        .iter()
        .filter(|c| *c == "backend_developer")
        .count();
    assert_eq!(backend_runs, 5);
    assert!(!executor.calls().contains(&"qa_engineer".to_string()));

    // Progressive thresholds rose along the scale.
    let events = read_events(dir.path(), &id);
    let thresholds: Vec<f64> = events_of_type(&events, "gate_fail")
        .iter()
        .filter_map(|e| {
            let value = serde_json::to_value(e).unwrap();
            (value["subject"] == "backend_developer").then(|| value["threshold"].as_f64().unwrap())
        })
        .collect();
    assert_eq!(thresholds.len(), 5);
    for (observed, expected) in thresholds.iter().zip([0.60, 0.70, 0.80, 0.90, 0.95]) {
        assert!((observed - expected).abs() < 1e-9, "got {thresholds:?}");
    }

    // Rework plans were published with the failing node.
    let reworks = events_of_type(&events, "phase_rework");
    assert_eq!(reworks.len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_iteration_budget_blocks_immediately() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    executor.set(
        "backend_developer",
        Behavior::SucceedWithMetrics(HashMap::from([("stub_rate".to_string(), 0.0)])),
    );

    let sup = supervisor(
        config(dir.path()).with_max_phase_iterations(0),
        vec![persona("backend_developer", "implementation", &[], false, 1)],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup
        .start(start_request("exec-zero", &["backend_developer"]))
        .await
        .unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Failed);
    assert_eq!(
        executor
            .calls()
            .iter()
            .filter(|c| *c == "backend_developer")
            .count(),
        1
    );
}

// =============================================================================
// Scenario D: crash and resume
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_crash_and_resume_skips_completed_nodes() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());

    // First process: frontend hangs mid-flight.
    let executor1 = ScriptedExecutor::new();
    executor1.set("frontend_developer", Behavior::Hang);
    let personas = || {
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], true, 1),
            persona("frontend_developer", "implementation", &["requirement_analyst"], true, 1),
        ]
    };
    let sup1 = supervisor(cfg.clone(), personas(), policy_bundle(), executor1.clone());
    let id = sup1
        .start(start_request("exec-d", &[
            "requirement_analyst",
            "backend_developer",
            "frontend_developer",
        ]))
        .await
        .unwrap();

    use maestro_hive::dag::node::NodeState;
    wait_until(&sup1, &id, |s| {
        node_state(s, "backend_developer") == NodeState::Completed
            && node_state(s, "frontend_developer") == NodeState::Running
    })
    .await;

    // Kill the process abruptly; disk keeps the last checkpoint.
    sup1.shutdown().await;
    drop(sup1);

    // Second process: recover and finish.
    let executor2 = ScriptedExecutor::new();
    let sup2 = supervisor(cfg, personas(), policy_bundle(), executor2.clone());
    let recovered = sup2.recover_all().await.unwrap();
    assert_eq!(recovered, vec![id.clone()]);

    let status = sup2.wait(&id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    // Only the interrupted node re-executed.
    assert_eq!(executor2.calls(), vec!["frontend_developer"]);

    // The event sequence continued from the stored cursor across the
    // restart: one strictly increasing line per event in events.log.
    let events = read_events(dir.path(), &id);
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[1] > w[0]), "{sequences:?}");
}

// =============================================================================
// Scenario E: persona-level reuse
// =============================================================================

struct FileReuseSource {
    artifacts: HashMap<String, Vec<ReusableArtifact>>,
}

#[async_trait]
impl ReuseSource for FileReuseSource {
    async fn resolve(&self, source_ref: &str) -> anyhow::Result<Vec<ReusableArtifact>> {
        self.artifacts
            .get(source_ref)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown source_ref {source_ref}"))
    }
}

fn reuse_source(dir: &Path, source_ref: &str, content: &str, lie_about_hash: bool) -> FileReuseSource {
    use sha2::{Digest, Sha256};
    let path: PathBuf = dir.join("source-out.md");
    std::fs::write(&path, content).unwrap();
    let sha = if lie_about_hash {
        "0".repeat(64)
    } else {
        hex::encode(Sha256::digest(content.as_bytes()))
    };
    FileReuseSource {
        artifacts: HashMap::from([(
            source_ref.to_string(),
            vec![ReusableArtifact {
                name: "out.md".to_string(),
                path,
                expected_sha256: sha,
                labels: vec!["design".to_string()],
                contract_version: None,
            }],
        )]),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_e_reuse_skips_execution_with_verified_artifacts() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let source = reuse_source(dir.path(), "exec-prior/architect", "# Architecture", false);

    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("architect", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["architect"], false, 1),
            persona("qa_engineer", "testing", &["backend_developer"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    )
    .with_reuse_source(Arc::new(source));

    let mut request = start_request("exec-e", &["architect", "backend_developer", "qa_engineer"]);
    request.reuse.decisions.insert(
        "architect".to_string(),
        ReuseDecision::Reuse {
            source_ref: "exec-prior/architect".to_string(),
        },
    );

    let id = sup.start(request).await.unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);

    let snapshot = sup.status(&id).await.unwrap();
    use maestro_hive::dag::node::NodeState;
    assert_eq!(node_state(&snapshot, "architect"), NodeState::Reused);
    assert!(snapshot.nodes.iter().any(|n| n.node_id == "architect" && n.reused));
    assert_eq!(snapshot.progress_percent, 100.0);

    // The architect never reached the executor; its artifact was imported
    // under this execution's canonical path.
    assert!(!executor.calls().contains(&"architect".to_string()));
    let imported = dir
        .path()
        .join("artifacts")
        .join(&id)
        .join("0")
        .join("architect")
        .join("out.md");
    assert!(imported.exists());

    let events = read_events(dir.path(), &id);
    assert_eq!(events_of_type(&events, "node_reused").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reuse_hash_mismatch_downgrades_to_execution() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let source = reuse_source(dir.path(), "exec-prior/architect", "# Architecture", true);

    let sup = supervisor(
        config(dir.path()),
        vec![persona("architect", "requirements", &[], false, 1)],
        policy_bundle(),
        executor.clone(),
    )
    .with_reuse_source(Arc::new(source));

    let mut request = start_request("exec-e2", &["architect"]);
    request.reuse.decisions.insert(
        "architect".to_string(),
        ReuseDecision::Reuse {
            source_ref: "exec-prior/architect".to_string(),
        },
    );

    let id = sup.start(request).await.unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);

    // Downgraded: the persona executed normally.
    assert_eq!(executor.calls(), vec!["architect"]);
    let events = read_events(dir.path(), &id);
    assert_eq!(events_of_type(&events, "reuse_downgraded").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_reuse_completes_without_executor_calls() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    use sha2::{Digest, Sha256};
    let mut artifacts = HashMap::new();
    for persona_id in ["architect", "backend_developer"] {
        let path = dir.path().join(format!("{persona_id}-out.md"));
        let content = format!("# {persona_id}");
        std::fs::write(&path, &content).unwrap();
        artifacts.insert(
            format!("prior/{persona_id}"),
            vec![ReusableArtifact {
                name: "out.md".to_string(),
                path,
                expected_sha256: hex::encode(Sha256::digest(content.as_bytes())),
                labels: vec![],
                contract_version: None,
            }],
        );
    }

    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("architect", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["architect"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    )
    .with_reuse_source(Arc::new(FileReuseSource { artifacts }));

    let mut request = start_request("exec-all-reuse", &["architect", "backend_developer"]);
    for persona_id in ["architect", "backend_developer"] {
        request.reuse.decisions.insert(
            persona_id.to_string(),
            ReuseDecision::Reuse {
                source_ref: format!("prior/{persona_id}"),
            },
        );
    }

    let id = sup.start(request).await.unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);
    assert!(executor.calls().is_empty());
}

// =============================================================================
// Scenario F: circuit breaker
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_f_breaker_opens_probes_and_execution_fails() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    executor.set(
        "backend_developer",
        Behavior::AlwaysFail(ExecutorFailure::error("compiler crashed")),
    );

    let sup = supervisor(
        config(dir.path()).with_max_phase_iterations(1),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            // Five attempts against a threshold of three forces the breaker
            // through open -> half-open at least once.
            persona("backend_developer", "implementation", &["requirement_analyst"], false, 4),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup
        .start(start_request("exec-f", &["requirement_analyst", "backend_developer"]))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(30), sup.wait(&id))
        .await
        .expect("breaker cooldown never released dispatch")
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let snapshot = sup.status(&id).await.unwrap();
    use maestro_hive::dag::node::NodeState;
    assert_eq!(node_state(&snapshot, "backend_developer"), NodeState::Failed);
    let backend = snapshot
        .nodes
        .iter()
        .find(|n| n.node_id == "backend_developer")
        .unwrap();
    // Retry bound: attempt_count <= max_retries + 1.
    assert_eq!(backend.attempt_count, 5);

    let events = read_events(dir.path(), &id);
    assert!(!events_of_type(&events, "breaker_opened").is_empty());
    assert!(!events_of_type(&events, "breaker_half_open").is_empty());
    assert!(
        snapshot.last_failure.is_some(),
        "failure report missing from snapshot"
    );
    assert_eq!(
        snapshot.last_failure.as_ref().unwrap().category,
        FailureCategory::ExecutorError
    );
    assert!(!snapshot.recommendations.is_empty());
}

// =============================================================================
// Control surface laws
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_then_resume_is_equivalent_to_never_pausing() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], false, 1),
            persona("qa_engineer", "testing", &["backend_developer"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup.start(start_request("exec-pause", &[
        "requirement_analyst",
        "backend_developer",
        "qa_engineer",
    ]))
    .await
    .unwrap();

    sup.pause(&id).await.unwrap();
    let status = sup.wait(&id).await.unwrap();
    // Either it paused in time, or the run was already terminal.
    if status == ExecutionStatus::Paused {
        // Idempotent pause.
        sup.pause(&id).await.unwrap();
        sup.resume(&id).await.unwrap();
        assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);
    } else {
        assert_eq!(status, ExecutionStatus::Completed);
    }

    // Equivalent to never pausing: every node executed exactly once.
    let mut calls = executor.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec!["backend_developer", "qa_engineer", "requirement_analyst"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_is_noop_on_terminal_execution() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let sup = supervisor(
        config(dir.path()),
        vec![persona("requirement_analyst", "requirements", &[], false, 1)],
        policy_bundle(),
        executor,
    );

    let id = sup
        .start(start_request("exec-cancel", &["requirement_analyst"]))
        .await
        .unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);

    sup.cancel(&id).await.unwrap();
    let snapshot = sup.status(&id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_stops_dispatch_and_drains() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    executor.set("backend_developer", Behavior::Hang);
    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], false, 1),
            persona("qa_engineer", "testing", &["backend_developer"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup.start(start_request("exec-cancel2", &[
        "requirement_analyst",
        "backend_developer",
        "qa_engineer",
    ]))
    .await
    .unwrap();

    use maestro_hive::dag::node::NodeState;
    wait_until(&sup, &id, |s| {
        node_state(s, "backend_developer") == NodeState::Running
    })
    .await;

    sup.cancel(&id).await.unwrap();
    let status = sup.wait(&id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Cancelled);
    // The testing phase never dispatched.
    assert!(!executor.calls().contains(&"qa_engineer".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn trigger_rework_rejected_without_force_then_reopens_with_it() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup
        .start(start_request("exec-rework", &["requirement_analyst", "backend_developer"]))
        .await
        .unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);

    let rejected = sup.trigger_rework(&id, "implementation", false).await;
    assert!(matches!(rejected, Err(EngineError::ReworkRejected { .. })));

    sup.trigger_rework(&id, "implementation", true).await.unwrap();
    let snapshot = sup.status(&id).await.unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Paused);
    let impl_phase = snapshot
        .phases
        .iter()
        .find(|p| p.phase_id == "implementation")
        .unwrap();
    assert_eq!(impl_phase.state, PhaseState::AwaitingRework);
    assert_eq!(impl_phase.iteration_index, 1);

    sup.resume(&id).await.unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);
    // backend ran twice: the original pass plus the forced rework.
    assert_eq!(
        executor
            .calls()
            .iter()
            .filter(|c| *c == "backend_developer")
            .count(),
        2
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_executor_refuses_to_start() {
    let dir = TempDir::new().unwrap();
    let sup = ExecutionSupervisor::new(
        config(dir.path()),
        PolicyEngine::new(policy_bundle()),
        PersonaCatalog::new(vec![persona("requirement_analyst", "requirements", &[], false, 1)])
            .unwrap(),
        BlueprintCatalog::default(),
    )
    .unwrap();

    let result = sup
        .start(start_request("exec-noexec", &["requirement_analyst"]))
        .await;
    assert!(matches!(result, Err(EngineError::MissingExecutor)));
    // Nothing was persisted for the refused execution.
    assert!(sup.checkpoints().list().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn validation_failure_never_starts_execution() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let sup = supervisor(
        config(dir.path()),
        vec![
            persona("a", "implementation", &["b"], false, 1),
            persona("b", "implementation", &["a"], false, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let result = sup.start(start_request("exec-cycle", &["a", "b"])).await;
    assert!(matches!(
        result,
        Err(EngineError::Build(
            maestro_hive::errors::BuildError::WorkflowCycle { .. }
        ))
    ));
    assert!(executor.calls().is_empty());
    assert!(sup.checkpoints().list().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_worker_is_sequential_with_identical_outcome() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let sup = supervisor(
        config(dir.path()).with_max_workers(1),
        vec![
            persona("requirement_analyst", "requirements", &[], false, 1),
            persona("backend_developer", "implementation", &["requirement_analyst"], true, 1),
            persona("frontend_developer", "implementation", &["requirement_analyst"], true, 1),
        ],
        policy_bundle(),
        executor.clone(),
    );

    let id = sup.start(start_request("exec-seq", &[
        "requirement_analyst",
        "backend_developer",
        "frontend_developer",
    ]))
    .await
    .unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);

    let snapshot = sup.status(&id).await.unwrap();
    assert_eq!(snapshot.progress_percent, 100.0);
    assert_eq!(executor.calls().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_exit_criterion_blocks_the_phase() {
    let dir = TempDir::new().unwrap();
    let executor = ScriptedExecutor::new();
    let bundle = PolicyBundle {
        contract: MasterContract::default(),
        slos: PhaseSlos::new(
            vec![PhaseSlo::new("implementation", 0).with_exit(vec![
                ExitCriterion::Completeness,
                ExitCriterion::Unknown {
                    name: "quantum_readiness".to_string(),
                },
            ])],
            PhaseSlos::default_scale(),
        )
        .unwrap(),
    };

    let sup = supervisor(
        config(dir.path()),
        vec![persona("backend_developer", "implementation", &[], false, 1)],
        bundle,
        executor,
    );

    let id = sup
        .start(start_request("exec-unknown", &["backend_developer"]))
        .await
        .unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Failed);

    let snapshot = sup.status(&id).await.unwrap();
    assert_eq!(snapshot.phases[0].state, PhaseState::Blocked);
    // No rework for an unknown criterion: fail-safe, immediately blocked.
    assert_eq!(snapshot.phases[0].iteration_index, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_recovers_from_transient_failures() {
    struct FlakyExecutor {
        failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Executor for FlakyExecutor {
        async fn execute(
            &self,
            _request: ExecuteRequest,
        ) -> Result<ExecuteOutput, ExecutorFailure> {
            *self.calls.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(ExecutorFailure::error("transient network failure"));
            }
            Ok(ScriptedExecutor::passing_output(None))
        }
    }

    let dir = TempDir::new().unwrap();
    let flaky = Arc::new(FlakyExecutor {
        failures_left: Mutex::new(2),
        calls: Mutex::new(0),
    });
    let sup = ExecutionSupervisor::new(
        config(dir.path()),
        PolicyEngine::new(policy_bundle()),
        PersonaCatalog::new(vec![persona("backend_developer", "implementation", &[], false, 3)])
            .unwrap(),
        BlueprintCatalog::default(),
    )
    .unwrap()
    .with_executor(flaky.clone());

    let id = sup
        .start(start_request("exec-flaky", &["backend_developer"]))
        .await
        .unwrap();
    assert_eq!(sup.wait(&id).await.unwrap(), ExecutionStatus::Completed);
    assert_eq!(*flaky.calls.lock().unwrap(), 3);

    let snapshot = sup.status(&id).await.unwrap();
    let node = &snapshot.nodes[0];
    assert_eq!(node.attempt_count, 3);
}
