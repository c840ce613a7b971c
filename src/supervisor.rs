//! Execution supervision: the external control surface.
//!
//! One supervisor owns many executions; each execution has exactly one
//! driver task walking its phases in ordinal order. All mutable execution
//! state lives behind a per-execution lock in `ExecState`; the DAG executor
//! mutates node state under that lock, and every observable transition is
//! checkpointed before the supervisor reports it.

use crate::audit::{AuditAction, AuditLog};
use crate::breaker::FailureReport;
use crate::catalog::{BlueprintCatalog, PersonaCatalog, ReusePlan};
use crate::checkpoint::{CheckpointStore, SCHEMA_VERSION, Snapshot};
use crate::config::EngineConfig;
use crate::context::ContextStore;
use crate::dag::builder::{PhaseLayout, WorkflowBuilder, WorkflowDag};
use crate::dag::node::NodeState;
use crate::errors::EngineError;
use crate::events::{EventBus, EventKind};
use crate::phase::{PhaseController, PhaseOutcome, PhaseRecord, PhaseState, ReworkScope};
use crate::policy::{PhaseVerdict, PolicyEngine};
use crate::reuse::{ReuseCoordinator, ReuseSource};
use crate::runner::{BackoffPolicy, Executor, RetryWrapper};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio_util::sync::CancellationToken;

/// Top-level execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Persistent top-level execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub requirement: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint_id: Option<String>,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(execution_id: &str, requirement: &str, blueprint_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.to_string(),
            requirement: requirement.to_string(),
            blueprint_id,
            status: ExecutionStatus::Pending,
            current_phase: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Bump `updated_at`, keeping it monotone even across clock hiccups.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// All mutable state of one execution, guarded by the execution lock.
pub struct ExecState {
    pub execution: ExecutionRecord,
    pub dag: WorkflowDag,
    pub phases: Vec<PhaseRecord>,
    pub retry: RetryWrapper,
    pub last_failure: Option<FailureReport>,
    pub last_verdicts: HashMap<String, PhaseVerdict>,
    pub bypassed_gates: HashSet<String>,
}

impl ExecState {
    /// Snapshot for the checkpoint store.
    pub fn snapshot(&self, event_cursor: u64) -> Snapshot {
        let mut bypassed: Vec<String> = self.bypassed_gates.iter().cloned().collect();
        bypassed.sort();
        Snapshot {
            schema_version: SCHEMA_VERSION,
            execution: self.execution.clone(),
            phases: self.phases.clone(),
            nodes: self.dag.nodes().to_vec(),
            breakers: self.retry.snapshot(),
            event_cursor,
            last_failure: self.last_failure.clone(),
            bypassed_gates: bypassed,
        }
    }

    /// (completed + reused) / total, in percent.
    pub fn progress_percent(&self) -> f64 {
        let total = self.dag.len();
        if total == 0 {
            return 100.0;
        }
        let done = self
            .dag
            .nodes()
            .iter()
            .filter(|n| n.state.is_terminal_good())
            .count();
        (done as f64 / total as f64) * 100.0
    }
}

/// Shared handles the scheduler and controllers operate through.
#[derive(Clone)]
pub struct ExecutionContext {
    pub state: Arc<Mutex<ExecState>>,
    pub events: Arc<EventBus>,
    pub context: Arc<ContextStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub executor: Arc<dyn Executor>,
    pub cancel: CancellationToken,
    pub paused: watch::Receiver<bool>,
    pub workers: Arc<Semaphore>,
    pub global_workers: Arc<Semaphore>,
    pub backoff: BackoffPolicy,
    pub deadline: Option<tokio::time::Instant>,
}

impl ExecutionContext {
    /// Persist the current state; called after every observable transition.
    pub fn persist(&self, state: &ExecState) -> Result<(), EngineError> {
        self.checkpoints.save(&state.snapshot(self.events.cursor()))?;
        Ok(())
    }
}

/// Request to start a new execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Generated when absent
    #[serde(default)]
    pub execution_id: Option<String>,
    pub requirement: String,
    /// Explicit persona set; when empty the blueprint supplies it
    #[serde(default)]
    pub personas: Vec<String>,
    #[serde(default)]
    pub blueprint_id: Option<String>,
    #[serde(default)]
    pub reuse: ReusePlan,
}

/// Per-phase progress in the status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub phase_id: String,
    pub state: PhaseState,
    pub iteration_index: u32,
}

/// Per-node progress in the status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProgress {
    pub node_id: String,
    pub state: NodeState,
    pub attempt_count: u32,
    pub reused: bool,
}

/// The control-surface status payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSnapshot {
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<String>,
    pub progress_percent: f64,
    pub phases: Vec<PhaseProgress>,
    pub nodes: Vec<NodeProgress>,
    #[serde(default)]
    pub last_verdicts: HashMap<String, PhaseVerdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureReport>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

struct ExecutionHandle {
    ctx: ExecutionContext,
    pause: watch::Sender<bool>,
    driver: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

/// Owns executions end to end and exposes start / status / pause / resume /
/// cancel / rework.
pub struct ExecutionSupervisor {
    config: EngineConfig,
    policy: Arc<PolicyEngine>,
    catalog: Arc<PersonaCatalog>,
    blueprints: Arc<BlueprintCatalog>,
    executor: Option<Arc<dyn Executor>>,
    reuse_source: Option<Arc<dyn ReuseSource>>,
    checkpoints: Arc<CheckpointStore>,
    context: Arc<ContextStore>,
    audit: Arc<AuditLog>,
    global_workers: Arc<Semaphore>,
    executions: Mutex<HashMap<String, ExecutionHandle>>,
}

impl ExecutionSupervisor {
    pub fn new(
        config: EngineConfig,
        policy: PolicyEngine,
        catalog: PersonaCatalog,
        blueprints: BlueprintCatalog,
    ) -> Result<Self, EngineError> {
        let checkpoints = CheckpointStore::open(
            &config.storage.checkpoint_root,
            config.storage.io_retries,
        )?;
        let context = ContextStore::open(&config.storage.artifact_root)?;
        let audit = AuditLog::open(&config.storage.checkpoint_root.join("audit.jsonl"))?;
        let global_workers = Arc::new(Semaphore::new(config.engine.global_max_workers.max(1)));
        Ok(Self {
            config,
            policy: Arc::new(policy),
            catalog: Arc::new(catalog),
            blueprints: Arc::new(blueprints),
            executor: None,
            reuse_source: None,
            checkpoints: Arc::new(checkpoints),
            context: Arc::new(context),
            audit: Arc::new(audit),
            global_workers,
            executions: Mutex::new(HashMap::new()),
        })
    }

    /// Install the executor callback. Without one, `start` refuses.
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Install the external reuse artifact source.
    pub fn with_reuse_source(mut self, source: Arc<dyn ReuseSource>) -> Self {
        self.reuse_source = Some(source);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Validate, build the DAG, persist the initial snapshot and spawn the
    /// driver. Returns the execution id as the ack.
    pub async fn start(&self, request: StartRequest) -> Result<String, EngineError> {
        if self.executor.is_none() {
            return Err(EngineError::MissingExecutor);
        }

        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| format!("exec-{}", uuid::Uuid::new_v4().simple()));

        let (personas, blueprint_id) = if request.personas.is_empty() {
            let blueprint_id =
                request
                    .blueprint_id
                    .clone()
                    .ok_or_else(|| EngineError::Build(
                        crate::errors::BuildError::EmptyWorkflow,
                    ))?;
            let blueprint = self.blueprints.resolve(&blueprint_id)?;
            (blueprint.personas.clone(), Some(blueprint_id))
        } else {
            (request.personas.clone(), request.blueprint_id.clone())
        };

        let layout = self.policy.layout();
        let dag = WorkflowBuilder::new(&self.catalog, layout).build(&personas)?;

        // One record per phase that actually has nodes, in ordinal order.
        let phases: Vec<PhaseRecord> = dag
            .layout()
            .phases()
            .iter()
            .enumerate()
            .filter(|(_, pid)| !dag.phase_nodes(pid).is_empty())
            .map(|(ordinal, pid)| PhaseRecord::new(pid, ordinal as u32))
            .collect();

        let events = self.open_event_bus(&execution_id, 0)?;
        let state = ExecState {
            execution: ExecutionRecord::new(&execution_id, &request.requirement, blueprint_id),
            dag,
            phases,
            retry: RetryWrapper::new(
                self.config.retry.breaker_threshold,
                self.config.breaker_cooldown(),
            ),
            last_failure: None,
            last_verdicts: HashMap::new(),
            bypassed_gates: HashSet::new(),
        };

        let (pause_tx, pause_rx) = watch::channel(false);
        let ctx = self.make_context(state, events, pause_rx);
        {
            let state = ctx.state.lock().await;
            ctx.persist(&state)?;
        }

        let handle = ExecutionHandle {
            ctx: ctx.clone(),
            pause: pause_tx,
            driver: Arc::new(std::sync::Mutex::new(None)),
        };
        self.spawn_driver(&handle, DriverAnnounce::Started, Some(request.reuse));
        self.executions
            .lock()
            .await
            .insert(execution_id.clone(), handle);

        tracing::info!(execution_id, "execution started");
        Ok(execution_id)
    }

    /// Current status, from memory when live, from the checkpoint otherwise.
    pub async fn status(&self, execution_id: &str) -> Result<ExecutionSnapshot, EngineError> {
        if let Some(handle) = self.executions.lock().await.get(execution_id) {
            let state = handle.ctx.state.lock().await;
            return Ok(Self::snapshot_view(&state));
        }
        let snapshot = self
            .checkpoints
            .load(execution_id)?
            .ok_or_else(|| EngineError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;
        Ok(Self::view_from_checkpoint(&snapshot))
    }

    /// Live event stream for an execution.
    pub async fn subscribe(
        &self,
        execution_id: &str,
    ) -> Result<tokio::sync::broadcast::Receiver<crate::events::Event>, EngineError> {
        let executions = self.executions.lock().await;
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;
        Ok(handle.ctx.events.subscribe())
    }

    /// Block until the execution is terminal or parked (paused).
    pub async fn wait(&self, execution_id: &str) -> Result<ExecutionStatus, EngineError> {
        loop {
            let status = self.status(execution_id).await?.status;
            if status.is_terminal() || status == ExecutionStatus::Paused {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop new dispatches and drain in-flight work. Idempotent.
    pub async fn pause(&self, execution_id: &str) -> Result<(), EngineError> {
        let executions = self.executions.lock().await;
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;
        let state = handle.ctx.state.lock().await;
        if state.execution.status.is_terminal() {
            return Ok(());
        }
        handle.pause.send_replace(true);
        tracing::info!(execution_id, "pause requested");
        Ok(())
    }

    /// Restart dispatch from the checkpointed state. Idempotent.
    pub async fn resume(&self, execution_id: &str) -> Result<(), EngineError> {
        let executions = self.executions.lock().await;
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;
        handle.pause.send_replace(false);

        let respawn = {
            let mut state = handle.ctx.state.lock().await;
            match state.execution.status {
                ExecutionStatus::Paused => {
                    state.execution.status = ExecutionStatus::Running;
                    state.execution.touch();
                    handle.ctx.events.publish(EventKind::ExecutionResumed);
                    handle.ctx.persist(&state)?;
                    true
                }
                ExecutionStatus::Running | ExecutionStatus::Pending => false,
                status if status.is_terminal() => {
                    return Err(EngineError::Terminal {
                        execution_id: execution_id.to_string(),
                        status: status.to_string(),
                    });
                }
                _ => false,
            }
        };

        if respawn {
            // The new driver awaits the old one first, so a drain racing
            // this resume cannot leave the execution unattended.
            self.spawn_driver(handle, DriverAnnounce::Quiet, None);
        }
        Ok(())
    }

    /// Cooperative stop. A no-op on terminal executions.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), EngineError> {
        let executions = self.executions.lock().await;
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;

        let driver_done = {
            let mut state = handle.ctx.state.lock().await;
            if state.execution.status.is_terminal() {
                return Ok(());
            }
            state.execution.status = ExecutionStatus::Cancelling;
            state.execution.touch();
            handle.ctx.persist(&state)?;
            handle
                .driver
                .lock()
                .expect("driver slot poisoned")
                .as_ref()
                .is_none_or(tokio::task::JoinHandle::is_finished)
        };
        handle.ctx.cancel.cancel();

        if driver_done {
            // No driver to drain; finalise directly.
            let mut state = handle.ctx.state.lock().await;
            state.execution.status = ExecutionStatus::Cancelled;
            state.execution.touch();
            handle.ctx.events.publish(EventKind::ExecutionCancelled);
            handle.ctx.persist(&state)?;
        }
        tracing::info!(execution_id, "cancel requested");
        Ok(())
    }

    /// Record a gate bypass: policy-checked, ADR-referenced, audit-logged.
    pub async fn bypass_gate(
        &self,
        execution_id: &str,
        gate: &str,
        adr_ref: &str,
    ) -> Result<(), EngineError> {
        self.policy.check_bypass(gate)?;
        let executions = self.executions.lock().await;
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;
        let mut state = handle.ctx.state.lock().await;
        let (phase_id, iteration) = state
            .execution
            .current_phase
            .clone()
            .and_then(|pid| {
                state
                    .phases
                    .iter()
                    .find(|p| p.phase_id == pid)
                    .map(|p| (pid.clone(), p.iteration_index))
            })
            .unwrap_or_default();
        self.audit
            .append(
                execution_id,
                AuditAction::GateBypass {
                    gate: gate.to_string(),
                    adr_ref: adr_ref.to_string(),
                    phase_id,
                    iteration,
                },
            )
            .map_err(EngineError::Other)?;
        state.bypassed_gates.insert(gate.to_string());
        handle.ctx.events.publish(EventKind::BypassRecorded {
            gate: gate.to_string(),
            adr_ref: adr_ref.to_string(),
        });
        state.execution.touch();
        handle.ctx.persist(&state)?;
        Ok(())
    }

    /// Force a phase back to rework with an iteration bump. Rejected on a
    /// completed phase without `force_reopen`; audit-logged either way it
    /// proceeds. The execution must not be actively running.
    pub async fn trigger_rework(
        &self,
        execution_id: &str,
        phase_id: &str,
        force_reopen: bool,
    ) -> Result<(), EngineError> {
        let executions = self.executions.lock().await;
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| EngineError::UnknownExecution {
                execution_id: execution_id.to_string(),
            })?;
        let mut state = handle.ctx.state.lock().await;

        if state.execution.status == ExecutionStatus::Running {
            return Err(EngineError::Other(anyhow::anyhow!(
                "pause execution '{execution_id}' before triggering rework"
            )));
        }
        if state.execution.status == ExecutionStatus::Cancelled {
            return Err(EngineError::Terminal {
                execution_id: execution_id.to_string(),
                status: state.execution.status.to_string(),
            });
        }

        let record = state
            .phases
            .iter()
            .find(|p| p.phase_id == phase_id)
            .ok_or_else(|| EngineError::UnknownPhase {
                execution_id: execution_id.to_string(),
                phase_id: phase_id.to_string(),
            })?;
        if record.state == PhaseState::Completed && !force_reopen {
            return Err(EngineError::ReworkRejected {
                phase_id: phase_id.to_string(),
            });
        }

        let scope = state.dag.phase_nodes(phase_id);
        let node_ids: Vec<String> = scope
            .iter()
            .map(|&i| state.dag.node(i).node_id.clone())
            .collect();
        for &i in &scope {
            state.dag.node_mut(i).reset_for_rework();
        }
        let record = state
            .phases
            .iter_mut()
            .find(|p| p.phase_id == phase_id)
            .expect("checked above");
        record.state = PhaseState::AwaitingRework;
        record.iteration_index += 1;
        let iteration = record.iteration_index;

        // Reopened executions wait for an explicit resume.
        state.execution.status = ExecutionStatus::Paused;
        state.execution.touch();
        handle.pause.send_replace(true);

        self.audit
            .append(
                execution_id,
                AuditAction::ReworkForced {
                    phase_id: phase_id.to_string(),
                    force_reopen,
                },
            )
            .map_err(EngineError::Other)?;
        handle.ctx.events.publish(EventKind::PhaseRework {
            phase_id: phase_id.to_string(),
            iteration,
            nodes: node_ids,
        });
        handle.ctx.persist(&state)?;
        tracing::info!(execution_id, phase_id, iteration, "rework forced");
        Ok(())
    }

    /// Reload every non-terminal execution from the checkpoint store and
    /// resume it. Nodes recorded as completed or reused are never
    /// re-executed; interrupted running nodes are reset to ready.
    pub async fn recover_all(&self) -> Result<Vec<String>, EngineError> {
        if self.executor.is_none() {
            return Err(EngineError::MissingExecutor);
        }

        let mut recovered = Vec::new();
        for execution_id in self.checkpoints.list()? {
            if self.executions.lock().await.contains_key(&execution_id) {
                continue;
            }
            let Some(mut snapshot) = self.checkpoints.load(&execution_id)? else {
                continue;
            };
            if snapshot.execution.status.is_terminal() {
                continue;
            }

            // An interrupted attempt does not count against the budget.
            for node in &mut snapshot.nodes {
                if node.state == NodeState::Running {
                    node.state = NodeState::Ready;
                    node.attempt_count = node.attempt_count.saturating_sub(1);
                    node.started_at = None;
                }
            }

            let mut phases = snapshot.phases.clone();
            phases.sort_by_key(|p| p.ordinal);
            let layout =
                PhaseLayout::new(phases.iter().map(|p| p.phase_id.clone()).collect());
            let dag = WorkflowDag::from_nodes(snapshot.nodes.clone(), layout)?;

            let events = self.open_event_bus(&execution_id, snapshot.event_cursor)?;
            let was_paused = snapshot.execution.status == ExecutionStatus::Paused;
            let was_cancelling = snapshot.execution.status == ExecutionStatus::Cancelling;

            let mut execution = snapshot.execution.clone();
            if !was_paused && !was_cancelling {
                execution.status = ExecutionStatus::Running;
            }

            let state = ExecState {
                execution,
                dag,
                phases,
                retry: RetryWrapper::new(
                    self.config.retry.breaker_threshold,
                    self.config.breaker_cooldown(),
                )
                .with_breakers(snapshot.breakers.clone()),
                last_failure: snapshot.last_failure.clone(),
                last_verdicts: HashMap::new(),
                bypassed_gates: snapshot.bypassed_gates.iter().cloned().collect(),
            };

            let (pause_tx, pause_rx) = watch::channel(was_paused);
            let ctx = self.make_context(state, events, pause_rx);
            let handle = ExecutionHandle {
                ctx: ctx.clone(),
                pause: pause_tx,
                driver: Arc::new(std::sync::Mutex::new(None)),
            };

            if was_cancelling {
                let mut state = ctx.state.lock().await;
                state.execution.status = ExecutionStatus::Cancelled;
                state.execution.touch();
                ctx.events.publish(EventKind::ExecutionCancelled);
                ctx.persist(&state)?;
            } else if !was_paused {
                self.spawn_driver(&handle, DriverAnnounce::Resumed, None);
            }

            self.executions
                .lock()
                .await
                .insert(execution_id.clone(), handle);
            recovered.push(execution_id.clone());
            tracing::info!(execution_id, paused = was_paused, "execution recovered");
        }
        Ok(recovered)
    }

    /// Abort all driver tasks without touching persisted state, as an
    /// abrupt process stop would. Disk state stays at the last checkpoint;
    /// `recover_all` in a fresh supervisor picks it up.
    pub async fn shutdown(&self) {
        let mut executions = self.executions.lock().await;
        for (_, handle) in executions.drain() {
            if let Some(join) = handle
                .driver
                .lock()
                .expect("driver slot poisoned")
                .take()
            {
                join.abort();
            }
        }
    }

    fn open_event_bus(&self, execution_id: &str, cursor: u64) -> Result<Arc<EventBus>, EngineError> {
        let bus = EventBus::new(execution_id, self.config.engine.event_capacity)
            .with_cursor(cursor);
        let bus = if self.config.engine.events_log {
            let dir = self.checkpoints.execution_dir(execution_id);
            std::fs::create_dir_all(&dir).map_err(|e| {
                EngineError::Storage(crate::errors::StorageError::Io {
                    path: dir.clone(),
                    source: e,
                })
            })?;
            bus.with_mirror(&self.checkpoints.events_log_path(execution_id))
                .map_err(|e| {
                    EngineError::Storage(crate::errors::StorageError::Io {
                        path: self.checkpoints.events_log_path(execution_id),
                        source: e,
                    })
                })?
        } else {
            bus
        };
        Ok(Arc::new(bus))
    }

    fn make_context(
        &self,
        state: ExecState,
        events: Arc<EventBus>,
        paused: watch::Receiver<bool>,
    ) -> ExecutionContext {
        let executor = self
            .executor
            .clone()
            .expect("checked by start/recover before constructing a context");
        let backoff = BackoffPolicy {
            base: Duration::from_millis(self.config.retry.backoff_base_ms),
            factor: self.config.retry.backoff_factor,
            max: Duration::from_millis(self.config.retry.backoff_max_ms),
            jitter: self.config.retry.backoff_jitter,
        };
        ExecutionContext {
            state: Arc::new(Mutex::new(state)),
            events,
            context: Arc::clone(&self.context),
            checkpoints: Arc::clone(&self.checkpoints),
            executor,
            cancel: CancellationToken::new(),
            paused,
            workers: Arc::new(Semaphore::new(self.config.engine.max_workers.max(1))),
            global_workers: Arc::clone(&self.global_workers),
            backoff,
            deadline: self
                .config
                .execution_deadline()
                .map(|d| tokio::time::Instant::now() + d),
        }
    }

    fn spawn_driver(
        &self,
        handle: &ExecutionHandle,
        announce: DriverAnnounce,
        reuse: Option<ReusePlan>,
    ) {
        let ctx = handle.ctx.clone();
        let controller = PhaseController::new(
            Arc::clone(&self.policy),
            self.config.engine.max_phase_iterations,
            ReworkScope::default(),
        );
        let reuse_source = self.reuse_source.clone();
        let prior = handle.driver.lock().expect("driver slot poisoned").take();
        let join = tokio::spawn(async move {
            if let Some(prior) = prior {
                prior.await.ok();
            }
            drive(ctx, controller, announce, reuse, reuse_source).await;
        });
        *handle.driver.lock().expect("driver slot poisoned") = Some(join);
    }

    fn snapshot_view(state: &ExecState) -> ExecutionSnapshot {
        let recommendations = state
            .last_failure
            .as_ref()
            .map(FailureReport::recommendations)
            .unwrap_or_default();
        ExecutionSnapshot {
            execution_id: state.execution.execution_id.clone(),
            status: state.execution.status,
            current_phase: state.execution.current_phase.clone(),
            progress_percent: state.progress_percent(),
            phases: state
                .phases
                .iter()
                .map(|p| PhaseProgress {
                    phase_id: p.phase_id.clone(),
                    state: p.state,
                    iteration_index: p.iteration_index,
                })
                .collect(),
            nodes: state
                .dag
                .nodes()
                .iter()
                .map(|n| NodeProgress {
                    node_id: n.node_id.clone(),
                    state: n.state,
                    attempt_count: n.attempt_count,
                    reused: n.state == NodeState::Reused,
                })
                .collect(),
            last_verdicts: state.last_verdicts.clone(),
            last_failure: state.last_failure.clone(),
            recommendations,
        }
    }

    fn view_from_checkpoint(snapshot: &Snapshot) -> ExecutionSnapshot {
        let total = snapshot.nodes.len();
        let done = snapshot
            .nodes
            .iter()
            .filter(|n| n.state.is_terminal_good())
            .count();
        let progress = if total == 0 {
            100.0
        } else {
            (done as f64 / total as f64) * 100.0
        };
        let recommendations = snapshot
            .last_failure
            .as_ref()
            .map(FailureReport::recommendations)
            .unwrap_or_default();
        ExecutionSnapshot {
            execution_id: snapshot.execution.execution_id.clone(),
            status: snapshot.execution.status,
            current_phase: snapshot.execution.current_phase.clone(),
            progress_percent: progress,
            phases: snapshot
                .phases
                .iter()
                .map(|p| PhaseProgress {
                    phase_id: p.phase_id.clone(),
                    state: p.state,
                    iteration_index: p.iteration_index,
                })
                .collect(),
            nodes: snapshot
                .nodes
                .iter()
                .map(|n| NodeProgress {
                    node_id: n.node_id.clone(),
                    state: n.state,
                    attempt_count: n.attempt_count,
                    reused: n.state == NodeState::Reused,
                })
                .collect(),
            last_verdicts: HashMap::new(),
            last_failure: snapshot.last_failure.clone(),
            recommendations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverAnnounce {
    Started,
    Resumed,
    Quiet,
}

/// The driver task: walk phases in ordinal order until terminal.
async fn drive(
    ctx: ExecutionContext,
    controller: PhaseController,
    announce: DriverAnnounce,
    reuse: Option<ReusePlan>,
    reuse_source: Option<Arc<dyn ReuseSource>>,
) {
    {
        let mut state = ctx.state.lock().await;
        // A prior driver may have driven the execution terminal already.
        if state.execution.status.is_terminal() {
            return;
        }
        state.execution.status = ExecutionStatus::Running;
        state.execution.touch();
        match announce {
            DriverAnnounce::Started => {
                ctx.events.publish(EventKind::ExecutionStarted);
            }
            DriverAnnounce::Resumed => {
                ctx.events.publish(EventKind::ExecutionResumed);
            }
            DriverAnnounce::Quiet => {}
        }
        if ctx.persist(&state).is_err() {
            tracing::error!("failed to persist initial driver state");
        }
    }

    // Persona-level reuse happens once, before any scheduling.
    if let Some(plan) = reuse
        && !plan.decisions.is_empty()
    {
        let applied = match reuse_source {
            Some(source) => ReuseCoordinator::apply(&ctx, &plan, source.as_ref()).await,
            None => {
                for (persona_id, _) in plan.reuse_targets() {
                    ctx.events.publish(EventKind::ReuseDowngraded {
                        persona_id: persona_id.to_string(),
                        reason: "no reuse source configured".into(),
                    });
                }
                Ok(())
            }
        };
        if let Err(e) = applied {
            fail_execution(&ctx, &format!("reuse materialisation failed: {e}")).await;
            return;
        }
    }

    let phase_ids: Vec<String> = {
        let state = ctx.state.lock().await;
        let mut phases = state.phases.clone();
        phases.sort_by_key(|p| p.ordinal);
        phases.into_iter().map(|p| p.phase_id).collect()
    };

    let mut index = 0;
    while index < phase_ids.len() {
        if ctx.cancel.is_cancelled() {
            finish_cancelled(&ctx).await;
            return;
        }
        if *ctx.paused.borrow() {
            finish_paused(&ctx).await;
            return;
        }

        let phase_id = &phase_ids[index];
        match controller.run_phase(&ctx, phase_id).await {
            Ok(PhaseOutcome::Completed) => {
                index += 1;
            }
            Ok(PhaseOutcome::Blocked) => {
                fail_execution(&ctx, &format!("phase '{phase_id}' blocked")).await;
                return;
            }
            Ok(PhaseOutcome::Paused) => {
                // A resume racing the drain keeps the driver alive.
                if *ctx.paused.borrow() {
                    finish_paused(&ctx).await;
                    return;
                }
            }
            Ok(PhaseOutcome::Cancelled) => {
                finish_cancelled(&ctx).await;
                return;
            }
            Err(e) => {
                tracing::error!(phase_id, error = %e, "phase execution failed");
                fail_execution(&ctx, &e.to_string()).await;
                return;
            }
        }
    }

    let mut state = ctx.state.lock().await;
    state.execution.status = ExecutionStatus::Completed;
    state.execution.current_phase = None;
    state.execution.touch();
    ctx.events.publish(EventKind::ExecutionCompleted);
    if let Err(e) = ctx.persist(&state) {
        tracing::error!(error = %e, "failed to persist completed execution");
    }
    tracing::info!(
        execution_id = %state.execution.execution_id,
        "execution completed"
    );
}

async fn fail_execution(ctx: &ExecutionContext, reason: &str) {
    let mut state = ctx.state.lock().await;
    state.execution.status = ExecutionStatus::Failed;
    state.execution.touch();
    ctx.events.publish(EventKind::ExecutionFailed {
        reason: reason.to_string(),
    });
    if let Err(e) = ctx.persist(&state) {
        tracing::error!(error = %e, "failed to persist failed execution");
    }
    tracing::warn!(
        execution_id = %state.execution.execution_id,
        reason,
        "execution failed"
    );
}

async fn finish_paused(ctx: &ExecutionContext) {
    let mut state = ctx.state.lock().await;
    state.execution.status = ExecutionStatus::Paused;
    state.execution.touch();
    ctx.events.publish(EventKind::ExecutionPaused);
    if let Err(e) = ctx.persist(&state) {
        tracing::error!(error = %e, "failed to persist paused execution");
    }
}

async fn finish_cancelled(ctx: &ExecutionContext) {
    let mut state = ctx.state.lock().await;
    state.execution.status = ExecutionStatus::Cancelled;
    state.execution.touch();
    ctx.events.publish(EventKind::ExecutionCancelled);
    if let Err(e) = ctx.persist(&state) {
        tracing::error!(error = %e, "failed to persist cancelled execution");
    }
}
