//! Bounded-concurrency scheduler over a workflow DAG slice.
//!
//! A single dispatcher task owns the scheduling loop; workers are spawned
//! tasks holding semaphore permits. All node state mutation happens under
//! the execution lock, and a checkpoint is persisted after every observable
//! transition. Ordering guarantee: for any edge u→v, v starts only after u
//! is terminal-good; independent nodes are unordered.

use crate::breaker::{Admission, FailureCategory};
use crate::dag::builder::NodeIndex;
use crate::dag::node::NodeState;
use crate::errors::EngineError;
use crate::events::EventKind;
use crate::runner::{BreakerSignal, ExecuteRequest, ExecutorFailure, MetricValue};
use crate::supervisor::ExecutionContext;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// How a slice run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceOutcome {
    /// Every node in the slice reached a terminal state.
    AllTerminal,
    /// A cancel signal arrived; in-flight work was drained.
    Cancelled,
    /// A pause signal arrived; in-flight work was drained.
    Paused,
}

struct WorkerDone {
    index: NodeIndex,
    outcome: Result<WorkerSuccess, ExecutorFailure>,
}

struct WorkerSuccess {
    artifact_paths: Vec<String>,
    metrics: HashMap<String, MetricValue>,
}

/// Runs one DAG slice (usually a phase's nodes) to quiescence.
pub struct DagExecutor;

impl DagExecutor {
    /// Drive every node in `scope` to a terminal state, or stop early on
    /// pause/cancel. Fatal DAG invariant violations surface as errors and
    /// leave the slice undispatchable.
    pub async fn run_slice(
        ctx: &ExecutionContext,
        scope: &[NodeIndex],
    ) -> Result<SliceOutcome, EngineError> {
        let (done_tx, mut done_rx) = mpsc::channel::<WorkerDone>(scope.len().max(16));
        let mut in_flight: HashSet<NodeIndex> = HashSet::new();
        // Nodes waiting out a retry backoff or an open breaker.
        let mut deferred: HashMap<NodeIndex, Instant> = HashMap::new();
        let mut paused_rx = ctx.paused.clone();

        loop {
            let stopping = ctx.cancel.is_cancelled() || *paused_rx.borrow();

            if !stopping {
                Self::promote_ready(ctx, scope).await?;
                Self::dispatch_frontier(ctx, scope, &mut in_flight, &mut deferred, &done_tx)
                    .await?;
            }

            // Exit checks under the lock.
            {
                let state = ctx.state.lock().await;
                let all_terminal = scope
                    .iter()
                    .all(|&i| state.dag.node(i).state.is_terminal());
                if all_terminal && in_flight.is_empty() {
                    return Ok(SliceOutcome::AllTerminal);
                }
            }
            if in_flight.is_empty() {
                if ctx.cancel.is_cancelled() {
                    return Ok(SliceOutcome::Cancelled);
                }
                if *paused_rx.borrow() {
                    return Ok(SliceOutcome::Paused);
                }
            }

            // Nothing running and nothing to wait for means the frontier is
            // stuck, which the state machine should make impossible.
            if in_flight.is_empty() && deferred.is_empty() {
                let state = ctx.state.lock().await;
                let has_dispatchable = scope.iter().any(|&i| {
                    matches!(
                        state.dag.node(i).state,
                        NodeState::Pending | NodeState::Ready
                    )
                });
                if has_dispatchable {
                    // The loop will make progress next tick (e.g., a permit
                    // freed elsewhere); yield instead of spinning.
                    drop(state);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    continue;
                }
                return Err(EngineError::InternalConsistency(format!(
                    "slice stalled with no runnable nodes ({} in scope)",
                    scope.len()
                )));
            }

            let next_wake = deferred.values().min().copied();
            tokio::select! {
                maybe_done = done_rx.recv() => {
                    if let Some(done) = maybe_done {
                        in_flight.remove(&done.index);
                        Self::handle_done(ctx, scope, done, &mut deferred).await?;
                    }
                }
                _ = ctx.cancel.cancelled(), if !ctx.cancel.is_cancelled() => {}
                changed = paused_rx.changed() => { changed.ok(); }
                _ = async {
                    match next_wake {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                }, if next_wake.is_some() => {}
            }
        }
    }

    /// Promote pending nodes whose dependencies are all terminal-good.
    async fn promote_ready(ctx: &ExecutionContext, scope: &[NodeIndex]) -> Result<(), EngineError> {
        let mut promoted = Vec::new();
        {
            let mut state = ctx.state.lock().await;
            for &idx in scope {
                if state.dag.node(idx).state == NodeState::Pending
                    && state.dag.deps_terminal_good(idx)
                {
                    state.dag.node_mut(idx).transition(NodeState::Ready)?;
                    promoted.push(state.dag.node(idx).node_id.clone());
                }
            }
            if !promoted.is_empty() {
                for node_id in &promoted {
                    ctx.events.publish(EventKind::NodeReady {
                        node_id: node_id.clone(),
                    });
                }
                ctx.persist(&state)?;
            }
        }
        Ok(())
    }

    /// Dispatch as many ready nodes as permits allow, preferring lowest
    /// phase ordinal, then lowest wave, then arena order.
    async fn dispatch_frontier(
        ctx: &ExecutionContext,
        scope: &[NodeIndex],
        in_flight: &mut HashSet<NodeIndex>,
        deferred: &mut HashMap<NodeIndex, Instant>,
        done_tx: &mpsc::Sender<WorkerDone>,
    ) -> Result<(), EngineError> {
        let now = Instant::now();
        deferred.retain(|_, at| *at > now);

        loop {
            let mut state = ctx.state.lock().await;

            let mut candidates: Vec<(usize, usize, NodeIndex)> = scope
                .iter()
                .filter(|&&i| {
                    state.dag.node(i).state == NodeState::Ready
                        && !in_flight.contains(&i)
                        && !deferred.contains_key(&i)
                })
                .map(|&i| {
                    let node = state.dag.node(i);
                    let ordinal = state.dag.layout().ordinal(&node.phase_id).unwrap_or(usize::MAX);
                    (ordinal, node.wave, i)
                })
                .collect();
            candidates.sort();

            let Some(&(_, _, idx)) = candidates.iter().find(|&&(_, _, i)| {
                Self::parallelism_admits(&state, scope, in_flight, i)
            }) else {
                return Ok(());
            };

            // Permits before breaker admission, so a reserved half-open
            // probe is never stranded waiting for a worker slot.
            let Ok(global_permit) = ctx.global_workers.clone().try_acquire_owned() else {
                return Ok(());
            };
            let Ok(local_permit) = ctx.workers.clone().try_acquire_owned() else {
                return Ok(());
            };

            // Breaker admission per persona; holds defer the node.
            let persona = state.dag.node(idx).persona_id.clone();
            let (admission, signal) = state.retry.admit(&persona);
            if let Some(BreakerSignal::HalfOpen) = signal {
                ctx.events.publish(EventKind::BreakerHalfOpen {
                    persona_id: persona.clone(),
                });
            }
            if let Admission::Hold { remaining } = admission {
                deferred.insert(idx, Instant::now() + remaining);
                continue;
            }

            // Re-verify the invariant at dispatch time; a lost dependency
            // flag is fatal for the whole execution.
            if !state.dag.deps_terminal_good(idx) {
                let node_id = state.dag.node(idx).node_id.clone();
                return Err(EngineError::InternalConsistency(format!(
                    "node '{node_id}' became ready with non-terminal dependencies"
                )));
            }

            let request = Self::begin_attempt(ctx, &mut state, idx)?;
            ctx.persist(&state)?;
            drop(state);

            in_flight.insert(idx);
            let executor = Arc::clone(&ctx.executor);
            let context_store = Arc::clone(&ctx.context);
            let done_tx = done_tx.clone();
            let phase_id = request.phase_id.clone();
            let iteration = request.iteration;
            let node_id = request.node_id.clone();
            let execution_id = request.execution_id.clone();
            let timeout = request.timeout;

            tokio::task::spawn(async move {
                let _global = global_permit;
                let _local = local_permit;

                let cancel = request.cancel.clone();
                let outcome = match tokio::time::timeout(timeout, executor.execute(request)).await
                {
                    Ok(Ok(output)) => {
                        let mut paths = Vec::new();
                        let mut failure = None;
                        for payload in &output.artifacts {
                            match context_store
                                .put(&execution_id, &phase_id, iteration, &node_id, payload)
                                .await
                            {
                                Ok(meta) => paths.push(meta.canonical_path),
                                Err(e) => {
                                    failure = Some(ExecutorFailure::error(&format!(
                                        "failed to stamp artifact '{}': {e}",
                                        payload.name
                                    )));
                                    break;
                                }
                            }
                        }
                        match failure {
                            Some(f) => Err(f),
                            None => Ok(WorkerSuccess {
                                artifact_paths: paths,
                                metrics: output.metrics,
                            }),
                        }
                    }
                    Ok(Err(failure)) => Err(failure),
                    Err(_elapsed) => {
                        // Force the executor to stop; classification is timeout.
                        cancel.cancel();
                        Err(ExecutorFailure::timeout(&format!(
                            "node exceeded its {}s timeout",
                            timeout.as_secs()
                        )))
                    }
                };

                let _ = done_tx
                    .send(WorkerDone {
                        index: idx,
                        outcome,
                    })
                    .await;
            });
        }
    }

    /// Whether dispatching `idx` respects the phase's parallelism contract:
    /// a phase runs either one non-parallel node or any number of
    /// parallel-capable ones.
    fn parallelism_admits(
        state: &crate::supervisor::ExecState,
        scope: &[NodeIndex],
        in_flight: &HashSet<NodeIndex>,
        idx: NodeIndex,
    ) -> bool {
        let node = state.dag.node(idx);
        let phase_running: Vec<NodeIndex> = scope
            .iter()
            .copied()
            .filter(|i| {
                in_flight.contains(i) && state.dag.node(*i).phase_id == node.phase_id
            })
            .collect();
        if phase_running.is_empty() {
            return true;
        }
        node.parallel_capable
            && phase_running
                .iter()
                .all(|&i| state.dag.node(i).parallel_capable)
    }

    /// Mark the node running and build its execute request.
    fn begin_attempt(
        ctx: &ExecutionContext,
        state: &mut crate::supervisor::ExecState,
        idx: NodeIndex,
    ) -> Result<ExecuteRequest, EngineError> {
        let iteration = {
            let phase_id = &state.dag.node(idx).phase_id;
            state
                .phases
                .iter()
                .find(|p| p.phase_id == *phase_id)
                .map_or(0, |p| p.iteration_index)
        };

        let deps: Vec<String> = state
            .dag
            .dependencies(idx)
            .iter()
            .map(|&d| state.dag.node(d).node_id.clone())
            .collect();
        let inputs = ctx
            .context
            .produced_by(&state.execution.execution_id, &deps);

        let node = state.dag.node_mut(idx);
        node.transition(NodeState::Running)?;
        node.attempt_count += 1;
        node.started_at = Some(chrono::Utc::now());
        let attempt = node.attempt_count;

        // Node timeout composes with the execution deadline.
        let timeout = match ctx.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                node.timeout.min(remaining).max(Duration::from_millis(1))
            }
            None => node.timeout,
        };

        ctx.events.publish(EventKind::NodeStarted {
            node_id: node.node_id.clone(),
            attempt,
        });

        Ok(ExecuteRequest {
            execution_id: state.execution.execution_id.clone(),
            node_id: node.node_id.clone(),
            persona_id: node.persona_id.clone(),
            phase_id: node.phase_id.clone(),
            executor_selector: node.executor_selector.clone(),
            requirement: state.execution.requirement.clone(),
            iteration,
            attempt,
            inputs,
            timeout,
            cancel: ctx.cancel.child_token(),
        })
    }

    /// Apply a worker result: completion, retry with backoff, or terminal
    /// failure with skip propagation.
    async fn handle_done(
        ctx: &ExecutionContext,
        scope: &[NodeIndex],
        done: WorkerDone,
        deferred: &mut HashMap<NodeIndex, Instant>,
    ) -> Result<(), EngineError> {
        let mut state = ctx.state.lock().await;
        let idx = done.index;

        match done.outcome {
            Ok(success) => {
                // Validate the output contract before accepting the result.
                let missing: Vec<String> = {
                    let node = state.dag.node(idx);
                    let produced: Vec<String> = success
                        .artifact_paths
                        .iter()
                        .filter_map(|p| p.rsplit('/').next().map(String::from))
                        .collect();
                    node.output_contract
                        .missing_from(&produced)
                        .into_iter()
                        .map(String::from)
                        .collect()
                };
                if !missing.is_empty() {
                    let failure = ExecutorFailure {
                        category: FailureCategory::ContractViolation,
                        message: format!("output contract missing: {}", missing.join(", ")),
                        recoverable: true,
                    };
                    drop(state);
                    return Box::pin(Self::handle_done(
                        ctx,
                        scope,
                        WorkerDone {
                            index: idx,
                            outcome: Err(failure),
                        },
                        deferred,
                    ))
                    .await;
                }

                let persona = state.dag.node(idx).persona_id.clone();
                if let Some(BreakerSignal::Closed) = state.retry.on_success(&persona) {
                    ctx.events.publish(EventKind::BreakerClosed {
                        persona_id: persona,
                    });
                }

                let node = state.dag.node_mut(idx);
                node.metrics = success.metrics;
                node.completed_at = Some(chrono::Utc::now());
                node.error = None;
                node.transition(NodeState::Completed)?;
                ctx.events.publish(EventKind::NodeCompleted {
                    node_id: state.dag.node(idx).node_id.clone(),
                });
                state.execution.touch();
                ctx.persist(&state)?;
            }
            Err(failure) => {
                let (node_id, persona, attempt) = {
                    let node = state.dag.node(idx);
                    (node.node_id.clone(), node.persona_id.clone(), node.attempt_count)
                };

                let report = state.retry.classify(
                    &node_id,
                    &persona,
                    &failure,
                    attempt,
                    Vec::new(),
                );
                state.last_failure = Some(report);

                if let Some(BreakerSignal::Opened) = state.retry.on_failure(&persona) {
                    ctx.events.publish(EventKind::BreakerOpened {
                        persona_id: persona.clone(),
                    });
                }

                let can_retry =
                    failure.recoverable && state.dag.node(idx).attempts_left() > 0;
                if can_retry {
                    // A persona-level override shadows the engine backoff.
                    let policy = match &state.dag.node(idx).backoff {
                        Some(o) => crate::runner::BackoffPolicy {
                            base: Duration::from_millis(o.base_ms),
                            factor: o.factor,
                            max: Duration::from_millis(o.max_ms),
                            jitter: ctx.backoff.jitter,
                        },
                        None => ctx.backoff.clone(),
                    };
                    let delay = policy.delay(attempt);
                    let node = state.dag.node_mut(idx);
                    node.error = Some(failure.message.clone());
                    node.transition(NodeState::Ready)?;
                    deferred.insert(idx, Instant::now() + delay);
                    tracing::debug!(
                        node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "node attempt failed, retrying after backoff"
                    );
                } else {
                    let node = state.dag.node_mut(idx);
                    node.error = Some(failure.message.clone());
                    node.completed_at = Some(chrono::Utc::now());
                    node.transition(NodeState::Failed)?;
                    ctx.events.publish(EventKind::NodeFailed {
                        node_id: node_id.clone(),
                        error: failure.message.clone(),
                    });
                    Self::skip_dependents(ctx, &mut state, idx)?;
                }
                state.execution.touch();
                ctx.persist(&state)?;
            }
        }
        Ok(())
    }

    /// Transitively skip everything that can no longer run.
    fn skip_dependents(
        ctx: &ExecutionContext,
        state: &mut crate::supervisor::ExecState,
        failed: NodeIndex,
    ) -> Result<(), EngineError> {
        let failed_id = state.dag.node(failed).node_id.clone();
        let mut stack = vec![failed];
        let mut seen = HashSet::from([failed]);
        while let Some(idx) = stack.pop() {
            for &dep in state.dag.dependents(idx).to_vec().iter() {
                if !seen.insert(dep) {
                    continue;
                }
                let node = state.dag.node(dep);
                if matches!(node.state, NodeState::Pending | NodeState::Ready) {
                    let node_id = node.node_id.clone();
                    state.dag.node_mut(dep).transition(NodeState::Skipped)?;
                    ctx.events.publish(EventKind::NodeSkipped {
                        node_id,
                        failed_dependency: failed_id.clone(),
                    });
                    stack.push(dep);
                }
            }
        }
        Ok(())
    }
}
