//! The executor callback contract and the retry wrapper around it.
//!
//! Personas are data; the single seam to the agent backend is the `Executor`
//! trait. The kernel passes everything in (node descriptor, resolved inputs,
//! deadline, cancellation token) and takes everything back out (artifacts,
//! metrics). Executors never reach into the context store directly, and the
//! kernel never substitutes a mock: a missing executor refuses to start.

use crate::breaker::{Admission, CircuitBreaker, FailureCategory, FailureReport};
use crate::context::ArtifactMeta;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A metric reported by an executor. Gates compare numeric metrics against
/// thresholds; text metrics are carried for reporting only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Number(f64),
    Text(String),
}

impl MetricValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

/// Where an output artifact's bytes come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadSource {
    /// Inline content produced directly by the executor
    Inline { content: String },
    /// A file the executor wrote; the kernel ingests and hashes it
    File { path: PathBuf },
}

/// One output artifact as returned by the executor callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPayload {
    pub name: String,
    #[serde(flatten)]
    pub source: PayloadSource,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_version: Option<String>,
}

impl ArtifactPayload {
    pub fn inline(name: &str, content: &str) -> Self {
        Self {
            name: name.to_string(),
            source: PayloadSource::Inline {
                content: content.to_string(),
            },
            labels: Vec::new(),
            contract_version: None,
        }
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }
}

/// Everything an executor needs for one node attempt.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub execution_id: String,
    pub node_id: String,
    pub persona_id: String,
    pub phase_id: String,
    pub executor_selector: String,
    pub requirement: String,
    /// Phase rework iteration this attempt belongs to
    pub iteration: u32,
    pub attempt: u32,
    /// Inputs resolved from the context store
    pub inputs: Vec<ArtifactMeta>,
    /// Hard bound for this attempt; the kernel also enforces it
    pub timeout: Duration,
    /// Cooperative cancellation; fired on timeout, pause-drain or cancel
    pub cancel: CancellationToken,
}

impl ExecuteRequest {
    /// Serialisable view handed to out-of-process executors.
    pub fn wire(&self) -> RequestWire<'_> {
        RequestWire {
            execution_id: &self.execution_id,
            node_id: &self.node_id,
            persona_id: &self.persona_id,
            phase_id: &self.phase_id,
            executor_selector: &self.executor_selector,
            requirement: &self.requirement,
            iteration: self.iteration,
            attempt: self.attempt,
            timeout_secs: self.timeout.as_secs(),
            inputs: &self.inputs,
        }
    }
}

/// Wire form of an `ExecuteRequest` (no cancellation token).
#[derive(Debug, Serialize)]
pub struct RequestWire<'a> {
    pub execution_id: &'a str,
    pub node_id: &'a str,
    pub persona_id: &'a str,
    pub phase_id: &'a str,
    pub executor_selector: &'a str,
    pub requirement: &'a str,
    pub iteration: u32,
    pub attempt: u32,
    pub timeout_secs: u64,
    pub inputs: &'a [ArtifactMeta],
}

/// Successful executor result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecuteOutput {
    #[serde(default)]
    pub artifacts: Vec<ArtifactPayload>,
    #[serde(default)]
    pub metrics: HashMap<String, MetricValue>,
}

/// Executor-side failure, classified for the retry loop.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{category}: {message}")]
pub struct ExecutorFailure {
    pub category: FailureCategory,
    pub message: String,
    pub recoverable: bool,
}

impl ExecutorFailure {
    pub fn error(message: &str) -> Self {
        Self {
            category: FailureCategory::ExecutorError,
            message: message.to_string(),
            recoverable: true,
        }
    }

    pub fn timeout(message: &str) -> Self {
        Self {
            category: FailureCategory::Timeout,
            message: message.to_string(),
            recoverable: true,
        }
    }

    pub fn unrecoverable(category: FailureCategory, message: &str) -> Self {
        Self {
            category,
            message: message.to_string(),
            recoverable: false,
        }
    }
}

/// The executor callback. Implementations run one persona attempt and return
/// all outputs; they must respect the cancellation token and stay within the
/// deadline.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutput, ExecutorFailure>;
}

/// Exponential backoff with jitter, bounded by a maximum delay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Fraction of the delay randomised away (0.0..=1.0)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), jittered.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let raw = self.base.as_secs_f64() * exp;
        let capped = raw.min(self.max.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let spread = if jitter > 0.0 {
            let low = 1.0 - jitter;
            rand::thread_rng().gen_range(low..=1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * spread)
    }
}

/// Breaker transition worth announcing on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerSignal {
    Opened,
    HalfOpen,
    Closed,
}

/// Wraps executor invocations outside the node-level retry loop: consults
/// the per-persona breaker before dispatch, classifies failures into
/// `FailureReport`s, and keeps breaker state current for persistence.
#[derive(Debug, Clone)]
pub struct RetryWrapper {
    threshold: u32,
    cooldown: Duration,
    breakers: HashMap<String, CircuitBreaker>,
}

impl RetryWrapper {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            breakers: HashMap::new(),
        }
    }

    /// Restore breaker state from a checkpoint snapshot.
    pub fn with_breakers(mut self, breakers: Vec<CircuitBreaker>) -> Self {
        for b in breakers {
            self.breakers.insert(b.persona_id.clone(), b);
        }
        self
    }

    /// Admission decision for a persona dispatch. Promotes expired open
    /// breakers to half-open and reserves the probe slot.
    pub fn admit(&mut self, persona_id: &str) -> (Admission, Option<BreakerSignal>) {
        let breaker = self
            .breakers
            .entry(persona_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(persona_id, self.threshold, self.cooldown));
        let before = breaker.position;
        let admission = breaker.admit(Utc::now());
        let signal = (breaker.position != before
            && breaker.position == crate::breaker::BreakerPosition::HalfOpen)
            .then_some(BreakerSignal::HalfOpen);
        (admission, signal)
    }

    /// Record a successful attempt.
    pub fn on_success(&mut self, persona_id: &str) -> Option<BreakerSignal> {
        self.breakers
            .get_mut(persona_id)
            .and_then(|b| b.record_success().then_some(BreakerSignal::Closed))
    }

    /// Record a blocking failure.
    pub fn on_failure(&mut self, persona_id: &str) -> Option<BreakerSignal> {
        let breaker = self
            .breakers
            .entry(persona_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(persona_id, self.threshold, self.cooldown));
        breaker
            .record_failure(Utc::now())
            .then_some(BreakerSignal::Opened)
    }

    /// Classify an executor failure into a structured report.
    pub fn classify(
        &self,
        node_id: &str,
        persona_id: &str,
        failure: &ExecutorFailure,
        attempt: u32,
        artifact_paths: Vec<String>,
    ) -> FailureReport {
        FailureReport {
            failed_node: node_id.to_string(),
            persona_id: persona_id.to_string(),
            category: failure.category,
            recoverable: failure.recoverable,
            attempt,
            artifact_paths,
            message: failure.message.clone(),
            created_at: Utc::now(),
        }
    }

    /// Current breaker records for the checkpoint.
    pub fn snapshot(&self) -> Vec<CircuitBreaker> {
        let mut out: Vec<CircuitBreaker> = self.breakers.values().cloned().collect();
        out.sort_by(|a, b| a.persona_id.cmp(&b.persona_id));
        out
    }
}

/// Runs personas by spawning a configured command per executor selector,
/// passing the request as JSON on stdin and reading an `ExecuteOutput` JSON
/// document from stdout.
pub struct CommandExecutor {
    /// executor selector -> program and arguments
    commands: HashMap<String, Vec<String>>,
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(commands: HashMap<String, Vec<String>>) -> Self {
        Self {
            commands,
            workdir: None,
        }
    }

    pub fn with_workdir(mut self, dir: PathBuf) -> Self {
        self.workdir = Some(dir);
        self
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteOutput, ExecutorFailure> {
        let argv = self.commands.get(&request.executor_selector).ok_or_else(|| {
            ExecutorFailure::unrecoverable(
                FailureCategory::ExecutorError,
                &format!("no command configured for selector '{}'", request.executor_selector),
            )
        })?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| {
                ExecutorFailure::unrecoverable(
                    FailureCategory::ExecutorError,
                    &format!("empty command for selector '{}'", request.executor_selector),
                )
            })?;

        let payload = serde_json::to_vec(&request.wire())
            .map_err(|e| ExecutorFailure::error(&format!("failed to encode request: {e}")))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ExecutorFailure::error(&format!("failed to spawn '{program}': {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ExecutorFailure::error(&format!("failed to write request: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| ExecutorFailure::error(&format!("failed to close stdin: {e}")))?;
        }

        let cancel = request.cancel.clone();
        tokio::select! {
            output = child.wait_with_output() => {
                let output = output
                    .map_err(|e| ExecutorFailure::error(&format!("failed to collect output: {e}")))?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(ExecutorFailure::error(&format!(
                        "executor exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )));
                }
                serde_json::from_slice(&output.stdout).map_err(|e| {
                    ExecutorFailure::error(&format!("failed to parse executor output: {e}"))
                })
            }
            _ = cancel.cancelled() => {
                // Cooperative stop: the child is killed via kill_on_drop.
                Err(ExecutorFailure::error("executor cancelled"))
            }
        }
    }
}
