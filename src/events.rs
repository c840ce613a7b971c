//! Per-execution event stream.
//!
//! Events form a totally ordered, append-only log with monotonic sequence
//! numbers assigned at publish time. Fan-out to subscribers uses a broadcast
//! channel: a slow subscriber lags and loses the oldest buffered events (with
//! a reported lag count) rather than ever blocking the scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Typed event payloads emitted during an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ExecutionStarted,
    ExecutionPaused,
    ExecutionResumed,
    ExecutionCancelled,
    ExecutionCompleted,
    ExecutionFailed { reason: String },
    PhaseEntered { phase_id: String, iteration: u32 },
    PhaseExited { phase_id: String, verdict: String },
    PhaseRework {
        phase_id: String,
        iteration: u32,
        nodes: Vec<String>,
    },
    PhaseBlocked { phase_id: String, reason: String },
    NodeReady { node_id: String },
    NodeStarted { node_id: String, attempt: u32 },
    NodeCompleted { node_id: String },
    NodeFailed { node_id: String, error: String },
    NodeSkipped { node_id: String, failed_dependency: String },
    NodeReused { node_id: String, source_ref: String },
    GatePass { gate: String, subject: String },
    GateFail {
        gate: String,
        subject: String,
        threshold: f64,
        observed: Option<f64>,
    },
    BypassRecorded { gate: String, adr_ref: String },
    ReuseDowngraded { persona_id: String, reason: String },
    BreakerOpened { persona_id: String },
    BreakerHalfOpen { persona_id: String },
    BreakerClosed { persona_id: String },
}

/// One sequenced event record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Ordered event log with broadcast fan-out and an optional JSONL mirror.
pub struct EventBus {
    execution_id: String,
    next_sequence: AtomicU64,
    log: Mutex<Vec<Event>>,
    tx: broadcast::Sender<Event>,
    mirror: Option<Mutex<File>>,
}

impl EventBus {
    /// Create a bus starting at sequence 0 with the given fan-out capacity.
    pub fn new(execution_id: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            execution_id: execution_id.to_string(),
            next_sequence: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
            tx,
            mirror: None,
        }
    }

    /// Mirror every published event as one JSON line in `path`.
    pub fn with_mirror(mut self, path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.mirror = Some(Mutex::new(file));
        Ok(self)
    }

    /// Resume sequencing after the given cursor (recovery path).
    pub fn with_cursor(self, cursor: u64) -> Self {
        self.next_sequence.store(cursor, Ordering::SeqCst);
        self
    }

    /// Append an event, assign its sequence number, and fan out.
    ///
    /// Never blocks: fan-out errors (no subscribers) and mirror write
    /// failures are not scheduler failures.
    pub fn publish(&self, kind: EventKind) -> Event {
        let event = Event {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            execution_id: self.execution_id.clone(),
            timestamp: Utc::now(),
            kind,
        };

        if let Some(ref mirror) = self.mirror
            && let Ok(mut file) = mirror.lock()
            && let Ok(line) = serde_json::to_string(&event)
        {
            if let Err(e) = writeln!(file, "{line}") {
                tracing::warn!(error = %e, "failed to mirror event to events.log");
            }
        }

        self.log
            .lock()
            .expect("event log lock poisoned")
            .push(event.clone());
        // A send error just means nobody is subscribed right now.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Subscribe to the live stream. A lagging receiver drops the oldest
    /// buffered events and observes the dropped count via
    /// `broadcast::error::RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// The next sequence number to be assigned.
    pub fn cursor(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst)
    }

    /// Events at or after `cursor`, in order.
    pub fn events_since(&self, cursor: u64) -> Vec<Event> {
        self.log
            .lock()
            .expect("event log lock poisoned")
            .iter()
            .filter(|e| e.sequence >= cursor)
            .cloned()
            .collect()
    }

    /// Number of events published so far in this process.
    pub fn len(&self) -> usize {
        self.log.lock().expect("event log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let bus = EventBus::new("exec-1", 16);
        let a = bus.publish(EventKind::ExecutionStarted);
        let b = bus.publish(EventKind::NodeReady {
            node_id: "backend_developer".into(),
        });
        let c = bus.publish(EventKind::ExecutionCompleted);

        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        assert_eq!(c.sequence, 2);
        assert_eq!(bus.cursor(), 3);
    }

    #[test]
    fn test_cursor_resume() {
        let bus = EventBus::new("exec-1", 16).with_cursor(42);
        let event = bus.publish(EventKind::ExecutionResumed);
        assert_eq!(event.sequence, 42);
        assert_eq!(bus.cursor(), 43);
    }

    #[test]
    fn test_events_since_filters_by_cursor() {
        let bus = EventBus::new("exec-1", 16);
        bus.publish(EventKind::ExecutionStarted);
        bus.publish(EventKind::NodeStarted {
            node_id: "qa_engineer".into(),
            attempt: 1,
        });
        bus.publish(EventKind::NodeCompleted {
            node_id: "qa_engineer".into(),
        });

        let tail = bus.events_since(1);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence, 1);
        assert_eq!(tail[1].sequence, 2);
    }

    #[tokio::test]
    async fn test_fan_out_delivers_in_order() {
        let bus = EventBus::new("exec-1", 16);
        let mut rx = bus.subscribe();

        bus.publish(EventKind::ExecutionStarted);
        bus.publish(EventKind::ExecutionCompleted);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first.kind, EventKind::ExecutionStarted));
        assert!(matches!(second.kind, EventKind::ExecutionCompleted));
        assert!(first.sequence < second.sequence);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_with_lag_count() {
        let bus = EventBus::new("exec-1", 2);
        let mut rx = bus.subscribe();

        for i in 0..5 {
            bus.publish(EventKind::NodeReady {
                node_id: format!("node-{i}"),
            });
        }

        // Capacity 2: the three oldest events were dropped.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 3),
            other => panic!("Expected Lagged, got {other:?}"),
        }
        // The survivors are the newest two, still in order.
        let survivor = rx.recv().await.unwrap();
        assert_eq!(survivor.sequence, 3);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let bus = EventBus::new("exec-1", 16);
        let event = bus.publish(EventKind::GateFail {
            gate: "stub_rate".into(),
            subject: "backend_developer".into(),
            threshold: 0.6,
            observed: Some(0.4),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"gate_fail\""));
        assert!(json.contains("stub_rate"));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_mirror_writes_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let bus = EventBus::new("exec-1", 16).with_mirror(&path).unwrap();
        bus.publish(EventKind::ExecutionStarted);
        bus.publish(EventKind::ExecutionCompleted);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Event = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.sequence, 0);
    }
}
