//! Trajectory event types for observable pipeline execution.
//!
//! Every stage of a request (generation, claim graph, signals, scoring,
//! decision, re-entry) emits a `TrajectoryEvent`. Events can be streamed to
//! live subscribers, collected for tests, or exported as JSON lines for
//! replay alongside the audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

/// Types of trajectory events emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrajectoryEventType {
    /// Request accepted
    PipelineStart,
    /// Dynamic-K selection made
    SelectK,
    /// Candidates returned by the generator
    CandidatesGenerated,
    /// A candidate timed out or failed and was dropped
    CandidateDropped,
    /// Atomic claim extracted
    ClaimExtracted,
    /// Claim graph and consistent subgraph computed
    GraphBuilt,
    /// Monitor signals computed
    SignalsComputed,
    /// Evaluator scores computed
    Scored,
    /// Controller produced a decision
    Decided,
    /// Verify/revise loop re-entered the pipeline
    ReEnter,
    /// Terminal emit or abstain
    Final,
    /// Calibration outcome applied
    CalibrationApplied,
    /// Calibration outcome rejected
    CalibrationSkipped,
    /// Audit record could not be persisted
    AuditDegraded,
    /// Error occurred
    Error,
}

impl std::fmt::Display for TrajectoryEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PipelineStart => "PIPELINE_START",
            Self::SelectK => "SELECT_K",
            Self::CandidatesGenerated => "CANDIDATES_GENERATED",
            Self::CandidateDropped => "CANDIDATE_DROPPED",
            Self::ClaimExtracted => "CLAIM_EXTRACTED",
            Self::GraphBuilt => "GRAPH_BUILT",
            Self::SignalsComputed => "SIGNALS_COMPUTED",
            Self::Scored => "SCORED",
            Self::Decided => "DECIDED",
            Self::ReEnter => "RE_ENTER",
            Self::Final => "FINAL",
            Self::CalibrationApplied => "CALIBRATION_APPLIED",
            Self::CalibrationSkipped => "CALIBRATION_SKIPPED",
            Self::AuditDegraded => "AUDIT_DEGRADED",
            Self::Error => "ERROR",
        };
        write!(f, "{}", s)
    }
}

/// A trajectory event emitted during pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEvent {
    /// Type of the event
    pub event_type: TrajectoryEventType,
    /// Verify/revise loop iteration (0 = first pass)
    pub depth: u32,
    /// Human-readable content describing the event
    pub content: String,
    /// Event-specific metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    /// When the event occurred
    pub timestamp: DateTime<Utc>,
}

impl TrajectoryEvent {
    /// Create a new trajectory event.
    pub fn new(event_type: TrajectoryEventType, depth: u32, content: impl Into<String>) -> Self {
        Self {
            event_type,
            depth,
            content: content.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.as_ref()?.get(key)
    }

    /// Create a pipeline start event.
    pub fn pipeline_start(qid: impl Into<String>) -> Self {
        Self::new(TrajectoryEventType::PipelineStart, 0, qid)
    }

    /// Create a candidate dropped event.
    pub fn candidate_dropped(depth: u32, index: usize, reason: impl Into<String>) -> Self {
        Self::new(TrajectoryEventType::CandidateDropped, depth, reason)
            .with_metadata("candidate_index", index)
    }

    /// Create a decision event.
    pub fn decided(depth: u32, action: impl Into<String>, rationale: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(TrajectoryEventType::Decided, depth, rationale).with_metadata("action", action)
    }

    /// Create a final event.
    pub fn final_action(depth: u32, action: impl Into<String>) -> Self {
        Self::new(TrajectoryEventType::Final, depth, action)
    }

    /// Create an error event.
    pub fn error(depth: u32, error: impl Into<String>) -> Self {
        Self::new(TrajectoryEventType::Error, depth, error)
    }

    /// Check if this is an error event.
    pub fn is_error(&self) -> bool {
        self.event_type == TrajectoryEventType::Error
    }

    /// Check if this is a final event.
    pub fn is_final(&self) -> bool {
        self.event_type == TrajectoryEventType::Final
    }

    /// Format as a single-line log entry.
    pub fn as_log_line(&self) -> String {
        let indent = "  ".repeat(self.depth as usize);
        format!(
            "[{}] {}{}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            indent,
            self.event_type,
            self.content.lines().next().unwrap_or("")
        )
    }
}

/// Export format for trajectory data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// JSON Lines format (one event per line)
    JsonLines,
    /// Compact JSON array
    JsonCompact,
    /// One `as_log_line` per event
    Text,
}

/// Serialize a list of events to the specified format.
pub fn export_events(events: &[TrajectoryEvent], format: ExportFormat) -> String {
    match format {
        ExportFormat::JsonLines => events
            .iter()
            .filter_map(|e| serde_json::to_string(e).ok())
            .collect::<Vec<_>>()
            .join("\n"),
        ExportFormat::JsonCompact => {
            serde_json::to_string(events).unwrap_or_else(|_| "[]".to_string())
        }
        ExportFormat::Text => events
            .iter()
            .map(TrajectoryEvent::as_log_line)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Verbosity level for trajectory output.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Only errors and final results
    Minimal,
    /// Normal operation events
    #[default]
    Normal,
    /// Full per-claim detail
    Debug,
}

impl TrajectoryEventType {
    /// Get minimum verbosity level for this event type.
    pub fn min_verbosity(&self) -> Verbosity {
        match self {
            Self::Error | Self::Final | Self::AuditDegraded | Self::CalibrationSkipped => {
                Verbosity::Minimal
            }
            Self::ClaimExtracted => Verbosity::Debug,
            _ => Verbosity::Normal,
        }
    }

    /// Check if event should be emitted at given verbosity.
    pub fn should_emit(&self, verbosity: Verbosity) -> bool {
        self.min_verbosity() <= verbosity
    }
}

/// Trait for trajectory event emitters.
pub trait TrajectoryEmitter: Send + Sync {
    /// Emit a trajectory event.
    fn emit(&self, event: TrajectoryEvent);

    /// Get current verbosity level.
    fn verbosity(&self) -> Verbosity;
}

/// Broadcast-based trajectory emitter.
pub struct BroadcastEmitter {
    sender: broadcast::Sender<TrajectoryEvent>,
    verbosity: Verbosity,
}

impl BroadcastEmitter {
    /// Create new broadcast emitter with channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            verbosity: Verbosity::default(),
        }
    }

    /// Set the verbosity level.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Subscribe to trajectory events.
    pub fn subscribe(&self) -> broadcast::Receiver<TrajectoryEvent> {
        self.sender.subscribe()
    }

    /// Get number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl TrajectoryEmitter for BroadcastEmitter {
    fn emit(&self, event: TrajectoryEvent) {
        if event.event_type.should_emit(self.verbosity) {
            // No subscribers is not an error.
            let _ = self.sender.send(event);
        }
    }

    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }
}

/// Collecting emitter that stores events in a Vec.
#[derive(Debug, Default, Clone)]
pub struct CollectingEmitter {
    events: Arc<RwLock<Vec<TrajectoryEvent>>>,
    verbosity: Verbosity,
}

impl CollectingEmitter {
    /// Create new collecting emitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect everything, including per-claim events.
    pub fn verbose() -> Self {
        Self {
            events: Arc::default(),
            verbosity: Verbosity::Debug,
        }
    }

    /// Get collected events.
    pub fn events(&self) -> Vec<TrajectoryEvent> {
        self.events
            .read()
            .map(|events| events.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Events of one type.
    pub fn events_of(&self, event_type: TrajectoryEventType) -> Vec<TrajectoryEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl TrajectoryEmitter for CollectingEmitter {
    fn emit(&self, event: TrajectoryEvent) {
        if event.event_type.should_emit(self.verbosity) {
            match self.events.write() {
                Ok(mut events) => events.push(event),
                Err(poisoned) => poisoned.into_inner().push(event),
            }
        }
    }

    fn verbosity(&self) -> Verbosity {
        self.verbosity
    }
}

/// Null emitter that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEmitter;

impl TrajectoryEmitter for NullEmitter {
    fn emit(&self, _event: TrajectoryEvent) {}

    fn verbosity(&self) -> Verbosity {
        Verbosity::Minimal
    }
}
