//! Boundary to the external reasoning engine.
//!
//! The engine is treated as a pure function: a structured request in, a
//! structured [`Decision`] out. It may fail, time out, or return garbage;
//! all of that surfaces as a [`ReasoningFailure`].

pub mod command;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{Action, Decision, Event, HistoryEntry, WorkflowKind, WorkflowState};

pub use command::CommandReasoner;

/// Everything a worker sees when asked for a decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Event that triggered this drive
    pub event: Event,

    pub workflow_id: Uuid,
    pub kind: WorkflowKind,
    pub state: WorkflowState,

    /// Workflow history so far
    pub history: Vec<HistoryEntry>,

    /// Kind-specific retry counter
    pub retries: u32,

    /// Read-only backend data keyed by operation name
    #[serde(default)]
    pub grounding: serde_json::Map<String, serde_json::Value>,
}

/// Payload sent to the reasoning engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningRequest {
    /// Which worker is asking
    pub worker: String,

    pub context: WorkflowContext,

    /// Actions valid in the current state
    pub allowed_actions: Vec<Action>,

    /// Worker-specific hints (severity, strategies, templates)
    #[serde(default)]
    pub hints: serde_json::Value,
}

/// Reasoning call failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReasoningFailure {
    #[error("reasoning timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed reasoning output: {0}")]
    MalformedOutput(String),

    #[error("reasoning quota exceeded")]
    QuotaExceeded,
}

/// External reasoning engine
#[async_trait]
pub trait Reasoner: Send + Sync {
    /// Human-readable engine name
    fn name(&self) -> &str;

    /// Produce a decision for a request
    async fn infer(&self, request: &ReasoningRequest) -> Result<Decision, ReasoningFailure>;
}

/// Reasoning call tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Command that reads a request on stdin and prints a decision
    #[serde(default)]
    pub command: Option<String>,

    /// Per-call timeout in milliseconds (default: 10s)
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Attempts before the worker's fallback decision is used
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_timeout() -> u64 {
    10_000
}
fn default_max_attempts() -> u32 {
    3
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            command: None,
            timeout_ms: default_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Parse a decision from engine output.
///
/// Tolerates markdown code fences and prose around the JSON object.
pub fn parse_decision(text: &str) -> Result<Decision, ReasoningFailure> {
    let start = text.find('{');
    let end = text.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        _ => {
            return Err(ReasoningFailure::MalformedOutput(
                "no JSON object in output".to_string(),
            ))
        }
    };

    let decision: Decision = serde_json::from_str(json)
        .map_err(|e| ReasoningFailure::MalformedOutput(e.to_string()))?;
    decision.check().map_err(ReasoningFailure::MalformedOutput)?;
    Ok(decision)
}
