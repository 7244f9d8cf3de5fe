// [[AXON]]/apps/kernel-server/src/events.rs
// Purpose: Event definitions for the execution stream.
// Architecture: Domain Event Layer
// Dependencies: Serde

use crate::models::{AgentState, RunStatus};
use serde::Serialize;
use serde_json::Value;

/// Machine-readable code attached to every error event.
pub const EXECUTION_ERROR_CODE: &str = "EXECUTION_ERROR";

/// Everything a run publishes to its `execution:<run_id>` channel.
///
/// The serialized form is a JSON object tagged with a `type` field; the
/// event bus stamps a `timestamp` at publish time so subscribers see the
/// wall-clock order the engine emitted them in.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    WorkflowStatus {
        status: RunStatus,
    },
    AgentStatus {
        agent_id: String,
        status: AgentState,
    },
    AgentOutputChunk {
        agent_id: String,
        chunk: String,
    },
    AgentCompleted {
        agent_id: String,
        /// Truncated preview; the full text lives on the AgentRun record.
        output: String,
        tokens_used: u32,
        latency_ms: u64,
    },
    Error {
        agent_id: Option<String>,
        message: String,
        code: &'static str,
    },
    /// Always the last event on a channel.
    WorkflowCompleted {
        execution_id: String,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_tokens: Option<u64>,
    },
}

impl ExecutionEvent {
    pub fn error(agent_id: Option<String>, message: String) -> Self {
        ExecutionEvent::Error {
            agent_id,
            message,
            code: EXECUTION_ERROR_CODE,
        }
    }

    pub fn into_value(self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
