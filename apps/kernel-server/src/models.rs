// [[AXON]]/apps/kernel-server/src/models.rs
// Purpose: Core data models. Run/agent records, canvas views, API schemas.
// Architecture: Shared Data Layer
// Dependencies: Serde, Chrono, Uuid

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Node type string that marks a canvas node as an executable agent.
/// Every other node type (input nodes, annotations) is skipped but still
/// participates in output routing.
pub const AGENT_NODE_TYPE: &str = "agent";

// === CANVAS VIEW ===
// The canvas blob is stored opaque (whatever the frontend saved); these
// types are the engine's read-only view of the fields it understands.
// Unknown node data fields ride along in `extra` and never drive behavior.

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CanvasData {
    #[serde(default)]
    pub nodes: Vec<CanvasNode>,
    #[serde(default)]
    pub edges: Vec<CanvasEdge>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasNode {
    pub id: String,
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub data: NodeData,
}

/// Per-node agent configuration as drawn on the canvas.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(rename = "maxTokens", default)]
    pub max_tokens: Option<u32>,
    #[serde(rename = "systemPrompt", default)]
    pub system_prompt: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasEdge {
    pub source: String,
    pub target: String,
}

// === WORKFLOW DEFINITION ===

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Full canvas state as saved by the frontend. Opaque to everything
    /// except the engine's CanvasData view.
    #[serde(default)]
    pub canvas_data: Value,
    #[serde(default)]
    pub is_template: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(name: String, description: String, canvas_data: Value, is_template: bool) -> Self {
        let now = Utc::now();
        WorkflowDefinition {
            id: Uuid::new_v4().to_string(),
            name,
            description,
            canvas_data,
            is_template,
            created_at: now,
            updated_at: now,
        }
    }
}

// === RUN RECORDS ===

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    /// Reserved for a future parallel scheduler; the serial loop goes
    /// straight from Idle to Running.
    Waiting,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// One execution of a workflow. Created in Pending when the run is
/// requested, then driven through the state machine by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub trigger_input: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(workflow_id: &str, trigger_input: Value) -> Self {
        let now = Utc::now();
        WorkflowRun {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            status: RunStatus::Pending,
            trigger_input,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Execution record for a single canvas node within a run. One per node,
/// created in bulk at Idle before the first agent starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: String,
    pub workflow_run_id: String,
    pub node_id: String,
    pub status: AgentState,
    pub input_data: Value,
    pub output_data: Value,
    pub tokens_used: u32,
    pub latency_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AgentRun {
    pub fn new(workflow_run_id: &str, node_id: &str) -> Self {
        AgentRun {
            id: Uuid::new_v4().to_string(),
            workflow_run_id: workflow_run_id.to_string(),
            node_id: node_id.to_string(),
            status: AgentState::Idle,
            input_data: Value::Null,
            output_data: Value::Null,
            tokens_used: 0,
            latency_ms: 0,
            started_at: None,
            completed_at: None,
        }
    }
}

// === API SCHEMAS ===

#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub canvas_data: Value,
    #[serde(default)]
    pub is_template: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    /// Initial input, e.g. {"input": "Write about quantum computing"}.
    #[serde(default)]
    pub trigger_input: serde_json::Map<String, Value>,
    /// Caller-supplied provider keys, e.g. {"openai": "sk-..."}.
    /// Environment keys fill in any provider missing here.
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}
