// [[AXON]]/apps/kernel-server/src/store.rs
// Purpose: Run/agent-run record store with Redis checkpointing.
// Architecture: Persistence Layer
// Dependencies: dashmap, redis, serde_json

use crate::models::{AgentRun, AgentState, RunStatus, WorkflowDefinition, WorkflowRun};
use chrono::Utc;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;

const ACTIVE_RUNS_KEY: &str = "sys:active_runs";
const TERMINAL_STATE_TTL_SECS: i64 = 86_400;

/// Which agent state transitions the state machine permits.
/// Idle may also jump straight to Running; Waiting is the reserved
/// intermediate hop for a future parallel scheduler.
fn agent_transition_allowed(from: AgentState, to: AgentState) -> bool {
    matches!(
        (from, to),
        (AgentState::Idle, AgentState::Waiting)
            | (AgentState::Idle, AgentState::Running)
            | (AgentState::Idle, AgentState::Skipped)
            | (AgentState::Waiting, AgentState::Running)
            | (AgentState::Running, AgentState::Completed)
            | (AgentState::Running, AgentState::Failed)
    )
}

#[derive(Serialize)]
struct RunCheckpoint<'a> {
    run: &'a WorkflowRun,
    agent_runs: &'a [AgentRun],
}

/// Source of truth for workflow definitions and run records.
///
/// State lives in process memory; when a Redis connection is available,
/// every flush checkpoints the full run snapshot under `run:<id>:state`
/// and maintains the `sys:active_runs` index, with terminal runs expiring
/// after a day.
pub struct ExecutionStore {
    workflows: DashMap<String, WorkflowDefinition>,
    runs: DashMap<String, WorkflowRun>,
    agent_runs: DashMap<String, Vec<AgentRun>>,
    redis: Option<ConnectionManager>,
}

impl ExecutionStore {
    pub fn new(redis: Option<ConnectionManager>) -> Self {
        ExecutionStore {
            workflows: DashMap::new(),
            runs: DashMap::new(),
            agent_runs: DashMap::new(),
            redis,
        }
    }

    // === WORKFLOW DEFINITIONS ===

    pub fn insert_workflow(&self, workflow: WorkflowDefinition) {
        self.workflows.insert(workflow.id.clone(), workflow);
    }

    pub fn get_workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.get(workflow_id).map(|w| (*w).clone())
    }

    pub fn list_workflows(&self) -> Vec<WorkflowDefinition> {
        let mut all: Vec<WorkflowDefinition> =
            self.workflows.iter().map(|w| (*w).clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Delete a definition and cascade to every run it owns.
    pub fn delete_workflow(&self, workflow_id: &str) -> bool {
        if self.workflows.remove(workflow_id).is_none() {
            return false;
        }
        let owned: Vec<String> = self
            .runs
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| r.id.clone())
            .collect();
        for run_id in owned {
            self.runs.remove(&run_id);
            self.agent_runs.remove(&run_id);
        }
        true
    }

    // === RUN RECORDS ===

    pub fn create_run(&self, run: WorkflowRun) {
        self.agent_runs.insert(run.id.clone(), Vec::new());
        self.runs.insert(run.id.clone(), run);
    }

    pub fn get_run(&self, run_id: &str) -> Option<WorkflowRun> {
        self.runs.get(run_id).map(|r| (*r).clone())
    }

    pub fn run_status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.get(run_id).map(|r| r.status)
    }

    /// Apply a status transition plus any record edits. Refused (with a
    /// warning) once the run is terminal, keeping the status monotonic no
    /// matter what a late task tries to write.
    pub fn transition_run(
        &self,
        run_id: &str,
        status: RunStatus,
        edit: impl FnOnce(&mut WorkflowRun),
    ) -> bool {
        let Some(mut run) = self.runs.get_mut(run_id) else {
            return false;
        };
        if run.status.is_terminal() {
            tracing::warn!(
                "refusing transition of terminal run {} to {:?}",
                run_id,
                status
            );
            return false;
        }
        run.status = status;
        edit(&mut run);
        run.updated_at = Utc::now();
        true
    }

    // === AGENT RUN RECORDS ===

    pub fn create_agent_runs(&self, run_id: &str, records: Vec<AgentRun>) {
        self.agent_runs.insert(run_id.to_string(), records);
    }

    pub fn agent_runs(&self, run_id: &str) -> Vec<AgentRun> {
        self.agent_runs
            .get(run_id)
            .map(|a| (*a).clone())
            .unwrap_or_default()
    }

    pub fn agent_run(&self, run_id: &str, node_id: &str) -> Option<AgentRun> {
        self.agent_runs
            .get(run_id)
            .and_then(|a| a.iter().find(|r| r.node_id == node_id).cloned())
    }

    /// Transition one node's record, enforcing the agent state machine.
    pub fn transition_agent(
        &self,
        run_id: &str,
        node_id: &str,
        state: AgentState,
        edit: impl FnOnce(&mut AgentRun),
    ) -> bool {
        let Some(mut records) = self.agent_runs.get_mut(run_id) else {
            return false;
        };
        let Some(record) = records.iter_mut().find(|r| r.node_id == node_id) else {
            return false;
        };
        if !agent_transition_allowed(record.status, state) {
            tracing::warn!(
                "refusing agent transition {:?} -> {:?} for node {} in run {}",
                record.status,
                state,
                node_id,
                run_id
            );
            return false;
        }
        record.status = state;
        edit(record);
        true
    }

    /// Record the assembled input context on a node's record without a
    /// state transition (it is already Running at this point).
    pub fn record_agent_input(&self, run_id: &str, node_id: &str, input_data: serde_json::Value) {
        if let Some(mut records) = self.agent_runs.get_mut(run_id) {
            if let Some(record) = records.iter_mut().find(|r| r.node_id == node_id) {
                record.input_data = input_data;
            }
        }
    }

    // === PERSISTENCE ===

    /// Checkpoint the run snapshot to Redis and maintain the active-run
    /// index. A no-op without a Redis connection; never fails the caller.
    pub async fn flush(&self, run_id: &str) {
        let Some(redis) = &self.redis else {
            return;
        };
        let Some(run) = self.get_run(run_id) else {
            return;
        };
        let agent_runs = self.agent_runs(run_id);
        let checkpoint = RunCheckpoint {
            run: &run,
            agent_runs: &agent_runs,
        };

        let json = match serde_json::to_string(&checkpoint) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("failed to serialize checkpoint for {}: {}", run_id, e);
                return;
            }
        };

        let state_key = format!("run:{}:state", run_id);
        let mut conn = redis.clone();
        let set: redis::RedisResult<()> = conn.set(&state_key, json).await;
        if let Err(e) = set {
            tracing::error!("redis checkpoint for {} failed: {}", run_id, e);
            return;
        }

        if run.status.is_terminal() {
            let _: redis::RedisResult<()> = conn.srem(ACTIVE_RUNS_KEY, run_id).await;
            let _: redis::RedisResult<()> =
                conn.expire(&state_key, TERMINAL_STATE_TTL_SECS).await;
        } else {
            let _: redis::RedisResult<()> = conn.sadd(ACTIVE_RUNS_KEY, run_id).await;
        }
    }
}
