// [[AXON]]/apps/kernel-server/src/engine.rs
// Purpose: Core orchestration. Runs one workflow end-to-end on a background task.
// Architecture: Domain Logic Layer
// Dependencies: tokio, serde_json, chrono, thiserror

use crate::bus::{channel_for, EventBus};
use crate::cancel::CancellationRegistry;
use crate::config::Settings;
use crate::dag::{node_dependencies, topological_sort, DagError};
use crate::events::ExecutionEvent;
use crate::models::{
    AgentRun, AgentState, CanvasData, CanvasEdge, CanvasNode, RunStatus, WorkflowRun,
    AGENT_NODE_TYPE,
};
use crate::providers::registry::ProviderRegistry;
use crate::providers::{LlmConfig, LlmMessage, ProviderError};
use crate::store::ExecutionStore;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Joins parent outputs into one child input context.
const PARENT_SEPARATOR: &str = "\n\n---\n\n";
const NO_INPUT_FALLBACK: &str = "No input provided.";

// Canvas nodes fall back to these when the frontend leaves a field blank.
const DEFAULT_PROVIDER: &str = "openai";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_TEMPERATURE: f32 = 0.7;
const DEFAULT_MAX_TOKENS: u32 = 2048;

/// agent_completed events carry at most this much output; the full text
/// is on the persisted record.
const EVENT_OUTPUT_LIMIT: usize = 500;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(String),
    #[error(transparent)]
    Graph(#[from] DagError),
    #[error("{message}")]
    Execution {
        message: String,
        agent_id: Option<String>,
    },
}

impl EngineError {
    fn execution(message: impl Into<String>) -> Self {
        EngineError::Execution {
            message: message.into(),
            agent_id: None,
        }
    }

    fn agent_id(&self) -> Option<String> {
        match self {
            EngineError::Execution { agent_id, .. } => agent_id.clone(),
            _ => None,
        }
    }
}

/// Caller-supplied keys win; environment keys only fill providers the
/// caller left out.
pub fn merge_api_keys(
    caller: HashMap<String, String>,
    env: HashMap<String, String>,
) -> HashMap<String, String> {
    let mut merged = caller;
    for (provider, key) in env {
        merged.entry(provider).or_insert(key);
    }
    merged
}

/// Char-boundary-safe truncation for event payloads.
fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

/// Binds the store, bus, provider registry, and cancellation registry
/// into the run loop. One engine serves the whole process; each run gets
/// its own background task.
pub struct ExecutionEngine {
    pub store: Arc<ExecutionStore>,
    pub bus: Arc<dyn EventBus>,
    pub cancellations: Arc<CancellationRegistry>,
    providers: ProviderRegistry,
    settings: Settings,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<ExecutionStore>,
        bus: Arc<dyn EventBus>,
        providers: ProviderRegistry,
        cancellations: Arc<CancellationRegistry>,
        settings: Settings,
    ) -> Self {
        ExecutionEngine {
            store,
            bus,
            cancellations,
            providers,
            settings,
        }
    }

    /// Entry point for the API layer: persist a Pending run, kick off the
    /// background task, return the record immediately so the caller can
    /// attach to the stream.
    pub async fn start_run(
        self: &Arc<Self>,
        workflow_id: &str,
        trigger_input: Value,
        api_keys: HashMap<String, String>,
    ) -> Result<WorkflowRun, EngineError> {
        if self.store.get_workflow(workflow_id).is_none() {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()));
        }

        let api_keys = merge_api_keys(api_keys, self.settings.env_api_keys());
        let run = self.create_run(workflow_id, trigger_input);
        self.store.flush(&run.id).await;
        self.spawn_run(&run.id, api_keys);
        Ok(run)
    }

    /// Create the Pending record without executing. Split from spawn_run
    /// so callers can subscribe to the channel before the first event.
    pub fn create_run(&self, workflow_id: &str, trigger_input: Value) -> WorkflowRun {
        let run = WorkflowRun::new(workflow_id, trigger_input);
        self.store.create_run(run.clone());
        run
    }

    /// Fire-and-forget the execution task. The task owns the run from
    /// here on and outlives whatever request started it.
    pub fn spawn_run(self: &Arc<Self>, run_id: &str, api_keys: HashMap<String, String>) {
        let engine = Arc::clone(self);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            engine.execute(run_id, api_keys).await;
        });
    }

    async fn execute(&self, run_id: String, api_keys: HashMap<String, String>) {
        tracing::info!("starting workflow execution for run {}", run_id);
        let channel = channel_for(&run_id);

        if let Err(error) = self.drive(&run_id, &channel, &api_keys).await {
            self.store.transition_run(&run_id, RunStatus::Failed, |r| {
                r.error = Some(error.to_string());
                r.completed_at = Some(Utc::now());
            });
            self.store.flush(&run_id).await;

            self.bus
                .publish(
                    &channel,
                    ExecutionEvent::error(error.agent_id(), error.to_string()).into_value(),
                )
                .await;
            self.bus
                .publish(
                    &channel,
                    ExecutionEvent::WorkflowCompleted {
                        execution_id: run_id.clone(),
                        status: RunStatus::Failed,
                        total_tokens: None,
                    }
                    .into_value(),
                )
                .await;

            tracing::error!("workflow run {} failed: {}", run_id, error);
        }

        self.cancellations.clear(&run_id);
        self.store.flush(&run_id).await;
    }

    /// The happy-path loop; any Err unwinds into the failure arm of
    /// execute(). Cancellation is not an error: it finalizes in here.
    async fn drive(
        &self,
        run_id: &str,
        channel: &str,
        api_keys: &HashMap<String, String>,
    ) -> Result<(), EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .ok_or_else(|| EngineError::execution(format!("run '{}' not found", run_id)))?;

        self.store.transition_run(run_id, RunStatus::Running, |r| {
            r.started_at = Some(Utc::now());
        });
        self.store.flush(run_id).await;
        self.bus
            .publish(
                channel,
                ExecutionEvent::WorkflowStatus {
                    status: RunStatus::Running,
                }
                .into_value(),
            )
            .await;

        let workflow = self.store.get_workflow(&run.workflow_id).ok_or_else(|| {
            EngineError::execution(format!("workflow '{}' no longer exists", run.workflow_id))
        })?;
        let canvas: CanvasData =
            serde_json::from_value(workflow.canvas_data.clone()).unwrap_or_default();

        if canvas.nodes.is_empty() {
            return Err(EngineError::execution("workflow has no nodes to execute"));
        }

        let order = topological_sort(&canvas.nodes, &canvas.edges)?;
        let node_map: HashMap<&str, &CanvasNode> =
            canvas.nodes.iter().map(|n| (n.id.as_str(), n)).collect();

        let records: Vec<AgentRun> = order
            .iter()
            .map(|node_id| AgentRun::new(run_id, node_id))
            .collect();
        self.store.create_agent_runs(run_id, records);
        self.store.flush(run_id).await;

        // Non-agent (input) nodes pass this straight through as their
        // "output".
        let trigger_text = run
            .trigger_input
            .get("input")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut total_tokens: u64 = 0;
        let mut cancelled = false;

        for node_id in &order {
            if self.cancellations.is_requested(run_id) {
                self.store
                    .transition_run(run_id, RunStatus::Cancelled, |_| {});
                self.store.flush(run_id).await;
                self.bus
                    .publish(
                        channel,
                        ExecutionEvent::WorkflowCompleted {
                            execution_id: run_id.to_string(),
                            status: RunStatus::Cancelled,
                            total_tokens: None,
                        }
                        .into_value(),
                    )
                    .await;
                tracing::info!("workflow run {} cancelled", run_id);
                cancelled = true;
                break;
            }

            let node = node_map[node_id.as_str()];

            if node.node_type != AGENT_NODE_TYPE {
                self.store
                    .transition_agent(run_id, node_id, AgentState::Skipped, |_| {});
                outputs.insert(node_id.clone(), trigger_text.clone());
                self.bus
                    .publish(
                        channel,
                        ExecutionEvent::AgentStatus {
                            agent_id: node_id.clone(),
                            status: AgentState::Skipped,
                        }
                        .into_value(),
                    )
                    .await;
                continue;
            }

            let tokens = self
                .run_agent(run_id, channel, node, &canvas.edges, &mut outputs, api_keys)
                .await?;
            total_tokens += u64::from(tokens);
        }

        if !cancelled {
            self.store.transition_run(run_id, RunStatus::Completed, |r| {
                r.completed_at = Some(Utc::now());
            });
            self.store.flush(run_id).await;
            self.bus
                .publish(
                    channel,
                    ExecutionEvent::WorkflowCompleted {
                        execution_id: run_id.to_string(),
                        status: RunStatus::Completed,
                        total_tokens: Some(total_tokens),
                    }
                    .into_value(),
                )
                .await;
            tracing::info!(
                "workflow run {} completed, total_tokens={}",
                run_id,
                total_tokens
            );
        }

        Ok(())
    }

    /// Execute one agent node. Any failure — provider or otherwise —
    /// marks the record Failed and comes back wrapped with the node ID,
    /// which fails the whole run (there are no retries).
    async fn run_agent(
        &self,
        run_id: &str,
        channel: &str,
        node: &CanvasNode,
        edges: &[CanvasEdge],
        outputs: &mut HashMap<String, String>,
        api_keys: &HashMap<String, String>,
    ) -> Result<u32, EngineError> {
        self.store
            .transition_agent(run_id, &node.id, AgentState::Running, |a| {
                a.started_at = Some(Utc::now());
            });
        self.store.flush(run_id).await;
        self.bus
            .publish(
                channel,
                ExecutionEvent::AgentStatus {
                    agent_id: node.id.clone(),
                    status: AgentState::Running,
                }
                .into_value(),
            )
            .await;

        match self
            .invoke_agent(run_id, channel, node, edges, outputs, api_keys)
            .await
        {
            Ok(tokens) => Ok(tokens),
            Err(error) => {
                self.store
                    .transition_agent(run_id, &node.id, AgentState::Failed, |a| {
                        a.completed_at = Some(Utc::now());
                    });
                self.store.flush(run_id).await;
                self.bus
                    .publish(
                        channel,
                        ExecutionEvent::AgentStatus {
                            agent_id: node.id.clone(),
                            status: AgentState::Failed,
                        }
                        .into_value(),
                    )
                    .await;
                Err(EngineError::Execution {
                    message: error.to_string(),
                    agent_id: Some(node.id.clone()),
                })
            }
        }
    }

    async fn invoke_agent(
        &self,
        run_id: &str,
        channel: &str,
        node: &CanvasNode,
        edges: &[CanvasEdge],
        outputs: &mut HashMap<String, String>,
        api_keys: &HashMap<String, String>,
    ) -> Result<u32, ProviderError> {
        let started = Instant::now();

        // Input context: parent outputs in edge order, missing ones
        // silently omitted.
        let parent_ids = node_dependencies(&node.id, edges);
        let parent_outputs: Vec<&str> = parent_ids
            .iter()
            .filter_map(|pid| outputs.get(pid).map(String::as_str))
            .collect();
        let input_context = parent_outputs.join(PARENT_SEPARATOR);

        let provider_name = node.data.provider.as_deref().unwrap_or(DEFAULT_PROVIDER);
        let api_key = api_keys
            .get(provider_name)
            .map(String::as_str)
            .unwrap_or("");
        let provider = self.providers.get(provider_name, api_key, None)?;

        let config = LlmConfig {
            model: node
                .data
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            temperature: node.data.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: node.data.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        };

        let system_prompt = node.data.system_prompt.clone().unwrap_or_default();
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(LlmMessage::system(system_prompt.clone()));
        }
        let user_content = if input_context.is_empty() {
            NO_INPUT_FALLBACK.to_string()
        } else {
            input_context.clone()
        };
        messages.push(LlmMessage::user(user_content));

        self.store.record_agent_input(
            run_id,
            &node.id,
            json!({"context": input_context, "system_prompt": system_prompt}),
        );

        let mut rx = provider.stream(&messages, &config).await?;
        let mut full_content = String::new();
        let mut tokens_used = 0u32;
        while let Some(chunk) = rx.recv().await {
            if chunk.is_final {
                tokens_used = chunk.tokens_used;
                break;
            }
            full_content.push_str(&chunk.content);
            self.bus
                .publish(
                    channel,
                    ExecutionEvent::AgentOutputChunk {
                        agent_id: node.id.clone(),
                        chunk: chunk.content,
                    }
                    .into_value(),
                )
                .await;
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        outputs.insert(node.id.clone(), full_content.clone());

        self.store
            .transition_agent(run_id, &node.id, AgentState::Completed, |a| {
                a.output_data = json!({"content": full_content.clone()});
                a.tokens_used = tokens_used;
                a.latency_ms = latency_ms;
                a.completed_at = Some(Utc::now());
            });
        self.store.flush(run_id).await;

        self.bus
            .publish(
                channel,
                ExecutionEvent::AgentCompleted {
                    agent_id: node.id.clone(),
                    output: truncate_chars(&full_content, EVENT_OUTPUT_LIMIT),
                    tokens_used,
                    latency_ms,
                }
                .into_value(),
            )
            .await;

        tracing::info!(
            "agent {} completed in run {}, tokens={}, latency_ms={}",
            node.id,
            run_id,
            tokens_used,
            latency_ms
        );
        Ok(tokens_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, Subscription};
    use crate::models::WorkflowDefinition;
    use crate::providers::{ChunkStream, LlmChunk, LlmProvider, LlmResponse, Role};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    // === STUB PROVIDERS ===

    /// Splits output into a couple of chunks then finalizes with a token
    /// count equal to the output length in chars.
    fn scripted_stream(output: String) -> ChunkStream {
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            let tokens = output.chars().count() as u32;
            let chars: Vec<char> = output.chars().collect();
            let mid = chars.len() / 2;
            let first: String = chars[..mid].iter().collect();
            let second: String = chars[mid..].iter().collect();
            for part in [first, second] {
                if !part.is_empty() {
                    let _ = tx.send(LlmChunk::text(part)).await;
                }
            }
            let _ = tx.send(LlmChunk::last(tokens)).await;
        });
        rx
    }

    fn last_user(messages: &[LlmMessage]) -> String {
        messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }

    /// Echoes the user message with a fixed prefix.
    struct PrefixEcho {
        prefix: String,
    }

    #[async_trait]
    impl LlmProvider for PrefixEcho {
        async fn stream(
            &self,
            messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<ChunkStream, ProviderError> {
            Ok(scripted_stream(format!(
                "{}{}",
                self.prefix,
                last_user(messages)
            )))
        }

        async fn complete(
            &self,
            messages: &[LlmMessage],
            config: &LlmConfig,
        ) -> Result<LlmResponse, ProviderError> {
            let content = format!("{}{}", self.prefix, last_user(messages));
            Ok(LlmResponse {
                tokens_used: content.chars().count() as u32,
                content,
                model: config.model.clone(),
            })
        }

        fn validate_api_key(&self, _api_key: &str) -> bool {
            true
        }
    }

    /// Echoes "<system prompt>:<user message>" so each node's output is
    /// distinguishable in downstream contexts.
    struct SysEcho;

    #[async_trait]
    impl LlmProvider for SysEcho {
        async fn stream(
            &self,
            messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<ChunkStream, ProviderError> {
            let system = messages
                .iter()
                .find(|m| m.role == Role::System)
                .map(|m| m.content.clone());
            let user = last_user(messages);
            let output = match system {
                Some(system) => format!("{}:{}", system, user),
                None => user,
            };
            Ok(scripted_stream(output))
        }

        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<LlmResponse, ProviderError> {
            Err(ProviderError::api("stub", "not used"))
        }

        fn validate_api_key(&self, _api_key: &str) -> bool {
            true
        }
    }

    /// Always rejects with an auth failure.
    struct FailAuth;

    #[async_trait]
    impl LlmProvider for FailAuth {
        async fn stream(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<ChunkStream, ProviderError> {
            Err(ProviderError::auth("stub"))
        }

        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<LlmResponse, ProviderError> {
            Err(ProviderError::auth("stub"))
        }

        fn validate_api_key(&self, _api_key: &str) -> bool {
            true
        }
    }

    /// Requests cancellation of the current run while its own (first)
    /// agent is streaming, so the engine observes it before the next one.
    struct CancelDuringStream {
        registry: Arc<CancellationRegistry>,
        run_id: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl LlmProvider for CancelDuringStream {
        async fn stream(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<ChunkStream, ProviderError> {
            if let Some(run_id) = self.run_id.lock().unwrap().clone() {
                self.registry.request(&run_id);
            }
            Ok(scripted_stream("done".to_string()))
        }

        async fn complete(
            &self,
            _messages: &[LlmMessage],
            _config: &LlmConfig,
        ) -> Result<LlmResponse, ProviderError> {
            Err(ProviderError::api("stub", "not used"))
        }

        fn validate_api_key(&self, _api_key: &str) -> bool {
            true
        }
    }

    // === HARNESS ===

    struct Harness {
        engine: Arc<ExecutionEngine>,
        bus: Arc<MemoryBus>,
    }

    fn harness(providers: ProviderRegistry) -> Harness {
        let bus = Arc::new(MemoryBus::new());
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(ExecutionStore::new(None)),
            bus.clone(),
            providers,
            Arc::new(CancellationRegistry::new()),
            Settings::default(),
        ));
        Harness { engine, bus }
    }

    fn add_workflow(harness: &Harness, canvas: Value) -> WorkflowDefinition {
        let workflow = WorkflowDefinition::new("test".into(), String::new(), canvas, false);
        harness.engine.store.insert_workflow(workflow.clone());
        workflow
    }

    fn stub_keys() -> HashMap<String, String> {
        HashMap::from([("stub".to_string(), "stub-key".to_string())])
    }

    async fn collect_until_terminal(sub: &mut Subscription) -> Vec<Value> {
        let mut events = Vec::new();
        loop {
            let raw = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .expect("timed out waiting for events")
                .expect("bus closed early");
            let event: Value = serde_json::from_str(&raw).unwrap();
            let done = event["type"] == "workflow_completed";
            events.push(event);
            if done {
                break;
            }
        }
        events
    }

    async fn run_and_collect(
        harness: &Harness,
        workflow_id: &str,
        trigger: Value,
    ) -> (WorkflowRun, Vec<Value>) {
        let run = harness.engine.create_run(workflow_id, trigger);
        let mut sub = harness.bus.subscribe(&channel_for(&run.id)).await;
        harness.engine.spawn_run(&run.id, stub_keys());
        let events = collect_until_terminal(&mut sub).await;
        let run = harness.engine.store.get_run(&run.id).unwrap();
        (run, events)
    }

    fn event_types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .map(|e| e["type"].as_str().unwrap_or("?").to_string())
            .collect()
    }

    // === SCENARIOS ===

    #[tokio::test]
    async fn linear_input_to_agent_run_streams_and_completes() {
        let mut providers = ProviderRegistry::empty();
        providers.register("stub", |_key, _base| {
            Arc::new(PrefixEcho {
                prefix: "X-".into(),
            })
        });
        let harness = harness(providers);
        let workflow = add_workflow(
            &harness,
            json!({
                "nodes": [
                    {"id": "A", "type": "inputNode"},
                    {"id": "B", "type": "agent", "data": {"provider": "stub"}}
                ],
                "edges": [{"source": "A", "target": "B"}]
            }),
        );

        let (run, events) = run_and_collect(&harness, &workflow.id, json!({"input": "hi"})).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());

        // Event order: running, A skipped, B running, chunks, B done, terminal.
        let types = event_types(&events);
        assert_eq!(types.first().unwrap(), "workflow_status");
        assert_eq!(events[0]["status"], "running");
        assert_eq!(events[1]["type"], "agent_status");
        assert_eq!(events[1]["agent_id"], "A");
        assert_eq!(events[1]["status"], "skipped");
        assert_eq!(events[2]["agent_id"], "B");
        assert_eq!(events[2]["status"], "running");
        assert_eq!(types.last().unwrap(), "workflow_completed");
        assert_eq!(events.last().unwrap()["status"], "completed");
        assert_eq!(events.last().unwrap()["total_tokens"], 4);

        // Chunk reconstruction: concatenated chunks == persisted output.
        let chunks: String = events
            .iter()
            .filter(|e| e["type"] == "agent_output_chunk")
            .map(|e| e["chunk"].as_str().unwrap())
            .collect();
        assert_eq!(chunks, "X-hi");

        let agent = harness.engine.store.agent_run(&run.id, "B").unwrap();
        assert_eq!(agent.status, AgentState::Completed);
        assert_eq!(agent.output_data["content"], "X-hi");
        assert_eq!(agent.tokens_used, 4);
        assert!(agent.completed_at.unwrap() >= agent.started_at.unwrap());

        let skipped = harness.engine.store.agent_run(&run.id, "A").unwrap();
        assert_eq!(skipped.status, AgentState::Skipped);

        // Every chunk precedes agent_completed; terminal event is last.
        let completed_at = types
            .iter()
            .position(|t| t == "agent_completed")
            .expect("agent_completed missing");
        let last_chunk = types
            .iter()
            .rposition(|t| t == "agent_output_chunk")
            .expect("chunks missing");
        assert!(last_chunk < completed_at);

        // Bus stamped every event.
        assert!(events.iter().all(|e| e["timestamp"].is_string()));
    }

    #[tokio::test]
    async fn diamond_joins_parent_outputs_in_edge_order() {
        let mut providers = ProviderRegistry::empty();
        providers.register("stub", |_key, _base| Arc::new(SysEcho));
        let harness = harness(providers);
        let workflow = add_workflow(
            &harness,
            json!({
                "nodes": [
                    {"id": "A", "type": "agent", "data": {"provider": "stub", "systemPrompt": "A"}},
                    {"id": "B", "type": "agent", "data": {"provider": "stub", "systemPrompt": "B"}},
                    {"id": "C", "type": "agent", "data": {"provider": "stub", "systemPrompt": "C"}},
                    {"id": "D", "type": "agent", "data": {"provider": "stub", "systemPrompt": "D"}}
                ],
                "edges": [
                    {"source": "A", "target": "B"},
                    {"source": "A", "target": "C"},
                    {"source": "B", "target": "D"},
                    {"source": "C", "target": "D"}
                ]
            }),
        );

        let (run, _) = run_and_collect(&harness, &workflow.id, json!({})).await;
        assert_eq!(run.status, RunStatus::Completed);

        let store = &harness.engine.store;
        let a_out = store.agent_run(&run.id, "A").unwrap().output_data["content"]
            .as_str()
            .unwrap()
            .to_string();
        // A has no parents, so it saw the fallback input.
        assert_eq!(a_out, "A:No input provided.");

        let b_out = store.agent_run(&run.id, "B").unwrap().output_data["content"]
            .as_str()
            .unwrap()
            .to_string();
        let c_out = store.agent_run(&run.id, "C").unwrap().output_data["content"]
            .as_str()
            .unwrap()
            .to_string();
        assert_eq!(b_out, format!("B:{}", a_out));
        assert_eq!(c_out, format!("C:{}", a_out));

        // D's context is B then C, matching edge insertion order.
        let d = store.agent_run(&run.id, "D").unwrap();
        assert_eq!(
            d.input_data["context"].as_str().unwrap(),
            format!("{}\n\n---\n\n{}", b_out, c_out)
        );
        assert_eq!(
            d.output_data["content"].as_str().unwrap(),
            format!("D:{}\n\n---\n\n{}", b_out, c_out)
        );
    }

    #[tokio::test]
    async fn cyclic_graph_fails_with_both_nodes_named() {
        let harness = harness(ProviderRegistry::empty());
        let workflow = add_workflow(
            &harness,
            json!({
                "nodes": [
                    {"id": "A", "type": "agent"},
                    {"id": "B", "type": "agent"}
                ],
                "edges": [
                    {"source": "A", "target": "B"},
                    {"source": "B", "target": "A"}
                ]
            }),
        );

        let (run, events) = run_and_collect(&harness, &workflow.id, json!({})).await;

        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.unwrap();
        assert!(error.contains("cycle"));
        assert!(error.contains('A') && error.contains('B'));

        assert_eq!(
            event_types(&events),
            vec!["workflow_status", "error", "workflow_completed"]
        );
        assert_eq!(events[1]["code"], "EXECUTION_ERROR");
        assert!(events[1]["agent_id"].is_null());
        assert_eq!(events[2]["status"], "failed");
    }

    #[tokio::test]
    async fn provider_auth_failure_fails_agent_and_run() {
        let mut providers = ProviderRegistry::empty();
        providers.register("stub", |_key, _base| Arc::new(FailAuth));
        let harness = harness(providers);
        let workflow = add_workflow(
            &harness,
            json!({
                "nodes": [
                    {"id": "A", "type": "inputNode"},
                    {"id": "B", "type": "agent", "data": {"provider": "stub"}},
                    {"id": "C", "type": "agent", "data": {"provider": "stub"}}
                ],
                "edges": [
                    {"source": "A", "target": "B"},
                    {"source": "B", "target": "C"}
                ]
            }),
        );

        let (run, events) = run_and_collect(&harness, &workflow.id, json!({"input": "x"})).await;

        assert_eq!(run.status, RunStatus::Failed);

        let types = event_types(&events);
        assert_eq!(
            types,
            vec![
                "workflow_status",
                "agent_status", // A skipped
                "agent_status", // B running
                "agent_status", // B failed
                "error",
                "workflow_completed",
            ]
        );
        assert_eq!(events[3]["agent_id"], "B");
        assert_eq!(events[3]["status"], "failed");
        assert_eq!(events[4]["code"], "EXECUTION_ERROR");
        assert_eq!(events[4]["agent_id"], "B");
        assert!(events[4]["message"]
            .as_str()
            .unwrap()
            .contains("invalid or missing API key"));
        assert_eq!(events[5]["status"], "failed");

        let store = &harness.engine.store;
        assert_eq!(
            store.agent_run(&run.id, "B").unwrap().status,
            AgentState::Failed
        );
        // C was never reached.
        assert_eq!(
            store.agent_run(&run.id, "C").unwrap().status,
            AgentState::Idle
        );
    }

    #[tokio::test]
    async fn cancel_mid_run_keeps_finished_agents_and_leaves_rest_idle() {
        let registry = Arc::new(CancellationRegistry::new());
        let run_slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        let mut providers = ProviderRegistry::empty();
        {
            let registry = Arc::clone(&registry);
            let run_slot = Arc::clone(&run_slot);
            providers.register("stub", move |_key, _base| {
                Arc::new(CancelDuringStream {
                    registry: Arc::clone(&registry),
                    run_id: Arc::clone(&run_slot),
                })
            });
        }

        let bus = Arc::new(MemoryBus::new());
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(ExecutionStore::new(None)),
            bus.clone(),
            providers,
            Arc::clone(&registry),
            Settings::default(),
        ));
        let workflow = WorkflowDefinition::new(
            "chain".into(),
            String::new(),
            json!({
                "nodes": [
                    {"id": "A", "type": "agent", "data": {"provider": "stub"}},
                    {"id": "B", "type": "agent", "data": {"provider": "stub"}},
                    {"id": "C", "type": "agent", "data": {"provider": "stub"}}
                ],
                "edges": [
                    {"source": "A", "target": "B"},
                    {"source": "B", "target": "C"}
                ]
            }),
            false,
        );
        engine.store.insert_workflow(workflow.clone());

        let run = engine.create_run(&workflow.id, json!({}));
        *run_slot.lock().unwrap() = Some(run.id.clone());
        let mut sub = bus.subscribe(&channel_for(&run.id)).await;
        engine.spawn_run(&run.id, stub_keys());
        let events = collect_until_terminal(&mut sub).await;

        let run = engine.store.get_run(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);

        // A finished before the cancel was observed; B and C never ran.
        assert_eq!(
            engine.store.agent_run(&run.id, "A").unwrap().status,
            AgentState::Completed
        );
        assert_eq!(
            engine.store.agent_run(&run.id, "B").unwrap().status,
            AgentState::Idle
        );
        assert_eq!(
            engine.store.agent_run(&run.id, "C").unwrap().status,
            AgentState::Idle
        );

        let terminal = events.last().unwrap();
        assert_eq!(terminal["type"], "workflow_completed");
        assert_eq!(terminal["status"], "cancelled");
        let types = event_types(&events);
        assert!(types.contains(&"agent_completed".to_string()));
    }

    #[tokio::test]
    async fn cancel_before_start_cancels_with_no_agents_run() {
        let harness = harness(ProviderRegistry::empty());
        let workflow = add_workflow(
            &harness,
            json!({
                "nodes": [{"id": "A", "type": "agent"}],
                "edges": []
            }),
        );

        let run = harness.engine.create_run(&workflow.id, json!({}));
        harness.engine.cancellations.request(&run.id);
        let mut sub = harness.bus.subscribe(&channel_for(&run.id)).await;
        harness.engine.spawn_run(&run.id, stub_keys());
        let events = collect_until_terminal(&mut sub).await;

        let run = harness.engine.store.get_run(&run.id).unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(
            harness.engine.store.agent_run(&run.id, "A").unwrap().status,
            AgentState::Idle
        );
        assert_eq!(
            event_types(&events),
            vec!["workflow_status", "workflow_completed"]
        );
    }

    #[tokio::test]
    async fn empty_canvas_fails_with_no_nodes_error() {
        let harness = harness(ProviderRegistry::empty());
        let workflow = add_workflow(&harness, json!({"nodes": [], "edges": []}));

        let (run, events) = run_and_collect(&harness, &workflow.id, json!({})).await;

        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("no nodes"));
        assert_eq!(
            event_types(&events),
            vec!["workflow_status", "error", "workflow_completed"]
        );
        assert!(events[1]["message"].as_str().unwrap().contains("no nodes"));
    }

    #[tokio::test]
    async fn start_run_rejects_unknown_workflows() {
        let harness = harness(ProviderRegistry::empty());
        let result = harness
            .engine
            .start_run("missing", json!({}), HashMap::new())
            .await;
        match result {
            Err(EngineError::WorkflowNotFound(id)) => assert_eq!(id, "missing"),
            other => panic!("expected not-found, got {:?}", other.err()),
        }
    }

    // === UNIT PIECES ===

    #[test]
    fn caller_keys_beat_env_keys_per_provider() {
        let caller = HashMap::from([("openai".to_string(), "K1".to_string())]);
        let env = HashMap::from([
            ("openai".to_string(), "E1".to_string()),
            ("anthropic".to_string(), "E2".to_string()),
        ]);
        let merged = merge_api_keys(caller, env);
        assert_eq!(merged["openai"], "K1");
        assert_eq!(merged["anthropic"], "E2");
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn event_truncation_respects_char_boundaries() {
        let ascii = "a".repeat(600);
        assert_eq!(truncate_chars(&ascii, 500).len(), 500);

        let wide = "\u{1f600}".repeat(600);
        let cut = truncate_chars(&wide, 500);
        assert_eq!(cut.chars().count(), 500);

        assert_eq!(truncate_chars("short", 500), "short");
    }
}
