// [[AXON]]/apps/kernel-server/src/server/handlers.rs
// Purpose: API handlers. Run lifecycle endpoints + WebSocket streaming bridge.
// Architecture: API Layer
// Dependencies: Axum, Engine

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::bus::channel_for;
use crate::engine::{EngineError, ExecutionEngine};
use crate::models::{
    AgentRun, CreateWorkflowRequest, StartRunRequest, WorkflowDefinition, WorkflowRun,
};

type Engine = Arc<ExecutionEngine>;

#[derive(serde::Serialize)]
pub struct HealthResponse {
    status: String,
    message: String,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Axon kernel server is running".to_string(),
    })
}

// === WORKFLOW DEFINITIONS ===

pub async fn create_workflow(
    State(engine): State<Engine>,
    Json(request): Json<CreateWorkflowRequest>,
) -> (StatusCode, Json<WorkflowDefinition>) {
    let workflow = WorkflowDefinition::new(
        request.name,
        request.description,
        request.canvas_data,
        request.is_template,
    );
    engine.store.insert_workflow(workflow.clone());
    tracing::info!("workflow created: {} ({})", workflow.name, workflow.id);
    (StatusCode::CREATED, Json(workflow))
}

pub async fn list_workflows(State(engine): State<Engine>) -> Json<Vec<WorkflowDefinition>> {
    Json(engine.store.list_workflows())
}

pub async fn get_workflow(
    State(engine): State<Engine>,
    Path(workflow_id): Path<String>,
) -> Result<Json<WorkflowDefinition>, StatusCode> {
    engine
        .store
        .get_workflow(&workflow_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

pub async fn delete_workflow(
    State(engine): State<Engine>,
    Path(workflow_id): Path<String>,
) -> StatusCode {
    if engine.store.delete_workflow(&workflow_id) {
        tracing::info!("workflow deleted: {}", workflow_id);
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

// === EXECUTIONS ===

pub async fn start_execution(
    State(engine): State<Engine>,
    Path(workflow_id): Path<String>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<WorkflowRun>), StatusCode> {
    let trigger_input = Value::Object(request.trigger_input);
    match engine
        .start_run(&workflow_id, trigger_input, request.api_keys)
        .await
    {
        Ok(run) => Ok((StatusCode::CREATED, Json(run))),
        Err(EngineError::WorkflowNotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("failed to start execution: {}", e);
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

pub async fn get_execution(
    State(engine): State<Engine>,
    Path(execution_id): Path<String>,
) -> Result<Json<WorkflowRun>, StatusCode> {
    engine
        .store
        .get_run(&execution_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// The per-node audit trail for one run.
pub async fn list_agent_runs(
    State(engine): State<Engine>,
    Path(execution_id): Path<String>,
) -> Result<Json<Vec<AgentRun>>, StatusCode> {
    if engine.store.get_run(&execution_id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(engine.store.agent_runs(&execution_id)))
}

/// Always 200: flagging an unknown or already-terminal run is harmless
/// and the flag is cleaned up when the run finishes.
pub async fn cancel_execution(
    State(engine): State<Engine>,
    Path(execution_id): Path<String>,
) -> Json<Value> {
    engine.cancellations.request(&execution_id);
    tracing::info!("cancellation requested for run {}", execution_id);
    Json(json!({
        "status": "cancellation_requested",
        "execution_id": execution_id
    }))
}

// === STREAMING ===

pub async fn ws_execution_stream(
    State(engine): State<Engine>,
    Path(execution_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_execution_stream(socket, engine, execution_id))
}

/// Bridge between the event bus and one client connection.
///
/// Two concerns share the loop: forwarding bus messages to the client
/// (closing cleanly after workflow_completed) and reading client
/// messages, where {"type":"cancel"} flags the run. Dropping the
/// subscription on exit is the unsubscribe.
async fn handle_execution_stream(socket: WebSocket, engine: Engine, run_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let mut sub = engine.bus.subscribe(&channel_for(&run_id)).await;
    tracing::info!("streaming client connected for run {}", run_id);

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Malformed client messages are dropped silently.
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            if value.get("type").and_then(Value::as_str) == Some("cancel") {
                                engine.cancellations.request(&run_id);
                                tracing::info!("client cancelled run {}", run_id);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        tracing::info!("client disconnected from run stream {}", run_id);
                        break;
                    }
                    Some(Ok(_)) => {} // ping/pong/binary
                }
            }

            event = sub.recv() => {
                let Some(raw) = event else { break };

                // Forward verbatim; decode only to spot the end of stream.
                let is_terminal = serde_json::from_str::<Value>(&raw)
                    .map(|v| v.get("type").and_then(Value::as_str) == Some("workflow_completed"))
                    .unwrap_or(false);

                if sender.send(Message::Text(raw)).await.is_err() {
                    tracing::info!("failed to forward event, client gone for run {}", run_id);
                    break;
                }
                if is_terminal {
                    tracing::info!("run {} reached terminal state, closing stream", run_id);
                    let _ = sender.close().await;
                    break;
                }
            }
        }
    }
}
