//! HTTP request handlers.

use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use devrpc_core::{BroadcastOutcome, ErrorObject, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error};

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Positional arguments: an array is spread, anything else is the single
    /// argument.
    pub fn args(&self) -> Vec<Value> {
        match &self.params {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
        }
    }
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, error: ErrorObject) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Connected peers of the RPC surface.
pub async fn handle_peers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let peers: Vec<u64> = state.rpc.peers().into_iter().map(|peer| peer.0).collect();
    Json(json!({
        "name": state.rpc.name(),
        "hubPort": state.hub.port,
        "peers": peers,
    }))
}

/// Call a server function locally, exactly as a connected tool would.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = &request.method;
    let id = request.id.clone();
    let args = request.args();

    debug!("RPC call: {}({:?})", method, args);

    let Some(function) = state.rpc.registry().get(method) else {
        let err = RpcError::MethodNotFound {
            method: method.clone(),
        };
        return (StatusCode::OK, Json(JsonRpcResponse::error(id, err.to_wire())));
    };

    match function.call(args).await {
        Ok(value) => (StatusCode::OK, Json(JsonRpcResponse::success(id, value))),
        Err(e) => {
            error!("RPC error for {}: {:#}", method, e);
            let err = RpcError::Remote {
                method: method.clone(),
                code: -32603,
                message: format!("{:#}", e),
            };
            (StatusCode::OK, Json(JsonRpcResponse::error(id, err.to_wire())))
        }
    }
}

/// Call a method on every connected tool and report each outcome.
pub async fn handle_broadcast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let args = request.args();
    debug!("Broadcast: {}({:?})", request.method, args);

    let outcomes = state.rpc.broadcast(&request.method, args).await;
    let results: Vec<Value> = outcomes.into_iter().map(outcome_to_json).collect();

    (
        StatusCode::OK,
        Json(JsonRpcResponse::success(request.id, Value::Array(results))),
    )
}

fn outcome_to_json(outcome: BroadcastOutcome) -> Value {
    match outcome.result {
        Ok(value) => json!({
            "peer": outcome.peer.0,
            "ok": true,
            "result": value,
        }),
        Err(e) => json!({
            "peer": outcome.peer.0,
            "ok": false,
            "error": e.to_wire(),
        }),
    }
}
