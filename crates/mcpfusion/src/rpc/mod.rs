//! Thin JSON-RPC seam for the MCP transport collaborator: `tools/list` and
//! `tools/call` over plain POST. Stream framing (SSE, sessions) stays with
//! the external transport.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::auth::TenantContext;
use crate::errors::ErrorKind;
use crate::http::AppState;

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Deserialize)]
pub struct RpcRequest {
	#[serde(default)]
	pub id: Option<Value>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

#[derive(Serialize)]
pub struct RpcResponse {
	pub jsonrpc: &'static str,
	pub id: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcError>,
}

#[derive(Serialize)]
pub struct RpcError {
	pub code: i64,
	pub message: String,
}

impl RpcResponse {
	fn result(id: Value, result: Value) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: Some(result),
			error: None,
		}
	}

	fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
		Self {
			jsonrpc: "2.0",
			id,
			result: None,
			error: Some(RpcError {
				code,
				message: message.into(),
			}),
		}
	}
}

#[derive(Deserialize)]
struct CallParams {
	name: String,
	#[serde(default)]
	arguments: Map<String, Value>,
}

pub async fn handle(
	State(state): State<AppState>,
	tenant: TenantContext,
	Json(req): Json<RpcRequest>,
) -> Json<RpcResponse> {
	let id = req.id.unwrap_or(Value::Null);
	debug!(tenant = tenant.short_hash(), method = %req.method, "mcp request");
	let response = match req.method.as_str() {
		"tools/list" => RpcResponse::result(id, json!({ "tools": state.engine.list_tools() })),
		"tools/call" => {
			let params: CallParams = match serde_json::from_value(req.params) {
				Ok(params) => params,
				Err(e) => {
					return Json(RpcResponse::error(id, INVALID_PARAMS, e.to_string()));
				},
			};
			match state.engine.invoke(&tenant, &params.name, &params.arguments).await {
				Ok(value) => RpcResponse::result(
					id,
					json!({
						"content": [{ "type": "text", "text": value.to_string() }],
						"isError": false,
					}),
				),
				// Validation problems are protocol errors; execution failures
				// are tool results so clients can show them to the model.
				Err(e) if e.kind() == ErrorKind::Validation => {
					RpcResponse::error(id, INVALID_PARAMS, e.to_string())
				},
				Err(e) => RpcResponse::result(
					id,
					json!({
						"content": [{ "type": "text", "text": e.to_string() }],
						"isError": true,
					}),
				),
			}
		},
		other => RpcResponse::error(id, METHOD_NOT_FOUND, format!("unknown method {other:?}")),
	};
	Json(response)
}
