//! Internal proxy server — per-session protocol operation handlers.
//!
//! Each client session gets a `ProxyServer` scoped to one downstream server
//! name. Six operation handlers (list/call tools, list/get prompts,
//! list/read resources) resolve through the shared routing catalog; the
//! protocol-plumbing methods (initialize, ping, notifications) are answered
//! locally with payloads built from `rmcp` model types. Routing misses
//! surface as JSON-RPC errors naming the missing item — never a crash, and
//! no downstream call is attempted.

pub mod stream;

use std::sync::Arc;

use rmcp::model::{
    Implementation, ListPromptsResult, ListResourcesResult, ListToolsResult, ServerCapabilities,
    ServerInfo,
};
use serde_json::{json, Value};

use crate::catalog::{CatalogAction, RoutingCatalog};
use crate::error::ManifoldError;

/// JSON-RPC error codes used by the proxy handlers.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Per-session protocol handler bound to one downstream server name.
pub struct ProxyServer {
    server_name: String,
    catalog: Arc<RoutingCatalog>,
}

impl ProxyServer {
    pub fn new(server_name: impl Into<String>, catalog: Arc<RoutingCatalog>) -> Self {
        Self {
            server_name: server_name.into(),
            catalog,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Handle one decoded JSON-RPC message.
    ///
    /// Returns the response value for requests, None for notifications
    /// (which get no protocol-level reply).
    pub async fn handle_message(&self, message: &Value) -> Option<Value> {
        let Some(object) = message.as_object() else {
            return Some(error_response(
                &Value::Null,
                INVALID_REQUEST,
                "expected a JSON-RPC request object",
            ));
        };

        let id = object.get("id").cloned();
        let method = object.get("method").and_then(|m| m.as_str());
        let params = object.get("params");

        let Some(method) = method else {
            // A message with no method is not a request we can route.
            return Some(error_response(
                &id.unwrap_or(Value::Null),
                INVALID_REQUEST,
                "missing method",
            ));
        };

        let Some(id) = id else {
            // Notification — acknowledged by transport-level 202, no reply.
            tracing::debug!(
                server = %self.server_name,
                method = %method,
                "notification received"
            );
            return None;
        };

        let response = match method {
            "initialize" => self.handle_initialize(&id),
            "ping" => response(&id, json!({})),
            "tools/list" => self.handle_list_tools(&id),
            "tools/call" => self.handle_call_tool(&id, params).await,
            "resources/list" => self.handle_list_resources(&id),
            "resources/read" => self.handle_read_resource(&id, params).await,
            "prompts/list" => self.handle_list_prompts(&id),
            "prompts/get" => self.handle_get_prompt(&id, params).await,
            other => error_response(
                &id,
                METHOD_NOT_FOUND,
                &format!("method not supported: {}", other),
            ),
        };
        Some(response)
    }

    /// Answer the handshake with this gateway's identity and capabilities.
    fn handle_initialize(&self, id: &Value) -> Value {
        let info = ServerInfo {
            server_info: Implementation {
                name: "manifold".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Manifold gateway session scoped to downstream server '{}'.",
                self.server_name
            )),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_resources()
                .enable_prompts()
                .build(),
            ..Default::default()
        };
        match serde_json::to_value(&info) {
            Ok(result) => response(id, result),
            Err(e) => error_response(id, INTERNAL_ERROR, &e.to_string()),
        }
    }

    fn handle_list_tools(&self, id: &Value) -> Value {
        let result = ListToolsResult {
            tools: self.catalog.list_tools(&self.server_name).to_vec(),
            next_cursor: None,
            meta: None,
        };
        serialize_result(id, &result)
    }

    fn handle_list_resources(&self, id: &Value) -> Value {
        let result = ListResourcesResult {
            resources: self.catalog.list_resources(&self.server_name).to_vec(),
            next_cursor: None,
            meta: None,
        };
        serialize_result(id, &result)
    }

    fn handle_list_prompts(&self, id: &Value) -> Value {
        let result = ListPromptsResult {
            prompts: self.catalog.list_prompts(&self.server_name).to_vec(),
            next_cursor: None,
            meta: None,
        };
        serialize_result(id, &result)
    }

    async fn handle_call_tool(&self, id: &Value, params: Option<&Value>) -> Value {
        let Some(tool_name) = param_str(params, "name") else {
            return error_response(id, INVALID_PARAMS, "missing tool name");
        };

        let Some(dispatch) =
            self.catalog
                .lookup(&self.server_name, tool_name, CatalogAction::CallTool)
        else {
            return self.not_found_response(id, ManifoldError::NotFound {
                server: self.server_name.clone(),
                kind: crate::error::CatalogKind::Tool,
                item: tool_name.to_string(),
            });
        };

        let arguments = param_object(params, "arguments");
        tracing::debug!(
            server = %self.server_name,
            tool = %tool_name,
            "forwarding tool call"
        );
        match dispatch.call_tool(arguments).await {
            Ok(result) => serialize_result(id, &result),
            Err(e) => self.downstream_error_response(id, e),
        }
    }

    async fn handle_read_resource(&self, id: &Value, params: Option<&Value>) -> Value {
        let Some(uri) = param_str(params, "uri") else {
            return error_response(id, INVALID_PARAMS, "missing resource uri");
        };

        let Some(dispatch) =
            self.catalog
                .lookup(&self.server_name, uri, CatalogAction::ReadResource)
        else {
            return self.not_found_response(id, ManifoldError::NotFound {
                server: self.server_name.clone(),
                kind: crate::error::CatalogKind::Resource,
                item: uri.to_string(),
            });
        };

        tracing::debug!(server = %self.server_name, uri = %uri, "forwarding resource read");
        match dispatch.read_resource().await {
            Ok(result) => serialize_result(id, &result),
            Err(e) => self.downstream_error_response(id, e),
        }
    }

    async fn handle_get_prompt(&self, id: &Value, params: Option<&Value>) -> Value {
        let Some(prompt_name) = param_str(params, "name") else {
            return error_response(id, INVALID_PARAMS, "missing prompt name");
        };

        let Some(dispatch) =
            self.catalog
                .lookup(&self.server_name, prompt_name, CatalogAction::GetPrompt)
        else {
            return self.not_found_response(id, ManifoldError::NotFound {
                server: self.server_name.clone(),
                kind: crate::error::CatalogKind::Prompt,
                item: prompt_name.to_string(),
            });
        };

        let arguments = param_object(params, "arguments");
        tracing::debug!(server = %self.server_name, prompt = %prompt_name, "forwarding prompt fetch");
        match dispatch.get_prompt(arguments).await {
            Ok(result) => serialize_result(id, &result),
            Err(e) => self.downstream_error_response(id, e),
        }
    }

    fn not_found_response(&self, id: &Value, error: ManifoldError) -> Value {
        tracing::debug!(server = %self.server_name, error = %error, "routing miss");
        error_response(id, INVALID_PARAMS, &error.to_string())
    }

    fn downstream_error_response(&self, id: &Value, error: ManifoldError) -> Value {
        tracing::warn!(server = %self.server_name, error = %error, "downstream call failed");
        error_response(id, INTERNAL_ERROR, &error.to_string())
    }
}

fn param_str<'a>(params: Option<&'a Value>, key: &str) -> Option<&'a str> {
    params?.get(key)?.as_str()
}

fn param_object(
    params: Option<&Value>,
    key: &str,
) -> Option<serde_json::Map<String, Value>> {
    params?.get(key)?.as_object().cloned()
}

fn serialize_result<T: serde::Serialize>(id: &Value, result: &T) -> Value {
    match serde_json::to_value(result) {
        Ok(value) => response(id, value),
        Err(e) => error_response(id, INTERNAL_ERROR, &e.to_string()),
    }
}

/// Build a JSON-RPC success envelope.
pub fn response(id: &Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build a JSON-RPC error envelope.
pub fn error_response(id: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}
