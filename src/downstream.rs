//! Downstream client bootstrap and the live server descriptor.
//!
//! Connects a protocol client over a built transport, enumerates the
//! server's tools/resources/prompts, and exposes the dispatch surface the
//! routing catalog binds to. A server that does not implement a capability
//! ("method not found") presents it as empty rather than failing bootstrap.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, GetPromptRequestParams, GetPromptResult, Prompt,
    ReadResourceRequestParams, ReadResourceResult, Resource, Tool,
};
use rmcp::service::RunningService;
use rmcp::{Peer, RoleClient, ServiceError, ServiceExt};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{ServerConfig, TimeoutConfig};
use crate::error::ManifoldError;
use crate::transport::{build_transport, DownstreamTransport};

/// Dispatch surface of one discovered downstream server.
///
/// The routing catalog and the proxy handlers only see this trait, so tests
/// can substitute a mock without a live protocol client.
#[async_trait]
pub trait DownstreamHandle: Send + Sync {
    fn name(&self) -> &str;
    fn tools(&self) -> &[Tool];
    fn resources(&self) -> &[Resource];
    fn prompts(&self) -> &[Prompt];

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> crate::Result<CallToolResult>;

    async fn read_resource(&self, uri: &str) -> crate::Result<ReadResourceResult>;

    async fn get_prompt(
        &self,
        prompt: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> crate::Result<GetPromptResult>;
}

/// A connected downstream MCP server with its advertised capabilities.
///
/// Owned by the discovery result; the catalog holds `Arc` references. The
/// stdio child (if any) is retained so `close()` can terminate it.
pub struct DownstreamServer {
    name: String,
    peer: Peer<RoleClient>,
    tools: Vec<Tool>,
    resources: Vec<Resource>,
    prompts: Vec<Prompt>,
    call_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl DownstreamServer {
    /// Terminate the downstream connection's subprocess, if it has one.
    ///
    /// The protocol service itself exits via its cancellation token; this
    /// only reaps the stdio child so `stop()` leaves no orphans.
    pub async fn close(&self) {
        if let Some(mut child) = self.child.lock().await.take() {
            tracing::debug!(server = %self.name, "killing stdio child process");
            let _ = child.kill().await;
        }
    }

    async fn with_call_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, ServiceError>>,
    ) -> crate::Result<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Err(_elapsed) => Err(ManifoldError::CallTimeout(self.name.clone())),
            Ok(Err(e)) => Err(ManifoldError::Protocol(self.name.clone(), e.to_string())),
            Ok(Ok(value)) => Ok(value),
        }
    }
}

#[async_trait]
impl DownstreamHandle for DownstreamServer {
    fn name(&self) -> &str {
        &self.name
    }

    fn tools(&self) -> &[Tool] {
        &self.tools
    }

    fn resources(&self) -> &[Resource] {
        &self.resources
    }

    fn prompts(&self) -> &[Prompt] {
        &self.prompts
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> crate::Result<CallToolResult> {
        let params = CallToolRequestParams {
            name: tool.to_string().into(),
            arguments,
            task: None,
            meta: None,
        };
        self.with_call_timeout(self.peer.call_tool(params)).await
    }

    async fn read_resource(&self, uri: &str) -> crate::Result<ReadResourceResult> {
        let params = ReadResourceRequestParams {
            uri: uri.to_string().into(),
            meta: None,
        };
        self.with_call_timeout(self.peer.read_resource(params)).await
    }

    async fn get_prompt(
        &self,
        prompt: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> crate::Result<GetPromptResult> {
        let params = GetPromptRequestParams {
            name: prompt.to_string().into(),
            arguments,
            meta: None,
        };
        self.with_call_timeout(self.peer.get_prompt(params)).await
    }
}

/// Connect to a configured server and enumerate its capabilities.
///
/// The three capability-list calls run concurrently; all three outcomes are
/// observed before deciding success, so an aggregate failure reports every
/// cause at once instead of the first.
pub async fn bootstrap(
    name: &str,
    config: &ServerConfig,
    timeouts: &TimeoutConfig,
    cancel: CancellationToken,
) -> crate::Result<DownstreamServer> {
    let transport = build_transport(name, config, cancel.clone()).await?;

    let handshake_secs = timeouts.handshake_timeout_secs;
    let handshake = Duration::from_secs(handshake_secs);
    let mut child_slot = None;

    let running = match transport {
        DownstreamTransport::Stdio {
            reader,
            writer,
            child,
        } => {
            child_slot = Some(child);
            finish_handshake(
                name,
                handshake_secs,
                tokio::time::timeout(
                    handshake,
                    ().serve_with_ct((reader, writer), cancel.clone()),
                )
                .await,
            )?
        }
        DownstreamTransport::Http(transport) => finish_handshake(
            name,
            handshake_secs,
            tokio::time::timeout(handshake, ().serve_with_ct(transport, cancel.clone())).await,
        )?,
        DownstreamTransport::Sse(transport) => finish_handshake(
            name,
            handshake_secs,
            tokio::time::timeout(handshake, ().serve_with_ct(transport, cancel.clone())).await,
        )?,
        DownstreamTransport::WebSocket { reader, writer } => finish_handshake(
            name,
            handshake_secs,
            tokio::time::timeout(
                handshake,
                ().serve_with_ct((reader, writer), cancel.clone()),
            )
            .await,
        )?,
    };

    let peer = running.peer().clone();

    // Observe service termination in the background; the running service
    // stays alive inside the task.
    let watch_name = name.to_string();
    tokio::spawn(async move {
        let _ = running.waiting().await;
        tracing::debug!(server = %watch_name, "downstream service terminated");
    });

    let (tools_result, resources_result, prompts_result) = tokio::join!(
        peer.list_all_tools(),
        peer.list_all_resources(),
        peer.list_all_prompts(),
    );

    let mut failures = Vec::new();
    let tools = collect_listing(name, "tools", tools_result, &mut failures);
    let resources = collect_listing(name, "resources", resources_result, &mut failures);
    let prompts = collect_listing(name, "prompts", prompts_result, &mut failures);

    if !failures.is_empty() {
        if let Some(mut child) = child_slot.take() {
            let _ = child.kill().await;
        }
        return Err(ManifoldError::Bootstrap {
            server: name.to_string(),
            sources: failures,
        });
    }

    tracing::info!(
        server = %name,
        tools = tools.len(),
        resources = resources.len(),
        prompts = prompts.len(),
        "downstream server bootstrapped"
    );

    Ok(DownstreamServer {
        name: name.to_string(),
        peer,
        tools,
        resources,
        prompts,
        call_timeout: Duration::from_secs(timeouts.call_timeout_secs),
        child: Mutex::new(child_slot),
    })
}

fn finish_handshake<E: std::fmt::Display>(
    name: &str,
    timeout_secs: u64,
    result: Result<
        Result<RunningService<RoleClient, ()>, E>,
        tokio::time::error::Elapsed,
    >,
) -> crate::Result<RunningService<RoleClient, ()>> {
    match result {
        Err(_elapsed) => Err(ManifoldError::Client(
            name.to_string(),
            format!("MCP handshake timed out after {}s", timeout_secs),
        )),
        Ok(Err(e)) => Err(ManifoldError::Client(name.to_string(), e.to_string())),
        Ok(Ok(running)) => Ok(running),
    }
}

/// Fold one capability-list outcome into either a listing or the failure set.
///
/// "method not found" means the server does not implement the capability;
/// that is an empty listing, not an error.
fn collect_listing<T>(
    name: &str,
    capability: &'static str,
    result: Result<Vec<T>, ServiceError>,
    failures: &mut Vec<ManifoldError>,
) -> Vec<T> {
    match normalize_listing(name, capability, result) {
        Ok(items) => items,
        Err(e) => {
            failures.push(e);
            Vec::new()
        }
    }
}

fn normalize_listing<T>(
    name: &str,
    capability: &'static str,
    result: Result<Vec<T>, ServiceError>,
) -> crate::Result<Vec<T>> {
    match result {
        Ok(items) => Ok(items),
        Err(e) if is_method_not_found(&e) => {
            tracing::debug!(
                server = %name,
                capability = %capability,
                "capability not implemented, treating as empty"
            );
            Ok(Vec::new())
        }
        Err(e) => Err(ManifoldError::Capability {
            server: name.to_string(),
            capability,
            message: e.to_string(),
        }),
    }
}

fn is_method_not_found(error: &ServiceError) -> bool {
    matches!(
        error,
        ServiceError::McpError(data) if data.code == rmcp::model::ErrorCode::METHOD_NOT_FOUND
    )
}
