//! Transport factory for downstream MCP server connections.
//!
//! Builds one connection descriptor per configured server: a spawned stdio
//! subprocess, a streamable-HTTP client, an SSE client, or a WebSocket
//! bridged onto newline-delimited JSON.
//!
//! Key design decisions:
//! - stdio uses raw `tokio::process::Command` instead of `TokioChildProcess`
//!   so noisy-server stdout can be filtered (non-JSON lines discarded) and
//!   the child environment composed explicitly per server.
//! - The child environment is host env ∪ per-server overrides (overrides
//!   win), built as an owned map per spawn so one server's secrets never
//!   reach another's process.
//! - WebSocket text frames are bridged to line-delimited JSON over a
//!   `tokio::io::duplex` pair, giving the protocol client the same
//!   `(reader, writer)` shape as stdio.

use std::collections::HashMap;

use rmcp::transport::sse_client::SseClientConfig;
use rmcp::transport::streamable_http_client::StreamableHttpClientTransportConfig;
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::process::{Child, ChildStdin, Command};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::ManifoldError;

/// Supported downstream transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Sse,
    WebSocket,
}

/// A built downstream connection descriptor, ready for the protocol handshake.
pub enum DownstreamTransport {
    Stdio {
        reader: ReadHalf<DuplexStream>,
        writer: ChildStdin,
        child: Child,
    },
    Http(StreamableHttpClientTransport<reqwest::Client>),
    Sse(SseClientTransport<reqwest::Client>),
    WebSocket {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
    },
}

/// Resolve the transport kind for a server config, validating required fields.
///
/// Explicit kinds are honored ("stdio", "http"/"streamable-http", "sse",
/// "ws"/"websocket"). An absent kind is inferred: `url` implies HTTP,
/// `command` implies stdio. An unrecognized kind with a `command` present
/// falls back to stdio; with neither field it fails.
pub fn resolve_kind(name: &str, config: &ServerConfig) -> crate::Result<TransportKind> {
    let kind = match config.kind.as_deref() {
        Some("stdio") => TransportKind::Stdio,
        Some("http") | Some("streamable-http") => TransportKind::Http,
        Some("sse") => TransportKind::Sse,
        Some("ws") | Some("websocket") => TransportKind::WebSocket,
        Some(other) => {
            if config.command.is_some() {
                tracing::warn!(
                    server = %name,
                    kind = %other,
                    "unrecognized transport kind, falling back to stdio"
                );
                TransportKind::Stdio
            } else {
                return Err(ManifoldError::InvalidConfig(
                    name.to_string(),
                    format!("unrecognized transport kind '{}'", other),
                ));
            }
        }
        None => {
            if config.url.is_some() {
                TransportKind::Http
            } else if config.command.is_some() {
                TransportKind::Stdio
            } else {
                return Err(ManifoldError::InvalidConfig(
                    name.to_string(),
                    "either 'url' or 'command' is required".to_string(),
                ));
            }
        }
    };

    match kind {
        TransportKind::Stdio if config.command.is_none() => Err(ManifoldError::InvalidConfig(
            name.to_string(),
            "command is required for stdio transport".to_string(),
        )),
        TransportKind::Http | TransportKind::Sse | TransportKind::WebSocket
            if config.url.is_none() =>
        {
            Err(ManifoldError::InvalidConfig(
                name.to_string(),
                "url is required for http, sse, and websocket transports".to_string(),
            ))
        }
        _ => Ok(kind),
    }
}

/// Compose the child process environment: host env ∪ per-server overrides,
/// overrides taking precedence.
pub fn merged_env(overrides: &HashMap<String, String>) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}

/// Build the downstream transport for a server config.
///
/// stdio spawns the child process immediately; http/sse/websocket construct
/// (and for sse/websocket, open) the client connection. The protocol
/// handshake itself happens later in the bootstrapper.
pub async fn build_transport(
    name: &str,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> crate::Result<DownstreamTransport> {
    match resolve_kind(name, config)? {
        TransportKind::Stdio => build_stdio(name, config, cancel),
        TransportKind::Http => build_http(name, config),
        TransportKind::Sse => build_sse(name, config).await,
        TransportKind::WebSocket => build_websocket(name, config, cancel).await,
    }
}

fn build_stdio(
    name: &str,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> crate::Result<DownstreamTransport> {
    let command_str = config.command.as_ref().ok_or_else(|| {
        ManifoldError::InvalidConfig(
            name.to_string(),
            "command is required for stdio transport".to_string(),
        )
    })?;

    let mut cmd = Command::new(command_str);
    if !config.args.is_empty() {
        cmd.args(&config.args);
    }
    cmd.env_clear();
    cmd.envs(merged_env(&config.env));
    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;

    let child_stdin = child.stdin.take().ok_or_else(|| {
        ManifoldError::Transport(name.to_string(), "failed to open stdin pipe".to_string())
    })?;
    let child_stdout = child.stdout.take().ok_or_else(|| {
        ManifoldError::Transport(name.to_string(), "failed to open stdout pipe".to_string())
    })?;
    let child_stderr = child.stderr.take().ok_or_else(|| {
        ManifoldError::Transport(name.to_string(), "failed to open stderr pipe".to_string())
    })?;

    let reader = start_stdout_filter(child_stdout, name.to_string(), cancel.clone());
    start_stderr_drain(child_stderr, name.to_string(), cancel);

    Ok(DownstreamTransport::Stdio {
        reader,
        writer: child_stdin,
        child,
    })
}

fn build_http(name: &str, config: &ServerConfig) -> crate::Result<DownstreamTransport> {
    let url = require_url(name, config)?;

    let transport = if config.headers.is_empty() {
        StreamableHttpClientTransport::from_uri(url)
    } else {
        let client = http_client_with_headers(name, &config.headers)?;
        StreamableHttpClientTransport::with_client(
            client,
            StreamableHttpClientTransportConfig::with_uri(url),
        )
    };
    Ok(DownstreamTransport::Http(transport))
}

async fn build_sse(name: &str, config: &ServerConfig) -> crate::Result<DownstreamTransport> {
    let url = require_url(name, config)?;
    let client = http_client_with_headers(name, &config.headers)?;

    let sse_config = SseClientConfig {
        sse_endpoint: url.to_string().into(),
        ..Default::default()
    };
    let transport = SseClientTransport::start_with_client(client, sse_config)
        .await
        .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;
    Ok(DownstreamTransport::Sse(transport))
}

/// Open a WebSocket to the server and bridge text frames onto the same
/// newline-delimited JSON shape the stdio transport uses.
async fn build_websocket(
    name: &str,
    config: &ServerConfig,
    cancel: CancellationToken,
) -> crate::Result<DownstreamTransport> {
    use futures::{SinkExt, StreamExt};

    let url = require_url(name, config)?;
    let mut request = url
        .into_client_request()
        .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;
    for (key, value) in &config.headers {
        let header_name = http::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;
        let header_value = http::header::HeaderValue::from_str(value)
            .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;
    let (mut ws_sink, mut ws_stream) = ws.split();

    // Inbound: WS text frames → duplex reader the protocol client reads from.
    let (inbound_client, inbound_server) = tokio::io::duplex(65536);
    let (reader, _unused_writer) = tokio::io::split(inbound_client);
    let (_unused_reader, mut inbound_writer) = tokio::io::split(inbound_server);

    let server = name.to_string();
    let inbound_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = ws_stream.next() => {
                    match frame {
                        Some(Ok(message)) => {
                            if let Some(line) = jsonl_from_ws_message(&message) {
                                if inbound_writer.write_all(line.as_bytes()).await.is_err() {
                                    break;
                                }
                            } else if message.is_close() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::debug!(server = %server, error = %e, "websocket read error");
                            break;
                        }
                        None => break,
                    }
                }
                _ = inbound_cancel.cancelled() => break,
            }
        }
        // inbound_writer dropped here, signals EOF to the protocol client
    });

    // Outbound: lines the protocol client writes → WS text frames.
    let (outbound_client, outbound_server) = tokio::io::duplex(65536);
    let (_unused_reader, writer) = tokio::io::split(outbound_client);
    let (outbound_reader, _unused_writer) = tokio::io::split(outbound_server);

    let server = name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(outbound_reader).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if ws_sink.send(Message::Text(line.into())).await.is_err() {
                                tracing::debug!(server = %server, "websocket send failed");
                                break;
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    Ok(DownstreamTransport::WebSocket { reader, writer })
}

fn require_url<'a>(name: &str, config: &'a ServerConfig) -> crate::Result<&'a str> {
    config.url.as_deref().ok_or_else(|| {
        ManifoldError::InvalidConfig(
            name.to_string(),
            "url is required for http, sse, and websocket transports".to_string(),
        )
    })
}

fn http_client_with_headers(
    name: &str,
    headers: &HashMap<String, String>,
) -> crate::Result<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (key, value) in headers {
        let header_name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;
        let header_value = reqwest::header::HeaderValue::from_str(value)
            .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))?;
        header_map.insert(header_name, header_value);
    }
    reqwest::Client::builder()
        .default_headers(header_map)
        .build()
        .map_err(|e| ManifoldError::Transport(name.to_string(), e.to_string()))
}

/// Convert a WebSocket message into a newline-terminated JSON line, or None
/// for frames that carry no protocol payload (ping/pong/close/binary).
fn jsonl_from_ws_message(message: &Message) -> Option<String> {
    match message {
        Message::Text(text) if !text.is_empty() => {
            let mut line = text.to_string();
            if !line.ends_with('\n') {
                line.push('\n');
            }
            Some(line)
        }
        _ => None,
    }
}

/// Start a background task that filters stdout from the child process.
///
/// Servers that log banners or progress to stdout would corrupt the JSON-RPC
/// stream; non-JSON lines are discarded with a debug log, valid JSON lines
/// are forwarded to the returned duplex reader the protocol client reads.
fn start_stdout_filter(
    child_stdout: tokio::process::ChildStdout,
    name: String,
    cancel: CancellationToken,
) -> ReadHalf<DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (reader, _client_writer) = tokio::io::split(client_side);
    let (_server_reader, mut writer) = tokio::io::split(server_side);

    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if serde_json::from_str::<serde_json::Value>(&line).is_ok() {
                                let with_newline = format!("{}\n", line);
                                if writer.write_all(with_newline.as_bytes()).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::debug!(
                                    server = %name,
                                    line = %line,
                                    "discarding non-JSON stdout line"
                                );
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        // writer dropped here, signals EOF to the reader half
    });

    reader
}

/// Start a background task that drains stderr from the child process,
/// logging each line at debug level.
fn start_stderr_drain(
    child_stderr: tokio::process::ChildStderr,
    name: String,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %name, line = %line, "server stderr");
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}
