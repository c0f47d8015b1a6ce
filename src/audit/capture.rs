//! Audit capture proxy — tees one request/response exchange.
//!
//! Wraps a single exchange end to end: drains and reports the request body
//! before the handler runs, replays the buffered request into the session
//! transport, and mirrors every response chunk into a capped capture buffer
//! while forwarding it byte-identically to the client. Works the same for
//! one-shot JSON replies and long-lived event streams.
//!
//! The tee reaches its terminal state through either of two signals — the
//! body stream ending, or the tee being dropped on client disconnect — and
//! finalizes exactly once. Sink failures never break the request path.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Request, Response, StatusCode};
use futures::Stream;
use serde_json::Value;

use crate::audit::{jsonrpc_id_string, now_ns, AuditSink, PacketAck, RequestPacket, ResponsePacket};
use crate::config::AuditConfig;
use crate::session::{SessionRegistry, SessionTransport};

/// Capture one exchange against the resolved session transport.
///
/// `transport` is None when the registry could not supply one (shutdown);
/// the exchange is then answered with a fixed server error and the response
/// is not audited.
pub async fn capture_exchange(
    sink: Arc<dyn AuditSink>,
    audit: &AuditConfig,
    server_name: &str,
    transport: Option<Arc<SessionTransport>>,
    session_hint: &str,
    request: Request<Body>,
) -> Response<Body> {
    let (parts, body) = request.into_parts();

    // 1. Fully drain the inbound request body, bounded.
    let body_bytes = match axum::body::to_bytes(body, audit.max_request_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_envelope(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "request body exceeds the configured limit",
            );
        }
    };

    // 2. Effective session id: explicit header, else the registry's hint —
    //    the first request of a session carries no header yet.
    let session_id = SessionRegistry::session_id_from_headers(&parts.headers)
        .unwrap_or_else(|| session_hint.to_string());

    // 3. Best-effort protocol parse for correlation; the raw bytes are kept
    //    either way.
    let parsed: Option<Value> = if body_bytes.is_empty() {
        None
    } else {
        serde_json::from_slice(&body_bytes).ok()
    };
    let jsonrpc_id = parsed.as_ref().and_then(jsonrpc_id_string);
    let jsonrpc_method = parsed
        .as_ref()
        .and_then(|m| m.get("method"))
        .and_then(|m| m.as_str())
        .map(|m| m.to_string());

    // 4. Report the request packet before the handler runs.
    let request_packet = RequestPacket {
        session_id: session_id.clone(),
        server_name: server_name.to_string(),
        method: parts.method.to_string(),
        uri: parts.uri.to_string(),
        headers: header_pairs(&parts.headers),
        body: body_bytes.clone(),
        body_json: parsed.clone(),
        jsonrpc_id: jsonrpc_id.clone(),
        jsonrpc_method,
        info: None,
    };
    let request_ack = match sink.log_request_packet(request_packet).await {
        Ok(ack) => Some(ack),
        Err(e) => {
            tracing::warn!(error = %e, "audit sink failed on request packet, continuing");
            None
        }
    };

    let Some(transport) = transport else {
        tracing::error!(server = %server_name, "no usable transport for request");
        return error_envelope(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            "no transport available for session",
        );
    };

    // 6. Replay the buffered request into the session transport.
    let response = transport
        .handle_request(&parts.method, &body_bytes, parsed.as_ref())
        .await;

    // 5/7/8. Tee the outbound body; the finalizer reports the response
    // packet once the stream terminates either way.
    let (response_parts, response_body) = response.into_parts();
    let finalizer = ResponseFinalizer {
        sink,
        server_name: server_name.to_string(),
        session_id,
        request_jsonrpc_id: jsonrpc_id,
        request_ack,
        status: response_parts.status.as_u16(),
        headers: header_pairs(&response_parts.headers),
    };
    let tee = TeeStream::new(
        response_body.into_data_stream(),
        audit.max_capture_bytes,
        finalizer,
    );
    Response::from_parts(response_parts, Body::from_stream(tee))
}

fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}

/// Fixed `{error, message}` envelope for transport-level failures.
fn error_envelope(status: StatusCode, error: &str, message: &str) -> Response<Body> {
    let body = serde_json::json!({"error": error, "message": message});
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}

/// Context needed to report the response packet at terminal time.
struct ResponseFinalizer {
    sink: Arc<dyn AuditSink>,
    server_name: String,
    session_id: String,
    request_jsonrpc_id: Option<String>,
    request_ack: Option<PacketAck>,
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseFinalizer {
    async fn report(self, captured: Bytes, truncated: bool, info: Option<String>) {
        let body_json: Option<Value> = serde_json::from_slice(&captured).ok();
        // Correlate on the response's own id when it has one, else carry the
        // request's id through.
        let jsonrpc_id = body_json
            .as_ref()
            .and_then(jsonrpc_id_string)
            .or(self.request_jsonrpc_id);

        let (request_frame, duration_ms) = match &self.request_ack {
            Some(ack) => (
                Some(ack.frame_number),
                Some(now_ns().saturating_sub(ack.timestamp_ns) / 1_000_000),
            ),
            None => (None, None),
        };

        let mut notes = Vec::new();
        if truncated {
            notes.push(format!("capture truncated at {} bytes", captured.len()));
        }
        if let Some(extra) = info {
            notes.push(extra);
        }

        let packet = ResponsePacket {
            session_id: self.session_id,
            server_name: self.server_name,
            status: self.status,
            headers: self.headers,
            body: captured,
            body_json,
            jsonrpc_id,
            request_frame,
            duration_ms,
            info: (!notes.is_empty()).then(|| notes.join("; ")),
        };
        if let Err(e) = self.sink.log_response_packet(packet).await {
            tracing::warn!(error = %e, "audit sink failed on response packet");
        }
    }
}

/// Body-stream tee: forwards chunks unmodified while mirroring a capped copy.
struct TeeStream {
    inner: axum::body::BodyDataStream,
    captured: Vec<u8>,
    cap: usize,
    truncated: bool,
    finalizer: Option<ResponseFinalizer>,
}

impl TeeStream {
    fn new(inner: axum::body::BodyDataStream, cap: usize, finalizer: ResponseFinalizer) -> Self {
        Self {
            inner,
            captured: Vec::new(),
            cap,
            truncated: false,
            finalizer: Some(finalizer),
        }
    }

    fn mirror(&mut self, chunk: &Bytes) {
        if self.truncated {
            return;
        }
        let remaining = self.cap.saturating_sub(self.captured.len());
        if chunk.len() <= remaining {
            self.captured.extend_from_slice(chunk);
        } else {
            self.captured.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        }
    }

    /// Fire the response report exactly once, from whichever terminal signal
    /// arrives first.
    fn finalize(&mut self, info: Option<String>) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let captured = Bytes::from(std::mem::take(&mut self.captured));
        let truncated = self.truncated;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    finalizer.report(captured, truncated, info).await;
                });
            }
            Err(_) => {
                tracing::warn!("no runtime available to report response packet");
            }
        }
    }
}

impl Stream for TeeStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.mirror(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finalize(Some(format!("response stream error: {}", e)));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finalize(None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TeeStream {
    fn drop(&mut self) {
        // Client disconnect: the second terminal signal.
        self.finalize(Some("response stream dropped before completion".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::catalog::test_support::MockDownstream;
    use crate::catalog::RoutingCatalog;
    use crate::config::SessionConfig;
    use crate::downstream::DownstreamHandle;
    use crate::error::ManifoldError;
    use async_trait::async_trait;
    use axum::http::Method;
    use futures::StreamExt;
    use http_body_util::BodyExt;
    use serde_json::json;
    use std::time::Duration;

    fn memory_sink() -> Arc<MemoryAuditSink> {
        Arc::new(MemoryAuditSink::new())
    }

    async fn session_for(server: &str) -> Arc<SessionTransport> {
        let catalog = RoutingCatalog::build(vec![
            Arc::new(MockDownstream::new("gh").with_tool("list_repos")) as Arc<dyn DownstreamHandle>,
        ]);
        let registry = SessionRegistry::new(Arc::new(catalog), &SessionConfig::default());
        registry
            .resolve_or_create(&HeaderMap::new(), server)
            .await
            .unwrap()
    }

    fn post_request(body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/mcp/gh")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn finalizer(sink: Arc<MemoryAuditSink>, ack: Option<PacketAck>) -> ResponseFinalizer {
        ResponseFinalizer {
            sink,
            server_name: "gh".to_string(),
            session_id: "sess".to_string(),
            request_jsonrpc_id: Some("1".to_string()),
            request_ack: ack,
            status: 200,
            headers: vec![],
        }
    }

    fn chunked_body(chunks: &[&'static str]) -> Body {
        let stream = futures::stream::iter(
            chunks
                .iter()
                .map(|c| Ok::<Bytes, axum::Error>(Bytes::from_static(c.as_bytes())))
                .collect::<Vec<_>>(),
        );
        Body::from_stream(stream)
    }

    #[tokio::test]
    async fn test_exchange_bytes_are_captured_identically() {
        let sink = memory_sink();
        let session = session_for("gh").await;
        let request_body = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string();

        let response = capture_exchange(
            sink.clone(),
            &AuditConfig::default(),
            "gh",
            Some(session.clone()),
            session.session_id(),
            post_request(&request_body),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let client_bytes = response.into_body().collect().await.unwrap().to_bytes();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The transport saw exactly B, the sink holds copies of B and R
        // byte-identical to what was transmitted.
        let requests = sink.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].1.body, Bytes::from(request_body));

        let responses = sink.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.body, client_bytes);
        assert_eq!(responses[0].1.status, 200);
        assert_eq!(
            responses[0].1.request_frame,
            Some(requests[0].0.frame_number)
        );
        assert!(responses[0].1.duration_ms.is_some());
    }

    #[tokio::test]
    async fn test_exchange_updates_conversation() {
        let sink = memory_sink();
        let session = session_for("gh").await;
        let body = json!({"jsonrpc": "2.0", "id": 42, "method": "tools/list"}).to_string();

        let response = capture_exchange(
            sink.clone(),
            &AuditConfig::default(),
            "gh",
            Some(session.clone()),
            session.session_id(),
            post_request(&body),
        )
        .await;
        let _ = response.into_body().collect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let conversations = sink.conversations();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].jsonrpc_id.as_deref(), Some("42"));
        assert!(conversations[0].response_frame.is_some());
    }

    #[tokio::test]
    async fn test_tee_multi_chunk_fidelity() {
        let sink = memory_sink();
        let body = chunked_body(&["alpha-", "beta-", "gamma"]);
        let tee = TeeStream::new(
            body.into_data_stream(),
            1024 * 1024,
            finalizer(sink.clone(), None),
        );

        let client_bytes = Body::from_stream(tee).collect().await.unwrap().to_bytes();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(client_bytes, Bytes::from_static(b"alpha-beta-gamma"));
        let responses = sink.responses();
        assert_eq!(responses.len(), 1, "exactly one response packet, no duplication");
        assert_eq!(responses[0].1.body, client_bytes);
        assert!(responses[0].1.info.is_none(), "no truncation below the cap");
    }

    #[tokio::test]
    async fn test_tee_truncates_capture_but_not_passthrough() {
        let sink = memory_sink();
        let body = chunked_body(&["0123456789", "abcdefghij"]);
        let tee = TeeStream::new(body.into_data_stream(), 4, finalizer(sink.clone(), None));

        let client_bytes = Body::from_stream(tee).collect().await.unwrap().to_bytes();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            client_bytes,
            Bytes::from_static(b"0123456789abcdefghij"),
            "pass-through must never be truncated"
        );
        let responses = sink.responses();
        assert_eq!(responses[0].1.body, Bytes::from_static(b"0123"));
        assert!(responses[0].1.info.as_deref().unwrap().contains("truncated"));
    }

    #[tokio::test]
    async fn test_tee_finalizes_on_drop() {
        let sink = memory_sink();
        let body = chunked_body(&["first", "second", "third"]);
        let mut tee = TeeStream::new(body.into_data_stream(), 1024, finalizer(sink.clone(), None));

        // Consume one chunk, then simulate a client disconnect.
        let first = tee.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"first"));
        drop(tee);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let responses = sink.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].1.body, Bytes::from_static(b"first"));
        assert!(responses[0].1.info.as_deref().unwrap().contains("dropped"));
    }

    #[tokio::test]
    async fn test_tee_finalizes_exactly_once() {
        let sink = memory_sink();
        let body = chunked_body(&["only"]);
        let tee = TeeStream::new(body.into_data_stream(), 1024, finalizer(sink.clone(), None));

        // Stream end fires the finalizer; the subsequent drop must not.
        let _ = Body::from_stream(tee).collect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.responses().len(), 1);
    }

    #[tokio::test]
    async fn test_no_transport_is_fixed_server_error() {
        let sink = memory_sink();
        let response = capture_exchange(
            sink.clone(),
            &AuditConfig::default(),
            "gh",
            None,
            "hint",
            post_request("{}"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let envelope: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(envelope["error"], "server_error");
        assert!(envelope["message"].is_string());

        tokio::time::sleep(Duration::from_millis(50)).await;
        // The request was still audited; steps 6-8 were skipped.
        assert_eq!(sink.requests().len(), 1);
        assert!(sink.responses().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_request_rejected() {
        let sink = memory_sink();
        let session = session_for("gh").await;
        let audit = AuditConfig {
            max_request_bytes: 8,
            ..Default::default()
        };

        let response = capture_exchange(
            sink.clone(),
            &audit,
            "gh",
            Some(session.clone()),
            session.session_id(),
            post_request("{\"jsonrpc\": \"2.0\", \"id\": 1}"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(sink.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_body_falls_back_to_raw_capture() {
        let sink = memory_sink();
        let session = session_for("gh").await;

        let response = capture_exchange(
            sink.clone(),
            &AuditConfig::default(),
            "gh",
            Some(session.clone()),
            session.session_id(),
            post_request("this is not json"),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let requests = sink.requests();
        assert_eq!(requests[0].1.body, Bytes::from_static(b"this is not json"));
        assert!(requests[0].1.body_json.is_none());
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn log_request_packet(&self, _packet: RequestPacket) -> crate::Result<PacketAck> {
            Err(ManifoldError::Audit("sink unavailable".to_string()))
        }

        async fn log_response_packet(&self, _packet: ResponsePacket) -> crate::Result<PacketAck> {
            Err(ManifoldError::Audit("sink unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_sink_failure_never_breaks_the_request_path() {
        let session = session_for("gh").await;
        let body = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}).to_string();

        let response = capture_exchange(
            Arc::new(FailingSink),
            &AuditConfig::default(),
            "gh",
            Some(session.clone()),
            session.session_id(),
            post_request(&body),
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let reply: Value = serde_json::from_slice(&bytes).unwrap();
        assert!(reply["result"]["tools"].is_array());
    }
}
