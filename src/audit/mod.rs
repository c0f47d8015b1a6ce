//! Audit sink interface and packet/conversation records.
//!
//! The gateway never touches storage: every captured exchange is reported to
//! an [`AuditSink`] as one request packet and one response packet, each
//! acknowledged with a frame number and timestamp. Conversations correlate a
//! request/response pair by JSON-RPC id (frame linkage as fallback) for
//! forensic review.

pub mod capture;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;

/// One captured HTTP request, reported before the handler runs.
/// Direction is carried by the packet type: requests are inbound,
/// responses outbound.
#[derive(Debug, Clone)]
pub struct RequestPacket {
    pub session_id: String,
    pub server_name: String,
    pub method: String,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Parsed protocol message, when the body was valid JSON.
    pub body_json: Option<Value>,
    pub jsonrpc_id: Option<String>,
    pub jsonrpc_method: Option<String>,
    pub info: Option<String>,
}

/// One captured HTTP response, reported once the body reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ResponsePacket {
    pub session_id: String,
    pub server_name: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub body_json: Option<Value>,
    pub jsonrpc_id: Option<String>,
    /// Frame number of the request this response answers, for explicit linkage.
    pub request_frame: Option<u64>,
    pub duration_ms: Option<u64>,
    pub info: Option<String>,
}

/// Acknowledgment returned by the sink for each reported packet.
#[derive(Debug, Clone)]
pub struct PacketAck {
    pub frame_number: u64,
    pub timestamp_ns: u64,
    pub jsonrpc_id: Option<String>,
    pub session_id: String,
}

/// Destination for captured packets. Implementations own persistence;
/// the gateway only reports.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_request_packet(&self, packet: RequestPacket) -> crate::Result<PacketAck>;
    async fn log_response_packet(&self, packet: ResponsePacket) -> crate::Result<PacketAck>;
}

/// Correlated request/response pair with derived timing and terminal status.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub request_frame: u64,
    pub response_frame: Option<u64>,
    pub session_id: String,
    pub jsonrpc_id: Option<String>,
    pub method: Option<String>,
    pub started_ns: u64,
    pub completed_ns: Option<u64>,
    pub duration_ms: Option<u64>,
    pub status: ConversationStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationStatus {
    Pending,
    Completed,
    Error,
}

/// Nanoseconds since the Unix epoch.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Extract a JSON-RPC id as its string form ("7", "abc"), None for null or
/// absent ids.
pub fn jsonrpc_id_string(message: &Value) -> Option<String> {
    match message.get("id")? {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// In-memory sink retaining packets and the conversation table.
///
/// The reference implementation of the sink contract, and the harness the
/// capture tests assert byte fidelity against.
#[derive(Default)]
pub struct MemoryAuditSink {
    next_frame: AtomicU64,
    state: Mutex<MemoryAuditState>,
}

#[derive(Default)]
struct MemoryAuditState {
    requests: Vec<(PacketAck, RequestPacket)>,
    responses: Vec<(PacketAck, ResponsePacket)>,
    conversations: Vec<Conversation>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<(PacketAck, RequestPacket)> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn responses(&self) -> Vec<(PacketAck, ResponsePacket)> {
        self.state.lock().unwrap().responses.clone()
    }

    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().unwrap().conversations.clone()
    }

    fn mint_frame(&self) -> u64 {
        self.next_frame.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_request_packet(&self, packet: RequestPacket) -> crate::Result<PacketAck> {
        let ack = PacketAck {
            frame_number: self.mint_frame(),
            timestamp_ns: now_ns(),
            jsonrpc_id: packet.jsonrpc_id.clone(),
            session_id: packet.session_id.clone(),
        };

        let mut state = self.state.lock().unwrap();
        state.conversations.push(Conversation {
            request_frame: ack.frame_number,
            response_frame: None,
            session_id: packet.session_id.clone(),
            jsonrpc_id: packet.jsonrpc_id.clone(),
            method: packet.jsonrpc_method.clone(),
            started_ns: ack.timestamp_ns,
            completed_ns: None,
            duration_ms: None,
            status: ConversationStatus::Pending,
        });
        state.requests.push((ack.clone(), packet));
        Ok(ack)
    }

    async fn log_response_packet(&self, packet: ResponsePacket) -> crate::Result<PacketAck> {
        let ack = PacketAck {
            frame_number: self.mint_frame(),
            timestamp_ns: now_ns(),
            jsonrpc_id: packet.jsonrpc_id.clone(),
            session_id: packet.session_id.clone(),
        };

        let is_error = packet.status >= 400
            || packet
                .body_json
                .as_ref()
                .is_some_and(|v| v.get("error").is_some());

        let mut state = self.state.lock().unwrap();

        // Correlate by protocol id first, explicit frame linkage as fallback.
        // The matching pending conversation is mutated in place; a response
        // never creates a new row.
        let found = state.conversations.iter_mut().find(|c| {
            c.status == ConversationStatus::Pending
                && match (&packet.jsonrpc_id, &c.jsonrpc_id) {
                    (Some(id), Some(pending)) => id == pending,
                    _ => packet.request_frame == Some(c.request_frame),
                }
        });
        if let Some(conversation) = found {
            conversation.response_frame = Some(ack.frame_number);
            conversation.completed_ns = Some(ack.timestamp_ns);
            conversation.duration_ms = packet.duration_ms.or_else(|| {
                Some((ack.timestamp_ns.saturating_sub(conversation.started_ns)) / 1_000_000)
            });
            conversation.status = if is_error {
                ConversationStatus::Error
            } else {
                ConversationStatus::Completed
            };
        } else {
            tracing::debug!(
                session = %packet.session_id,
                "response packet matched no pending conversation"
            );
        }

        state.responses.push((ack.clone(), packet));
        Ok(ack)
    }
}

/// Sink that emits packets as structured log events.
///
/// The CLI default: audit stays an observability side channel when no
/// storage service is wired in.
#[derive(Default)]
pub struct TracingAuditSink {
    next_frame: AtomicU64,
}

impl TracingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn log_request_packet(&self, packet: RequestPacket) -> crate::Result<PacketAck> {
        let frame = self.next_frame.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            frame,
            session = %packet.session_id,
            server = %packet.server_name,
            method = %packet.method,
            uri = %packet.uri,
            jsonrpc_method = packet.jsonrpc_method.as_deref().unwrap_or("-"),
            bytes = packet.body.len(),
            "request captured"
        );
        Ok(PacketAck {
            frame_number: frame,
            timestamp_ns: now_ns(),
            jsonrpc_id: packet.jsonrpc_id,
            session_id: packet.session_id,
        })
    }

    async fn log_response_packet(&self, packet: ResponsePacket) -> crate::Result<PacketAck> {
        let frame = self.next_frame.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(
            frame,
            session = %packet.session_id,
            server = %packet.server_name,
            status = packet.status,
            request_frame = packet.request_frame.unwrap_or(0),
            duration_ms = packet.duration_ms.unwrap_or(0),
            bytes = packet.body.len(),
            "response captured"
        );
        Ok(PacketAck {
            frame_number: frame,
            timestamp_ns: now_ns(),
            jsonrpc_id: packet.jsonrpc_id,
            session_id: packet.session_id,
        })
    }
}
