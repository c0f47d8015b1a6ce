//! Manifold — MCP aggregation gateway with forensic traffic capture.
//! Fronts any number of configured MCP servers (stdio, HTTP, SSE, WebSocket)
//! behind one HTTP endpoint, multiplexes client sessions, routes tool,
//! resource, and prompt operations by server name, and reports a byte-exact
//! audit trail of every exchange to a pluggable sink.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod downstream;
pub mod error;
pub mod gateway;
pub mod proxy;
pub mod session;
pub mod transport;

pub use audit::{
    AuditSink, Conversation, ConversationStatus, MemoryAuditSink, PacketAck, RequestPacket,
    ResponsePacket, TracingAuditSink,
};
pub use catalog::{CatalogAction, Dispatch, RoutingCatalog};
pub use config::{AuditConfig, ManifoldConfig, ServerConfig, SessionConfig, TimeoutConfig};
pub use discovery::discover;
pub use downstream::{bootstrap, DownstreamHandle, DownstreamServer};
pub use error::{CatalogKind, ManifoldError, Result};
pub use gateway::{Gateway, GatewayHandle};
pub use proxy::ProxyServer;
pub use session::{SessionRegistry, SessionTransport, LEGACY_SESSION_HEADER, SESSION_HEADER};
pub use transport::{build_transport, resolve_kind, DownstreamTransport, TransportKind};
