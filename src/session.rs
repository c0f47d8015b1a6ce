//! Session registry — maps session identifiers to live per-client transports.
//!
//! A request with no recognized session id mints a fresh session bound to a
//! proxy server for the requested downstream name; a recognized id reuses
//! the stored transport with no re-handshake. Sessions are evicted by a TTL
//! reaper and an LRU cap rather than living for the process lifetime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::RoutingCatalog;
use crate::config::SessionConfig;
use crate::error::ManifoldError;
use crate::proxy::stream::forward_chunks;
use crate::proxy::{error_response, ProxyServer, PARSE_ERROR};

/// Canonical session header.
pub const SESSION_HEADER: &str = "mcp-session-id";
/// Legacy alias, accepted inbound only.
pub const LEGACY_SESSION_HEADER: &str = "x-mcp-session-id";

/// Interval between keep-alive events on the session's GET stream.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// One client session: a minted id bound to a proxy server instance.
pub struct SessionTransport {
    session_id: String,
    proxy: ProxyServer,
    last_seen: Mutex<Instant>,
}

impl SessionTransport {
    fn new(session_id: String, proxy: ProxyServer) -> Self {
        Self {
            session_id,
            proxy,
            last_seen: Mutex::new(Instant::now()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_name(&self) -> &str {
        self.proxy.server_name()
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, age: Duration) {
        *self.last_seen.lock().unwrap() = Instant::now() - age;
    }

    /// Handle one buffered request against this session's proxy server.
    ///
    /// POST carries a JSON-RPC message (requests get a JSON reply,
    /// notifications a 202); GET opens the session's server→client event
    /// stream; everything else is 405. The session header is set on every
    /// response.
    pub async fn handle_request(
        &self,
        method: &Method,
        body: &Bytes,
        parsed: Option<&Value>,
    ) -> Response<Body> {
        self.touch();

        let mut response = if *method == Method::POST {
            self.handle_post(body, parsed).await
        } else if *method == Method::GET {
            self.handle_event_stream()
        } else {
            let envelope = serde_json::json!({
                "error": "method_not_allowed",
                "message": format!("{} is not supported on this endpoint", method),
            });
            json_response(StatusCode::METHOD_NOT_ALLOWED, &envelope)
        };

        if let Ok(value) = HeaderValue::from_str(&self.session_id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
        response
    }

    async fn handle_post(&self, body: &Bytes, parsed: Option<&Value>) -> Response<Body> {
        // Tolerate an unparseable body at the capture layer; here it is a
        // protocol-level parse error.
        let owned;
        let message = match parsed {
            Some(value) => value,
            None => match serde_json::from_slice::<Value>(body) {
                Ok(value) => {
                    owned = value;
                    &owned
                }
                Err(e) => {
                    let error =
                        error_response(&Value::Null, PARSE_ERROR, &format!("parse error: {}", e));
                    return json_response(StatusCode::BAD_REQUEST, &error);
                }
            },
        };

        match self.proxy.handle_message(message).await {
            Some(reply) => json_response(StatusCode::OK, &reply),
            None => Response::builder()
                .status(StatusCode::ACCEPTED)
                .body(Body::empty())
                .unwrap_or_default(),
        }
    }

    /// Open the long-lived server→client event stream.
    ///
    /// Events flow through the bounded logging passthrough; the stream is
    /// infinite and ends only when the client disconnects.
    fn handle_event_stream(&self) -> Response<Body> {
        let interval = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        let events = futures::stream::unfold(interval, |mut interval| async move {
            interval.tick().await;
            Some((
                Ok::<Bytes, std::io::Error>(Bytes::from_static(b": keep-alive\n\n")),
                interval,
            ))
        });
        let forwarded = forward_chunks(format!("session:{}", self.session_id), events);

        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-store")
            .body(Body::from_stream(forwarded))
            .unwrap_or_default()
    }
}

fn json_response(status: StatusCode, value: &Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(value.to_string()))
        .unwrap_or_default()
}

/// Concurrency-safe map of live sessions, plus their lifecycle policy.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionTransport>>>,
    catalog: Arc<RoutingCatalog>,
    ttl: Duration,
    max_sessions: usize,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(catalog: Arc<RoutingCatalog>, config: &SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            catalog,
            ttl: Duration::from_secs(config.ttl_secs),
            max_sessions: config.max_sessions,
            closed: AtomicBool::new(false),
        })
    }

    /// Extract the session id from request headers, canonical header first.
    pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
        for name in [SESSION_HEADER, LEGACY_SESSION_HEADER] {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    /// Resolve the session for a request, minting one when no recognized id
    /// is present. A carried-but-unknown id also mints a fresh session.
    pub async fn resolve_or_create(
        &self,
        headers: &HeaderMap,
        server_name: &str,
    ) -> crate::Result<Arc<SessionTransport>> {
        if let Some(session_id) = Self::session_id_from_headers(headers) {
            if let Some(session) = self.sessions.read().await.get(&session_id) {
                session.touch();
                return Ok(session.clone());
            }
            tracing::debug!(session = %session_id, "unrecognized session id, minting a new session");
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(ManifoldError::ShuttingDown);
        }

        let session_id = Uuid::new_v4().to_string();
        let proxy = ProxyServer::new(server_name, self.catalog.clone());
        let session = Arc::new(SessionTransport::new(session_id.clone(), proxy));

        let mut sessions = self.sessions.write().await;
        if sessions.len() >= self.max_sessions {
            evict_lru(&mut sessions);
        }
        sessions.insert(session_id.clone(), session.clone());
        tracing::info!(
            session = %session_id,
            server = %server_name,
            live = sessions.len(),
            "session created"
        );
        Ok(session)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionTransport>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Evict every session idle longer than the TTL. Returns the eviction count.
    pub async fn reap_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|session_id, session| {
            let keep = session.idle_for() < self.ttl;
            if !keep {
                tracing::info!(session = %session_id, "session expired, evicting");
            }
            keep
        });
        before - sessions.len()
    }

    /// Refuse new sessions and drop every live one.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            tracing::info!(count, "dropped live sessions on shutdown");
        }
    }

    /// Spawn the background reaper task; it exits on cancellation.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick is not a reap cycle
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = registry.reap_expired().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, "session reaper pass complete");
                        }
                    }
                    _ = cancel.cancelled() => {
                        tracing::debug!("session reaper cancelled");
                        return;
                    }
                }
            }
        });
    }
}

fn evict_lru(sessions: &mut HashMap<String, Arc<SessionTransport>>) {
    let oldest = sessions
        .iter()
        .max_by_key(|(_, session)| session.idle_for())
        .map(|(session_id, _)| session_id.clone());
    if let Some(session_id) = oldest {
        tracing::warn!(session = %session_id, "session cap reached, evicting least-recently-used");
        sessions.remove(&session_id);
    }
}
