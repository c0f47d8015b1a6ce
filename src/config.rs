//! Manifold gateway configuration — deserialization, defaults, and validation.
//!
//! The config is a pre-normalized mapping of server name → transport fields.
//! Detection and parsing of IDE/source config files is a separate concern;
//! by the time a `ManifoldConfig` exists, every value is literal.

use crate::error::ManifoldError;
use serde::Deserialize;
use std::collections::HashMap;

/// Top-level Manifold configuration, parsed from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifoldConfig {
    /// Managed downstream servers, keyed by server name.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Configuration for a single managed MCP server.
///
/// `kind` is optional: a `url` implies a streamable-HTTP server, a `command`
/// implies a stdio subprocess. Unrecognized kinds fall back to stdio when a
/// command is present (see `transport::resolve_kind`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Transport kind: "stdio", "http", "sse", or "websocket".
    pub kind: Option<String>,
    // stdio fields
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-server environment overrides, merged over the host environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    // http / sse / websocket fields
    pub url: Option<String>,
    /// Extra headers sent on every downstream request (http/sse) or on the
    /// WebSocket handshake.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Session lifecycle tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle seconds before the reaper evicts a session.
    #[serde(default = "default_session_ttl_secs")]
    pub ttl_secs: u64,
    /// Reaper wakeup interval.
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
    /// Hard cap on live sessions; the least-recently-used is evicted on overflow.
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Audit capture tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    /// Cap on the mirrored copy of each body kept for the audit sink.
    /// The pass-through itself is never truncated.
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,
    /// Cap on a fully drained inbound request body; larger requests are
    /// rejected with 413 before any downstream work.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_capture_bytes: default_max_capture_bytes(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// Downstream timeout tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// MCP handshake timeout per downstream connection.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Per-call timeout for tool calls, resource reads, and prompt fetches.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_session_ttl_secs() -> u64 {
    900
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_max_sessions() -> usize {
    1024
}

fn default_max_capture_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_max_request_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_handshake_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl ManifoldConfig {
    /// Validate the config, failing fast on misconfigurations before any
    /// downstream connection is attempted.
    pub fn validate(&self) -> crate::Result<()> {
        for (name, config) in &self.servers {
            // Server names appear in URL paths and audit records.
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
            {
                return Err(ManifoldError::InvalidConfig(
                    name.clone(),
                    "server name must be non-empty alphanumeric with hyphens or underscores"
                        .to_string(),
                ));
            }

            crate::transport::resolve_kind(name, config)?;
        }

        if self.session.ttl_secs == 0 {
            return Err(ManifoldError::InvalidConfig(
                "session".to_string(),
                "ttl_secs must be > 0".to_string(),
            ));
        }
        if self.session.max_sessions == 0 {
            return Err(ManifoldError::InvalidConfig(
                "session".to_string(),
                "max_sessions must be > 0".to_string(),
            ));
        }
        if self.audit.max_capture_bytes == 0 {
            return Err(ManifoldError::InvalidConfig(
                "audit".to_string(),
                "max_capture_bytes must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_toml(toml_str: &str) -> ManifoldConfig {
        toml::from_str(toml_str).expect("valid TOML")
    }

    #[test]
    fn test_valid_stdio_config() {
        let config = parse_toml(
            r#"
            [servers.github]
            kind = "stdio"
            command = "gh-mcp"
            args = ["--verbose"]
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_valid_http_config_with_headers() {
        let config = parse_toml(
            r#"
            [servers.myapi]
            kind = "http"
            url = "https://api.example.com/mcp"

            [servers.myapi.headers]
            Authorization = "Bearer token"
            "#,
        );
        assert!(config.validate().is_ok());
        let server = config.servers.get("myapi").unwrap();
        assert_eq!(server.headers.get("Authorization").unwrap(), "Bearer token");
    }

    #[test]
    fn test_kind_inferred_from_url() {
        let config = parse_toml(
            r#"
            [servers.remote]
            url = "https://api.example.com/mcp"
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_kind_inferred_from_command() {
        let config = parse_toml(
            r#"
            [servers.local]
            command = "local-mcp"
            "#,
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_stdio_missing_command() {
        let config = parse_toml(
            r#"
            [servers.gh]
            kind = "stdio"
            "#,
        );
        let result = config.validate();
        assert!(
            matches!(result, Err(ManifoldError::InvalidConfig(name, msg)) if name == "gh" && msg.contains("command is required"))
        );
    }

    #[test]
    fn test_invalid_server_name() {
        let config = parse_toml(
            r#"
            [servers."bad name"]
            command = "mcp"
            "#,
        );
        let result = config.validate();
        assert!(matches!(result, Err(ManifoldError::InvalidConfig(_, _))));
    }

    #[test]
    fn test_session_defaults() {
        let config = parse_toml("");
        assert_eq!(config.session.ttl_secs, 900);
        assert_eq!(config.session.reap_interval_secs, 60);
        assert_eq!(config.session.max_sessions, 1024);
    }

    #[test]
    fn test_audit_defaults() {
        let config = parse_toml("");
        assert_eq!(config.audit.max_capture_bytes, 2 * 1024 * 1024);
        assert_eq!(config.audit.max_request_bytes, 8 * 1024 * 1024);
    }

    #[test]
    fn test_timeout_overrides() {
        let config = parse_toml(
            r#"
            [timeouts]
            handshake_timeout_secs = 5
            call_timeout_secs = 10
            "#,
        );
        assert_eq!(config.timeouts.handshake_timeout_secs, 5);
        assert_eq!(config.timeouts.call_timeout_secs, 10);
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = parse_toml(
            r#"
            [session]
            ttl_secs = 0
            "#,
        );
        assert!(config.validate().is_err());
    }
}
