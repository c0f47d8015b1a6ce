//! Error types for Manifold gateway operations.

use thiserror::Error;

/// Which capability collection a routing lookup or list call targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Tool,
    Resource,
    Prompt,
}

impl std::fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogKind::Tool => write!(f, "tool"),
            CatalogKind::Resource => write!(f, "resource"),
            CatalogKind::Prompt => write!(f, "prompt"),
        }
    }
}

/// Main error type for Manifold operations.
///
/// One variant per failure kind; aggregates carry their sub-errors so a
/// multi-server startup failure reports every cause at once.
#[derive(Error, Debug)]
pub enum ManifoldError {
    /// Invalid configuration for a named server
    #[error("invalid config for server '{0}': {1}")]
    InvalidConfig(String, String),

    /// Cannot construct a downstream transport for a named server
    #[error("transport error for server '{0}': {1}")]
    Transport(String, String),

    /// Cannot connect or handshake with a named server
    #[error("client error for server '{0}': {1}")]
    Client(String, String),

    /// One capability-list call failed during bootstrap
    #[error("capability '{capability}' failed for server '{server}': {message}")]
    Capability {
        server: String,
        capability: &'static str,
        message: String,
    },

    /// Aggregate: one server's full bootstrap failure
    #[error("bootstrap failed for server '{server}': {}", format_sources(.sources))]
    Bootstrap {
        server: String,
        sources: Vec<ManifoldError>,
    },

    /// Aggregate: discovery failed across servers (all-or-nothing policy)
    #[error("discovery failed for {} server(s): {}", .0.len(), format_sources(.0))]
    Discovery(Vec<ManifoldError>),

    /// Routing miss for a tool/resource/prompt name
    #[error("{kind} '{item}' not found for server '{server}'")]
    NotFound {
        server: String,
        kind: CatalogKind,
        item: String,
    },

    /// MCP protocol error from a named server on a forwarded call
    #[error("protocol error for server '{0}': {1}")]
    Protocol(String, String),

    /// Call to a named server timed out
    #[error("call timeout for server '{0}'")]
    CallTimeout(String),

    /// Audit sink rejected or failed a packet report
    #[error("audit sink error: {0}")]
    Audit(String),

    /// Gateway is shutting down — no transport available
    #[error("gateway is shutting down")]
    ShuttingDown,
}

fn format_sources(sources: &[ManifoldError]) -> String {
    sources
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias for Manifold operations
pub type Result<T> = std::result::Result<T, ManifoldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_display() {
        let err = ManifoldError::InvalidConfig(
            "gh".to_string(),
            "command is required for stdio transport".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid config for server 'gh': command is required for stdio transport"
        );
    }

    #[test]
    fn test_not_found_display() {
        let err = ManifoldError::NotFound {
            server: "gh".to_string(),
            kind: CatalogKind::Tool,
            item: "list_repos".to_string(),
        };
        assert_eq!(err.to_string(), "tool 'list_repos' not found for server 'gh'");
    }

    #[test]
    fn test_bootstrap_aggregate_carries_all_sources() {
        let err = ManifoldError::Bootstrap {
            server: "gh".to_string(),
            sources: vec![
                ManifoldError::Capability {
                    server: "gh".to_string(),
                    capability: "tools",
                    message: "connection reset".to_string(),
                },
                ManifoldError::Capability {
                    server: "gh".to_string(),
                    capability: "prompts",
                    message: "connection reset".to_string(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("capability 'tools'"));
        assert!(text.contains("capability 'prompts'"));
    }

    #[test]
    fn test_discovery_aggregate_counts_servers() {
        let err = ManifoldError::Discovery(vec![
            ManifoldError::Client("a".into(), "refused".into()),
            ManifoldError::Client("b".into(), "refused".into()),
        ]);
        assert!(err.to_string().starts_with("discovery failed for 2 server(s)"));
    }

    #[test]
    fn test_call_timeout_display() {
        let err = ManifoldError::CallTimeout("gh".to_string());
        assert_eq!(err.to_string(), "call timeout for server 'gh'");
    }
}
