//! Discovery orchestration across all configured downstream servers.
//!
//! Bootstraps every server concurrently with no ordering dependency. Policy
//! is all-or-nothing: one server's failure fails the whole discovery and the
//! gateway does not start with a partial server set. The aggregate error
//! carries every sub-error for diagnostics.

use std::sync::Arc;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::config::ManifoldConfig;
use crate::downstream::{bootstrap, DownstreamServer};
use crate::error::ManifoldError;

/// Bootstrap all configured servers concurrently.
///
/// Validates the config first — nothing is spawned for an invalid config.
/// Returns the full set of connected servers, or an aggregate
/// `ManifoldError::Discovery` carrying each server's bootstrap failure.
pub async fn discover(
    config: &ManifoldConfig,
    cancel: &CancellationToken,
) -> crate::Result<Vec<Arc<DownstreamServer>>> {
    config.validate()?;

    let futures = config.servers.iter().map(|(name, server_config)| {
        let child_token = cancel.child_token();
        async move {
            tracing::info!(server = %name, "bootstrapping downstream server");
            bootstrap(name, server_config, &config.timeouts, child_token).await
        }
    });

    let results = join_all(futures).await;

    let mut servers = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(server) => servers.push(Arc::new(server)),
            Err(e) => failures.push(e),
        }
    }

    if !failures.is_empty() {
        // All-or-nothing: tear down the servers that did connect.
        for server in &servers {
            server.close().await;
        }
        cancel.cancel();
        return Err(ManifoldError::Discovery(failures));
    }

    tracing::info!(count = servers.len(), "discovery complete");
    Ok(servers)
}
