//! Routing catalog — the namespaced table mapping (server, item, action) to
//! a dispatch handle.
//!
//! Built exactly once from discovery results and never refreshed; after
//! construction it is read-only and safe to share behind an `Arc`. The first
//! registration for a server name wins; later duplicates are dropped with a
//! warning.

use std::collections::HashMap;
use std::sync::Arc;

use rmcp::model::{CallToolResult, GetPromptResult, Prompt, ReadResourceResult, Resource, Tool};

use crate::downstream::DownstreamHandle;
use crate::error::CatalogKind;

/// Protocol operations the catalog can resolve.
///
/// The `Get*` listing actions and their invocation counterparts resolve
/// through the same map: looking up a tool for `CallTool` or for `GetTools`
/// yields the identical dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogAction {
    GetTools,
    GetResources,
    GetPrompts,
    CallTool,
    ReadResource,
    GetPrompt,
}

impl CatalogAction {
    /// The capability collection this action routes through.
    pub fn kind(self) -> CatalogKind {
        match self {
            CatalogAction::GetTools | CatalogAction::CallTool => CatalogKind::Tool,
            CatalogAction::GetResources | CatalogAction::ReadResource => CatalogKind::Resource,
            CatalogAction::GetPrompts | CatalogAction::GetPrompt => CatalogKind::Prompt,
        }
    }
}

/// A resolved routing target: the downstream handle plus the item it serves.
#[derive(Clone)]
pub struct Dispatch {
    handle: Arc<dyn DownstreamHandle>,
    kind: CatalogKind,
    item: String,
}

impl Dispatch {
    pub fn server(&self) -> &str {
        self.handle.name()
    }

    pub fn item(&self) -> &str {
        &self.item
    }

    pub fn kind(&self) -> CatalogKind {
        self.kind
    }

    /// The underlying handle, exposed for identity assertions in tests.
    pub fn handle(&self) -> &Arc<dyn DownstreamHandle> {
        &self.handle
    }

    pub async fn call_tool(
        &self,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> crate::Result<CallToolResult> {
        self.handle.call_tool(&self.item, arguments).await
    }

    pub async fn read_resource(&self) -> crate::Result<ReadResourceResult> {
        self.handle.read_resource(&self.item).await
    }

    pub async fn get_prompt(
        &self,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> crate::Result<GetPromptResult> {
        self.handle.get_prompt(&self.item, arguments).await
    }
}

struct CatalogEntry {
    tools: HashMap<String, Dispatch>,
    resources: HashMap<String, Dispatch>,
    prompts: HashMap<String, Dispatch>,
    tool_listing: Vec<Tool>,
    resource_listing: Vec<Resource>,
    prompt_listing: Vec<Prompt>,
}

impl CatalogEntry {
    fn from_handle(handle: Arc<dyn DownstreamHandle>) -> Self {
        let dispatch = |kind: CatalogKind, item: &str| Dispatch {
            handle: handle.clone(),
            kind,
            item: item.to_string(),
        };

        let tool_listing = handle.tools().to_vec();
        let resource_listing = handle.resources().to_vec();
        let prompt_listing = handle.prompts().to_vec();

        let tools = tool_listing
            .iter()
            .map(|t| (t.name.to_string(), dispatch(CatalogKind::Tool, &t.name)))
            .collect();
        // Resources are keyed by URI — that is the identifier clients read by.
        let resources = resource_listing
            .iter()
            .map(|r| (r.uri.to_string(), dispatch(CatalogKind::Resource, &r.uri)))
            .collect();
        let prompts = prompt_listing
            .iter()
            .map(|p| (p.name.to_string(), dispatch(CatalogKind::Prompt, &p.name)))
            .collect();

        CatalogEntry {
            tools,
            resources,
            prompts,
            tool_listing,
            resource_listing,
            prompt_listing,
        }
    }

    fn map_for(&self, kind: CatalogKind) -> &HashMap<String, Dispatch> {
        match kind {
            CatalogKind::Tool => &self.tools,
            CatalogKind::Resource => &self.resources,
            CatalogKind::Prompt => &self.prompts,
        }
    }
}

/// Read-mostly routing table over all discovered downstream servers.
pub struct RoutingCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl RoutingCatalog {
    /// Build the catalog from discovered handles. One-shot: the catalog is
    /// never refreshed if downstream capabilities change later.
    pub fn build(handles: Vec<Arc<dyn DownstreamHandle>>) -> Self {
        let mut entries: HashMap<String, CatalogEntry> = HashMap::new();
        for handle in handles {
            let name = handle.name().to_string();
            if entries.contains_key(&name) {
                // First registration wins.
                tracing::warn!(
                    server = %name,
                    "duplicate server name at catalog build, ignoring later registration"
                );
                continue;
            }
            entries.insert(name, CatalogEntry::from_handle(handle));
        }
        RoutingCatalog { entries }
    }

    /// Resolve a dispatch for (server, item, action), or None if either the
    /// server or the item is unknown.
    pub fn lookup(&self, server: &str, item: &str, action: CatalogAction) -> Option<Dispatch> {
        self.entries
            .get(server)?
            .map_for(action.kind())
            .get(item)
            .cloned()
    }

    /// Retained tool listing for a server; empty for unknown servers.
    pub fn list_tools(&self, server: &str) -> &[Tool] {
        self.entries
            .get(server)
            .map(|e| e.tool_listing.as_slice())
            .unwrap_or(&[])
    }

    /// Retained resource listing for a server; empty for unknown servers.
    pub fn list_resources(&self, server: &str) -> &[Resource] {
        self.entries
            .get(server)
            .map(|e| e.resource_listing.as_slice())
            .unwrap_or(&[])
    }

    /// Retained prompt listing for a server; empty for unknown servers.
    pub fn list_prompts(&self, server: &str) -> &[Prompt] {
        self.entries
            .get(server)
            .map(|e| e.prompt_listing.as_slice())
            .unwrap_or(&[])
    }

    /// Sorted list of registered server names.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains_server(&self, server: &str) -> bool {
        self.entries.contains_key(server)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MockDownstream;
    use super::*;

    fn catalog_with(handles: Vec<MockDownstream>) -> RoutingCatalog {
        RoutingCatalog::build(
            handles
                .into_iter()
                .map(|h| Arc::new(h) as Arc<dyn DownstreamHandle>)
                .collect(),
        )
    }

    #[test]
    fn test_lookup_known_tool() {
        let catalog = catalog_with(vec![MockDownstream::new("gh").with_tool("list_repos")]);
        let dispatch = catalog
            .lookup("gh", "list_repos", CatalogAction::CallTool)
            .unwrap();
        assert_eq!(dispatch.server(), "gh");
        assert_eq!(dispatch.item(), "list_repos");
        assert_eq!(dispatch.kind(), CatalogKind::Tool);
    }

    #[test]
    fn test_lookup_alias_equivalence() {
        // getTools and callTool must resolve through the same map to the
        // same target for any registered tool.
        let catalog = catalog_with(vec![MockDownstream::new("gh").with_tool("list_repos")]);

        let via_call = catalog
            .lookup("gh", "list_repos", CatalogAction::CallTool)
            .unwrap();
        let via_get = catalog
            .lookup("gh", "list_repos", CatalogAction::GetTools)
            .unwrap();

        assert!(Arc::ptr_eq(via_call.handle(), via_get.handle()));
        assert_eq!(via_call.item(), via_get.item());
        assert_eq!(via_call.kind(), via_get.kind());
    }

    #[test]
    fn test_lookup_unknown_server_is_none() {
        let catalog = catalog_with(vec![MockDownstream::new("gh").with_tool("list_repos")]);
        assert!(catalog
            .lookup("nope", "list_repos", CatalogAction::CallTool)
            .is_none());
    }

    #[test]
    fn test_lookup_unknown_item_is_none() {
        let catalog = catalog_with(vec![MockDownstream::new("gh").with_tool("list_repos")]);
        assert!(catalog
            .lookup("gh", "delete_everything", CatalogAction::CallTool)
            .is_none());
    }

    #[test]
    fn test_lookup_does_not_cross_collections() {
        let catalog = catalog_with(vec![MockDownstream::new("gh").with_tool("list_repos")]);
        // A tool name is not reachable through the prompt or resource maps.
        assert!(catalog
            .lookup("gh", "list_repos", CatalogAction::GetPrompt)
            .is_none());
        assert!(catalog
            .lookup("gh", "list_repos", CatalogAction::ReadResource)
            .is_none());
    }

    #[test]
    fn test_duplicate_server_name_first_registration_wins() {
        let first = MockDownstream::new("dup").with_tool("from_first");
        let second = MockDownstream::new("dup").with_tool("from_second");
        let catalog = catalog_with(vec![first, second]);

        assert!(catalog
            .lookup("dup", "from_first", CatalogAction::CallTool)
            .is_some());
        assert!(
            catalog
                .lookup("dup", "from_second", CatalogAction::CallTool)
                .is_none(),
            "second registration for the same name must be ignored"
        );
        assert_eq!(catalog.list_tools("dup").len(), 1);
    }

    #[test]
    fn test_list_unknown_server_is_empty() {
        let catalog = catalog_with(vec![]);
        assert!(catalog.list_tools("ghost").is_empty());
        assert!(catalog.list_resources("ghost").is_empty());
        assert!(catalog.list_prompts("ghost").is_empty());
    }

    #[test]
    fn test_listings_retained_per_collection() {
        let catalog = catalog_with(vec![MockDownstream::new("gh")
            .with_tool("list_repos")
            .with_resource("repo://gh/readme")
            .with_prompt("summarize")]);

        assert_eq!(catalog.list_tools("gh").len(), 1);
        assert_eq!(catalog.list_resources("gh").len(), 1);
        assert_eq!(catalog.list_prompts("gh").len(), 1);
        assert!(catalog
            .lookup("gh", "repo://gh/readme", CatalogAction::ReadResource)
            .is_some());
        assert!(catalog
            .lookup("gh", "summarize", CatalogAction::GetPrompt)
            .is_some());
    }

    #[test]
    fn test_server_names_sorted() {
        let catalog = catalog_with(vec![
            MockDownstream::new("zeta"),
            MockDownstream::new("alpha"),
        ]);
        assert_eq!(catalog.server_names(), vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_dispatch_invokes_bound_item() {
        let mock = Arc::new(MockDownstream::new("gh").with_tool("list_repos"));
        let catalog = RoutingCatalog::build(vec![mock.clone() as Arc<dyn DownstreamHandle>]);

        let dispatch = catalog
            .lookup("gh", "list_repos", CatalogAction::CallTool)
            .unwrap();
        dispatch.call_tool(None).await.unwrap();

        assert_eq!(
            *mock.calls.lock().unwrap(),
            vec!["call_tool:list_repos".to_string()]
        );
    }
}
