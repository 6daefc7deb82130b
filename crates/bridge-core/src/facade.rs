//! Downstream-facing MCP server handlers, delegating to the supervisor's
//! aggregated views and the router.

use std::collections::HashSet;
use std::sync::Arc;

use bridge_config::{BridgeSettings, CapabilityKind};
use rmcp::model::{
    CallToolRequestParam, CallToolResult, CompleteRequestParam, CompleteResult, CompletionInfo,
    Content, ErrorData as McpError, GetPromptRequestParam, GetPromptResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, LoggingLevel,
    PaginatedRequestParam, Prompt, PromptMessage, PromptMessageRole, ProgressNotificationParam,
    ReadResourceRequestParam, ReadResourceResult, Resource, ResourceContents, ServerCapabilities,
    ServerInfo, SetLevelRequestParam, SubscribeRequestParam, Tool, UnsubscribeRequestParam,
};
use rmcp::service::{NotificationContext, RequestContext};
use rmcp::{RoleServer, ServerHandler};

use crate::aggregate::{self, CapabilitySource};
use crate::error::{RouteError, UpstreamError};
use crate::router::{self, RouteCandidate, RouteTarget};
use crate::supervisor::{Supervisor, UpstreamSnapshot};

/// How a tag filter combines its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagMode {
    /// Upstreams must carry every filter tag.
    Intersection,
    /// Upstreams must carry at least one filter tag.
    Union,
}

/// Restricts a facade to upstreams matching a tag expression.
#[derive(Debug, Clone)]
pub struct TagFilter {
    tags: Vec<String>,
    mode: TagMode,
}

impl TagFilter {
    pub fn new(tags: Vec<String>, mode: TagMode) -> Self {
        Self { tags, mode }
    }

    /// Untagged upstreams never match a tag filter.
    pub fn matches(&self, upstream_tags: &[String]) -> bool {
        if upstream_tags.is_empty() {
            return false;
        }
        match self.mode {
            TagMode::Intersection => self
                .tags
                .iter()
                .all(|tag| upstream_tags.contains(tag)),
            TagMode::Union => self.tags.iter().any(|tag| upstream_tags.contains(tag)),
        }
    }
}

/// Callback used to retune the bridge's own log filter on `logging/setLevel`.
pub type LogLevelHook = Arc<dyn Fn(LoggingLevel) + Send + Sync>;

/// The MCP server the downstream client talks to.
#[derive(Clone)]
pub struct BridgeFacade {
    supervisor: Arc<Supervisor>,
    tag_filter: Option<TagFilter>,
    log_level_hook: Option<LogLevelHook>,
}

impl BridgeFacade {
    pub fn new(supervisor: Arc<Supervisor>) -> Self {
        Self {
            supervisor,
            tag_filter: None,
            log_level_hook: None,
        }
    }

    /// Variant that only exposes enabled upstreams matching the tag filter.
    pub fn with_tag_filter(supervisor: Arc<Supervisor>, filter: TagFilter) -> Self {
        Self {
            supervisor,
            tag_filter: Some(filter),
            log_level_hook: None,
        }
    }

    pub fn with_log_level_hook(mut self, hook: LogLevelHook) -> Self {
        self.log_level_hook = Some(hook);
        self
    }

    async fn snapshots(&self) -> Vec<UpstreamSnapshot> {
        let mut snapshots = self.supervisor.connected_snapshots().await;
        if let Some(filter) = &self.tag_filter {
            snapshots.retain(|snapshot| {
                snapshot.config.enabled && filter.matches(&snapshot.config.tags)
            });
        }
        snapshots
    }

    fn settings(&self) -> &BridgeSettings {
        self.supervisor.settings()
    }

    pub(crate) async fn list_tools_internal(&self) -> Vec<Tool> {
        let settings = self.settings();
        if !settings.aggregation.tools {
            return Vec::new();
        }
        let snapshots = self.snapshots().await;
        let sources: Vec<CapabilitySource<Tool>> = snapshots
            .iter()
            .map(|snapshot| CapabilitySource {
                upstream: snapshot.name.clone(),
                namespace: snapshot.config.effective_namespace(
                    CapabilityKind::Tools,
                    settings,
                    &snapshot.name,
                ),
                items: snapshot.tools.clone(),
            })
            .collect();
        match aggregate::aggregate(sources, settings.conflict_resolution, "tool", false) {
            Ok(tools) => tools,
            Err(error) => {
                tracing::error!(error = %error, "tool aggregation failed");
                Vec::new()
            }
        }
    }

    pub(crate) async fn list_resources_internal(&self) -> Vec<Resource> {
        let settings = self.settings();
        if !settings.aggregation.resources {
            return Vec::new();
        }
        let snapshots = self.snapshots().await;
        let sources: Vec<CapabilitySource<Resource>> = snapshots
            .iter()
            .map(|snapshot| CapabilitySource {
                upstream: snapshot.name.clone(),
                namespace: snapshot.config.effective_namespace(
                    CapabilityKind::Resources,
                    settings,
                    &snapshot.name,
                ),
                items: snapshot.resources.clone(),
            })
            .collect();
        match aggregate::aggregate(sources, settings.conflict_resolution, "resource", true) {
            Ok(resources) => resources,
            Err(error) => {
                tracing::error!(error = %error, "resource aggregation failed");
                Vec::new()
            }
        }
    }

    pub(crate) async fn list_prompts_internal(&self) -> Vec<Prompt> {
        let settings = self.settings();
        if !settings.aggregation.prompts {
            return Vec::new();
        }
        let snapshots = self.snapshots().await;
        let sources: Vec<CapabilitySource<Prompt>> = snapshots
            .iter()
            .map(|snapshot| CapabilitySource {
                upstream: snapshot.name.clone(),
                namespace: snapshot.config.effective_namespace(
                    CapabilityKind::Prompts,
                    settings,
                    &snapshot.name,
                ),
                items: snapshot.prompts.clone(),
            })
            .collect();
        match aggregate::aggregate(sources, settings.conflict_resolution, "prompt", false) {
            Ok(prompts) => prompts,
            Err(error) => {
                tracing::error!(error = %error, "prompt aggregation failed");
                Vec::new()
            }
        }
    }

    fn route_candidates(
        snapshots: &[UpstreamSnapshot],
        kind: CapabilityKind,
        settings: &BridgeSettings,
    ) -> Vec<RouteCandidate> {
        snapshots
            .iter()
            .map(|snapshot| RouteCandidate {
                upstream: snapshot.name.clone(),
                namespace: snapshot
                    .config
                    .effective_namespace(kind, settings, &snapshot.name),
                idents: match kind {
                    CapabilityKind::Tools => snapshot
                        .tools
                        .iter()
                        .map(|tool| tool.name.to_string())
                        .collect(),
                    CapabilityKind::Resources => snapshot
                        .resources
                        .iter()
                        .map(|resource| resource.uri.clone())
                        .collect(),
                    CapabilityKind::Prompts => snapshot
                        .prompts
                        .iter()
                        .map(|prompt| prompt.name.clone())
                        .collect(),
                },
            })
            .collect()
    }

    fn session_for<'a>(
        snapshots: &'a [UpstreamSnapshot],
        target: &RouteTarget,
    ) -> Option<&'a UpstreamSnapshot> {
        snapshots
            .iter()
            .find(|snapshot| snapshot.name == target.upstream)
    }

    pub(crate) async fn call_tool_internal(
        &self,
        request: CallToolRequestParam,
    ) -> Result<CallToolResult, McpError> {
        let snapshots = self.snapshots().await;
        let candidates =
            Self::route_candidates(&snapshots, CapabilityKind::Tools, self.settings());
        let Some(target) = router::resolve(request.name.as_ref(), &candidates) else {
            let error = RouteError::NotFound {
                kind: "tool",
                identifier: request.name.to_string(),
            };
            return Err(McpError::invalid_params(error.to_string(), None));
        };
        let Some(snapshot) = Self::session_for(&snapshots, &target) else {
            return Err(McpError::internal_error(
                format!("routed upstream '{}' vanished", target.upstream),
                None,
            ));
        };

        match snapshot
            .session
            .call_tool(&target.local, request.arguments)
            .await
        {
            Ok(result) => Ok(result),
            Err(UpstreamError::Mcp(data)) => {
                tracing::warn!(
                    upstream = %target.upstream,
                    tool = %target.local,
                    code = data.code.0,
                    "upstream returned MCP error"
                );
                Err(data)
            }
            Err(error) => {
                tracing::error!(
                    upstream = %target.upstream,
                    tool = %target.local,
                    error = %error,
                    "tool call failed"
                );
                Ok(CallToolResult::success(vec![Content::text(format!(
                    "error calling tool '{}' on upstream '{}': {error}",
                    target.local, target.upstream
                ))]))
            }
        }
    }

    pub(crate) async fn read_resource_internal(
        &self,
        uri: &str,
    ) -> Result<ReadResourceResult, McpError> {
        let snapshots = self.snapshots().await;
        let candidates =
            Self::route_candidates(&snapshots, CapabilityKind::Resources, self.settings());
        let Some(target) = router::resolve_resource(uri, &candidates) else {
            let error = RouteError::NotFound {
                kind: "resource",
                identifier: uri.to_string(),
            };
            return Err(McpError::resource_not_found(error.to_string(), None));
        };
        let Some(snapshot) = Self::session_for(&snapshots, &target) else {
            return Err(McpError::internal_error(
                format!("routed upstream '{}' vanished", target.upstream),
                None,
            ));
        };

        match snapshot.session.read_resource(&target.local).await {
            Ok(result) => Ok(result),
            Err(UpstreamError::Mcp(data)) => {
                tracing::warn!(
                    upstream = %target.upstream,
                    uri = %target.local,
                    code = data.code.0,
                    "upstream returned MCP error"
                );
                Err(data)
            }
            Err(error) => {
                tracing::error!(
                    upstream = %target.upstream,
                    uri = %target.local,
                    error = %error,
                    "resource read failed"
                );
                Ok(ReadResourceResult::new(vec![ResourceContents::text(
                    format!(
                        "error reading resource '{}' on upstream '{}': {error}",
                        target.local, target.upstream
                    ),
                    uri,
                )]))
            }
        }
    }

    pub(crate) async fn get_prompt_internal(
        &self,
        request: GetPromptRequestParam,
    ) -> Result<GetPromptResult, McpError> {
        let snapshots = self.snapshots().await;
        let candidates =
            Self::route_candidates(&snapshots, CapabilityKind::Prompts, self.settings());
        let Some(target) = router::resolve(&request.name, &candidates) else {
            let error = RouteError::NotFound {
                kind: "prompt",
                identifier: request.name.clone(),
            };
            return Err(McpError::invalid_params(error.to_string(), None));
        };
        let Some(snapshot) = Self::session_for(&snapshots, &target) else {
            return Err(McpError::internal_error(
                format!("routed upstream '{}' vanished", target.upstream),
                None,
            ));
        };

        match snapshot
            .session
            .get_prompt(&target.local, request.arguments)
            .await
        {
            Ok(result) => Ok(result),
            Err(UpstreamError::Mcp(data)) => {
                tracing::warn!(
                    upstream = %target.upstream,
                    prompt = %target.local,
                    code = data.code.0,
                    "upstream returned MCP error"
                );
                Err(data)
            }
            Err(error) => {
                tracing::error!(
                    upstream = %target.upstream,
                    prompt = %target.local,
                    error = %error,
                    "prompt retrieval failed"
                );
                Ok(GetPromptResult::new(vec![PromptMessage::new_text(
                    PromptMessageRole::User,
                    format!("error occurred while retrieving prompt: {error}"),
                )])
                .with_description(format!("error retrieving prompt '{}'", target.local)))
            }
        }
    }

    pub(crate) async fn subscribe_internal(&self, uri: &str) {
        let snapshots = self.snapshots().await;
        let candidates =
            Self::route_candidates(&snapshots, CapabilityKind::Resources, self.settings());
        let targets = router::resolve_subscription_targets(uri, &candidates);
        if targets.is_empty() {
            tracing::warn!(uri = %uri, "no upstream found for subscription");
            return;
        }
        for target in targets {
            if let Some(snapshot) = Self::session_for(&snapshots, &target) {
                snapshot.session.subscribe_resource(&target.local).await;
            }
        }
    }

    pub(crate) async fn unsubscribe_internal(&self, uri: &str) {
        let snapshots = self.snapshots().await;
        let candidates =
            Self::route_candidates(&snapshots, CapabilityKind::Resources, self.settings());
        let targets = router::resolve_subscription_targets(uri, &candidates);
        if targets.is_empty() {
            tracing::warn!(uri = %uri, "no upstream found for unsubscription");
            return;
        }
        for target in targets {
            if let Some(snapshot) = Self::session_for(&snapshots, &target) {
                snapshot.session.unsubscribe_resource(&target.local).await;
            }
        }
    }

    pub(crate) async fn set_level_internal(&self, level: LoggingLevel) {
        if let Some(hook) = &self.log_level_hook {
            hook(level.clone());
        }

        let mut forwarded = 0usize;
        for snapshot in self.snapshots().await {
            match snapshot
                .session
                .set_log_level(SetLevelRequestParam::new(level.clone()))
                .await
            {
                Ok(()) => forwarded += 1,
                Err(error) => {
                    tracing::warn!(
                        upstream = %snapshot.name,
                        error = %error,
                        "failed to forward log level"
                    );
                }
            }
        }
        tracing::info!(level = ?level, forwarded, "set logging level");
    }

    pub(crate) async fn complete_internal(&self, request: CompleteRequestParam) -> CompleteResult {
        let mut values = Vec::new();
        for snapshot in self.snapshots().await {
            match snapshot.session.complete(request.clone()).await {
                Ok(result) => values.extend(result.completion.values),
                Err(error) => {
                    tracing::warn!(
                        upstream = %snapshot.name,
                        error = %error,
                        "completion request failed"
                    );
                }
            }
        }
        let values = dedup_preserving_order(values);
        tracing::debug!(count = values.len(), "aggregated completions");
        CompleteResult::new(CompletionInfo {
            values,
            total: None,
            has_more: None,
        })
    }
}

/// Drop duplicate completion values, keeping the first occurrence.
pub(crate) fn dedup_preserving_order(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}

impl ServerHandler for BridgeFacade {
    fn get_info(&self) -> ServerInfo {
        let settings = self.settings();
        let mut capabilities = ServerCapabilities::default();
        if settings.aggregation.tools {
            capabilities.tools = Some(Default::default());
        }
        if settings.aggregation.resources {
            capabilities.resources = Some(Default::default());
        }
        if settings.aggregation.prompts {
            capabilities.prompts = Some(Default::default());
        }
        capabilities.logging = Some(Default::default());
        capabilities.completions = Some(Default::default());

        let mut info = ServerInfo::default();
        info.server_info.name = "mcp-bridge".to_string();
        info.server_info.version = env!("CARGO_PKG_VERSION").to_string();
        info.capabilities = capabilities;
        info.instructions = Some(
            "Aggregating bridge across multiple MCP servers; namespaced identifiers \
             use '<upstream>__<name>'."
                .to_string(),
        );
        info
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(
            self.list_tools_internal().await,
        ))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.call_tool_internal(request).await
    }

    async fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourcesResult, McpError> {
        Ok(ListResourcesResult::with_all_items(
            self.list_resources_internal().await,
        ))
    }

    async fn list_resource_templates(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        // Templates are not aggregated in this revision.
        Ok(ListResourceTemplatesResult::with_all_items(Vec::new()))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        self.read_resource_internal(&request.uri).await
    }

    async fn subscribe(
        &self,
        request: SubscribeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        self.subscribe_internal(&request.uri).await;
        Ok(())
    }

    async fn unsubscribe(
        &self,
        request: UnsubscribeRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        self.unsubscribe_internal(&request.uri).await;
        Ok(())
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, McpError> {
        Ok(ListPromptsResult::with_all_items(
            self.list_prompts_internal().await,
        ))
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        self.get_prompt_internal(request).await
    }

    async fn set_level(
        &self,
        request: SetLevelRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<(), McpError> {
        self.set_level_internal(request.level).await;
        Ok(())
    }

    async fn complete(
        &self,
        request: CompleteRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CompleteResult, McpError> {
        Ok(self.complete_internal(request).await)
    }

    async fn on_progress(
        &self,
        notification: ProgressNotificationParam,
        _context: NotificationContext<RoleServer>,
    ) {
        // The rmcp layer routes progress to where it needs to go; the bridge
        // only records it.
        tracing::info!(
            token = ?notification.progress_token,
            progress = ?notification.progress,
            total = ?notification.total,
            "progress notification"
        );
    }
}

#[cfg(test)]
#[path = "facade_tests.rs"]
mod tests;
