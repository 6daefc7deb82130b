//! One managed upstream: a child MCP server over stdio and its client
//! session.

use std::process::Stdio;
use std::time::SystemTime;

use anyhow::{Context, Result, anyhow};
use bridge_config::{HealthCheckConfig, McpLogLevel, UpstreamConfig};
use rmcp::RoleClient;
use rmcp::ServiceExt;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, CompleteRequestParam, CompleteResult,
    GetPromptRequestParam, GetPromptResult, Prompt, ReadResourceRequestParam, ReadResourceResult,
    Resource, ServerCapabilities, SetLevelRequestParam, SubscribeRequestParam, Tool,
    UnsubscribeRequestParam,
};
use rmcp::service::RunningService;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::UpstreamError;
use crate::notify::UpstreamEvents;

const CHILD_EXIT_GRACE_SECS: u64 = 3;

/// Lifecycle state of a managed upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Disabled,
}

/// Health bookkeeping; mutated only through [`UpstreamSession`] methods so
/// updates stay serialized per upstream.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: UpstreamStatus,
    pub last_seen: Option<SystemTime>,
    pub last_keep_alive: SystemTime,
    pub last_restart: Option<SystemTime>,
    pub failure_count: u32,
    pub consecutive_failures: u32,
    pub keep_alive_failures: u32,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub capabilities: Option<ServerCapabilities>,
}

impl HealthSnapshot {
    fn new() -> Self {
        Self {
            status: UpstreamStatus::Connecting,
            last_seen: None,
            last_keep_alive: SystemTime::now(),
            last_restart: None,
            failure_count: 0,
            consecutive_failures: 0,
            keep_alive_failures: 0,
            restart_count: 0,
            last_error: None,
            capabilities: None,
        }
    }
}

struct ActiveConnection {
    service: RunningService<RoleClient, UpstreamEvents>,
    child: Child,
    stderr_task: JoinHandle<()>,
}

impl ActiveConnection {
    async fn shutdown(self, upstream: &str) {
        let ActiveConnection {
            service,
            mut child,
            stderr_task,
        } = self;

        if let Err(error) = service.cancel().await {
            tracing::debug!(upstream = %upstream, error = %error, "client session cancel failed");
        }

        match tokio::time::timeout(
            std::time::Duration::from_secs(CHILD_EXIT_GRACE_SECS),
            child.wait(),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::debug!(upstream = %upstream, error = %error, "failed to wait for child exit");
            }
            Err(_) => {
                if let Err(error) = child.kill().await {
                    tracing::debug!(upstream = %upstream, error = %error, "failed to kill child");
                }
            }
        }

        stderr_task.abort();
    }
}

/// A single upstream MCP server: configuration, child process, client
/// session, cached capability lists, and health counters.
pub struct UpstreamSession {
    name: String,
    default_log_level: McpLogLevel,
    config: RwLock<UpstreamConfig>,
    connection: Mutex<Option<ActiveConnection>>,
    health: Mutex<HealthSnapshot>,
    tools: RwLock<Vec<Tool>>,
    resources: RwLock<Vec<Resource>>,
    prompts: RwLock<Vec<Prompt>>,
}

impl UpstreamSession {
    /// `name` must already be normalized (the supervisor owns normalization).
    pub fn new(name: String, config: UpstreamConfig, default_log_level: McpLogLevel) -> Self {
        Self {
            name,
            default_log_level,
            config: RwLock::new(config),
            connection: Mutex::new(None),
            health: Mutex::new(HealthSnapshot::new()),
            tools: RwLock::new(Vec::new()),
            resources: RwLock::new(Vec::new()),
            prompts: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn config_snapshot(&self) -> UpstreamConfig {
        self.config.read().await.clone()
    }

    pub(crate) async fn replace_config(&self, config: UpstreamConfig) {
        *self.config.write().await = config;
    }

    pub async fn status(&self) -> UpstreamStatus {
        self.health.lock().await.status
    }

    pub async fn health_snapshot(&self) -> HealthSnapshot {
        self.health.lock().await.clone()
    }

    pub async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    pub async fn resources(&self) -> Vec<Resource> {
        self.resources.read().await.clone()
    }

    pub async fn prompts(&self) -> Vec<Prompt> {
        self.prompts.read().await.clone()
    }

    /// Spawn the child, establish the MCP client session, and load the
    /// upstream's capability lists. Bounded by the configured connect
    /// timeout. On any failure the session ends up fully disconnected with
    /// `status = failed` and the error recorded.
    pub async fn start(&self) -> Result<()> {
        let config = self.config_snapshot().await;

        tracing::debug!(
            upstream = %self.name,
            command = %config.command,
            args = ?config.args,
            "starting upstream"
        );
        self.health.lock().await.status = UpstreamStatus::Connecting;

        let connected = tokio::time::timeout(config.connect_timeout(), self.connect(&config))
            .await
            .map_err(|_| {
                anyhow!(
                    "timed out connecting to upstream '{}' after {}s",
                    self.name,
                    config.timeout
                )
            })
            .and_then(|result| result);

        match connected {
            Ok(connection) => {
                let capabilities = connection
                    .service
                    .peer()
                    .peer_info()
                    .map(|info| info.capabilities.clone());

                *self.connection.lock().await = Some(connection);

                {
                    let mut health = self.health.lock().await;
                    health.status = UpstreamStatus::Connected;
                    health.last_seen = Some(SystemTime::now());
                    health.last_keep_alive = SystemTime::now();
                    health.failure_count = 0;
                    health.consecutive_failures = 0;
                    health.keep_alive_failures = 0;
                    health.last_error = None;
                    health.capabilities = capabilities;
                }

                self.load_capabilities().await;
                tracing::info!(upstream = %self.name, "connected");
                Ok(())
            }
            Err(error) => {
                let mut health = self.health.lock().await;
                health.status = UpstreamStatus::Failed;
                health.failure_count += 1;
                health.consecutive_failures += 1;
                health.last_error = Some(format!("{error:#}"));
                drop(health);
                tracing::warn!(upstream = %self.name, error = %format!("{error:#}"), "failed to connect");
                Err(error)
            }
        }
    }

    async fn connect(&self, config: &UpstreamConfig) -> Result<ActiveConnection> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        // Children see this to tell bridge-managed runs apart; the rest of
        // the parent environment (PYTHONPATH included) is inherited.
        cmd.env("MCP_BRIDGE_CHILD", "1");
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn upstream '{}'", self.name))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdout for upstream '{}'", self.name))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("failed to capture stdin for upstream '{}'", self.name))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("failed to capture stderr for upstream '{}'", self.name))?;

        let threshold = config.log_level.unwrap_or(self.default_log_level);
        let stderr_task = spawn_stderr_relay(self.name.clone(), threshold, stderr);

        let service = UpstreamEvents::new(self.name.clone())
            .serve((stdout, stdin))
            .await
            .with_context(|| format!("failed to initialize upstream '{}'", self.name))?;

        Ok(ActiveConnection {
            service,
            child,
            stderr_task,
        })
    }

    /// Refresh the cached tool/resource/prompt lists from the upstream,
    /// honoring the capabilities it advertised at initialize, and check any
    /// configured health-check targets against them.
    pub async fn load_capabilities(&self) {
        let capabilities = self.health.lock().await.capabilities.clone();
        let Some(capabilities) = capabilities else {
            return;
        };

        if capabilities.tools.is_some() {
            match self.list_tools().await {
                Ok(tools) => {
                    tracing::debug!(upstream = %self.name, count = tools.len(), "loaded tools");
                    *self.tools.write().await = tools;
                }
                Err(error) => {
                    tracing::warn!(upstream = %self.name, error = %error, "failed to list tools");
                }
            }
        }

        if capabilities.resources.is_some() {
            match self.list_resources().await {
                Ok(resources) => {
                    tracing::debug!(upstream = %self.name, count = resources.len(), "loaded resources");
                    *self.resources.write().await = resources;
                }
                Err(error) => {
                    tracing::warn!(upstream = %self.name, error = %error, "failed to list resources");
                }
            }
        }

        if capabilities.prompts.is_some() {
            match self.list_prompts().await {
                Ok(prompts) => {
                    tracing::debug!(upstream = %self.name, count = prompts.len(), "loaded prompts");
                    *self.prompts.write().await = prompts;
                }
                Err(error) => {
                    tracing::warn!(upstream = %self.name, error = %error, "failed to list prompts");
                }
            }
        }

        self.validate_health_targets().await;
    }

    /// Warn about health-check probes that reference capabilities or targets
    /// the upstream does not actually expose.
    pub(crate) async fn validate_health_targets(&self) {
        let config = self.config_snapshot().await;
        let capabilities = self.health.lock().await.capabilities.clone();
        let warnings = health_target_warnings(
            &config.health_check,
            capabilities.as_ref(),
            &self.tools.read().await,
            &self.resources.read().await,
            &self.prompts.read().await,
        );
        for warning in warnings {
            tracing::warn!(upstream = %self.name, "{warning}");
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        conn.service
            .peer()
            .list_all_tools()
            .await
            .map_err(UpstreamError::from)
    }

    pub async fn list_resources(&self) -> Result<Vec<Resource>, UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        conn.service
            .peer()
            .list_all_resources()
            .await
            .map_err(UpstreamError::from)
    }

    pub async fn list_prompts(&self) -> Result<Vec<Prompt>, UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        conn.service
            .peer()
            .list_all_prompts()
            .await
            .map_err(UpstreamError::from)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<CallToolResult, UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        let mut request = CallToolRequestParam::new(name.to_owned());
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }
        conn.service
            .peer()
            .call_tool(request)
            .await
            .map_err(UpstreamError::from)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        conn.service
            .peer()
            .read_resource(ReadResourceRequestParam::new(uri.to_owned()))
            .await
            .map_err(UpstreamError::from)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Result<GetPromptResult, UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        let mut request = GetPromptRequestParam::new(name.to_owned());
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }
        conn.service
            .peer()
            .get_prompt(request)
            .await
            .map_err(UpstreamError::from)
    }

    /// Best-effort; failures are logged, never surfaced.
    pub async fn subscribe_resource(&self, uri: &str) {
        let guard = self.connection.lock().await;
        let Some(conn) = guard.as_ref() else {
            return;
        };
        if let Err(error) = conn
            .service
            .peer()
            .subscribe(SubscribeRequestParam::new(uri.to_owned()))
            .await
        {
            tracing::warn!(upstream = %self.name, uri = %uri, error = %error, "subscribe failed");
        } else {
            tracing::debug!(upstream = %self.name, uri = %uri, "subscribed");
        }
    }

    /// Best-effort; failures are logged, never surfaced.
    pub async fn unsubscribe_resource(&self, uri: &str) {
        let guard = self.connection.lock().await;
        let Some(conn) = guard.as_ref() else {
            return;
        };
        if let Err(error) = conn
            .service
            .peer()
            .unsubscribe(UnsubscribeRequestParam::new(uri.to_owned()))
            .await
        {
            tracing::warn!(upstream = %self.name, uri = %uri, error = %error, "unsubscribe failed");
        } else {
            tracing::debug!(upstream = %self.name, uri = %uri, "unsubscribed");
        }
    }

    pub async fn set_log_level(&self, request: SetLevelRequestParam) -> Result<(), UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        conn.service
            .peer()
            .set_level(request)
            .await
            .map_err(UpstreamError::from)
    }

    pub async fn complete(
        &self,
        request: CompleteRequestParam,
    ) -> Result<CompleteResult, UpstreamError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().ok_or(UpstreamError::NotConnected)?;
        conn.service
            .peer()
            .complete(request)
            .await
            .map_err(UpstreamError::from)
    }

    /// Release the child process and client session without touching the
    /// recorded status. Cached lists are cleared so non-connected upstreams
    /// never contribute to the aggregate.
    pub(crate) async fn release_connection(&self) {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.shutdown(&self.name).await;
        }
        self.tools.write().await.clear();
        self.resources.write().await.clear();
        self.prompts.write().await.clear();
    }

    /// Graceful stop: release everything and mark the session disconnected.
    /// Safe to invoke in any state.
    pub async fn stop(&self) {
        tracing::info!(upstream = %self.name, "disconnecting");
        self.release_connection().await;
        let mut health = self.health.lock().await;
        health.status = UpstreamStatus::Disconnected;
        health.consecutive_failures = 0;
        health.keep_alive_failures = 0;
    }

    pub(crate) async fn mark_disabled(&self) {
        self.health.lock().await.status = UpstreamStatus::Disabled;
    }

    pub(crate) async fn mark_failed(&self) {
        self.health.lock().await.status = UpstreamStatus::Failed;
    }

    pub(crate) async fn record_probe_success(&self) {
        let mut health = self.health.lock().await;
        health.last_seen = Some(SystemTime::now());
        health.consecutive_failures = 0;
    }

    pub(crate) async fn record_probe_failure(&self, error: &str) -> u32 {
        let mut health = self.health.lock().await;
        health.failure_count += 1;
        health.consecutive_failures += 1;
        health.last_error = Some(error.to_owned());
        health.consecutive_failures
    }

    pub(crate) async fn record_keep_alive_success(&self) {
        let mut health = self.health.lock().await;
        health.last_keep_alive = SystemTime::now();
        health.keep_alive_failures = 0;
    }

    pub(crate) async fn record_keep_alive_failure(&self, error: &str) -> u32 {
        let mut health = self.health.lock().await;
        health.keep_alive_failures += 1;
        health.last_error = Some(error.to_owned());
        health.keep_alive_failures
    }

    /// Keep-alive exhaustion folds into the consecutive-failure count before
    /// the upstream is marked failed.
    pub(crate) async fn fail_from_keep_alive(&self) {
        let mut health = self.health.lock().await;
        health.consecutive_failures += health.keep_alive_failures;
        health.status = UpstreamStatus::Failed;
    }

    pub(crate) async fn begin_restart_attempt(&self) -> u32 {
        let mut health = self.health.lock().await;
        health.restart_count += 1;
        health.last_restart = Some(SystemTime::now());
        health.restart_count
    }

    pub(crate) async fn reset_failure_counters(&self) {
        let mut health = self.health.lock().await;
        health.consecutive_failures = 0;
        health.keep_alive_failures = 0;
    }

    pub(crate) async fn record_restart_error(&self, error: &str) {
        self.health.lock().await.last_error = Some(format!("restart failed: {error}"));
    }
}

fn spawn_stderr_relay(
    upstream: String,
    threshold: McpLogLevel,
    stderr: ChildStderr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let level = classify_stderr_line(line);
            if level < threshold {
                continue;
            }
            match level {
                McpLogLevel::Error => tracing::error!(upstream = %upstream, "[{upstream}] {line}"),
                McpLogLevel::Warn => tracing::warn!(upstream = %upstream, "[{upstream}] {line}"),
                McpLogLevel::Info => tracing::info!(upstream = %upstream, "[{upstream}] {line}"),
                McpLogLevel::Debug => tracing::debug!(upstream = %upstream, "[{upstream}] {line}"),
            }
        }
        tracing::debug!(upstream = %upstream, "stderr stream closed");
    })
}

/// Classify one captured stderr line. JSON-RPC frames that leaked onto
/// stderr are protocol traffic, not application output.
pub(crate) fn classify_stderr_line(line: &str) -> McpLogLevel {
    if line.starts_with("{\"") && line.contains("\"jsonrpc\"") {
        return McpLogLevel::Debug;
    }
    let lower = line.to_lowercase();
    if ["error", "exception", "traceback"]
        .iter()
        .any(|marker| lower.contains(marker))
    {
        return McpLogLevel::Error;
    }
    if lower.contains("warn") {
        return McpLogLevel::Warn;
    }
    if lower.contains("debug") || lower.contains("trace") {
        return McpLogLevel::Debug;
    }
    McpLogLevel::Info
}

/// Collect warnings for probe configurations that do not match what the
/// upstream exposes.
pub(crate) fn health_target_warnings(
    health_check: &HealthCheckConfig,
    capabilities: Option<&ServerCapabilities>,
    tools: &[Tool],
    resources: &[Resource],
    prompts: &[Prompt],
) -> Vec<String> {
    let mut warnings = Vec::new();
    if !health_check.enabled {
        return warnings;
    }
    let Some(capabilities) = capabilities else {
        return warnings;
    };

    let operation = health_check.operation.to_lowercase();
    let capability_missing = match operation.as_str() {
        "call_tool" => capabilities.tools.is_none(),
        "read_resource" => capabilities.resources.is_none(),
        "get_prompt" => capabilities.prompts.is_none(),
        _ => false,
    };
    if capability_missing {
        warnings.push(format!(
            "health check operation '{operation}' configured but the upstream \
             does not advertise the matching capability"
        ));
    }

    if operation == "call_tool"
        && let Some(tool_name) = &health_check.tool_name
        && !tools.is_empty()
        && !tools.iter().any(|tool| tool.name.as_ref() == tool_name.as_str())
    {
        warnings.push(format!(
            "health check tool '{tool_name}' not found on the upstream"
        ));
    }

    if operation == "read_resource"
        && let Some(uri) = &health_check.resource_uri
        && !resources.is_empty()
        && !resources.iter().any(|resource| &resource.uri == uri)
    {
        warnings.push(format!(
            "health check resource '{uri}' not found on the upstream"
        ));
    }

    if operation == "get_prompt"
        && let Some(prompt_name) = &health_check.prompt_name
        && !prompts.is_empty()
        && !prompts.iter().any(|prompt| &prompt.name == prompt_name)
    {
        warnings.push(format!(
            "health check prompt '{prompt_name}' not found on the upstream"
        ));
    }

    warnings
}
