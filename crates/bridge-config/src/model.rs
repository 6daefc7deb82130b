use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Capability kinds an upstream can expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
    Tools,
    Resources,
    Prompts,
}

/// Normalize an upstream name into its canonical registry key.
///
/// Lowercases the name and replaces every character outside `[a-z0-9_-]`
/// (notably `.`) with `_`. Idempotent.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Minimum severity at which a child's relayed stderr lines are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McpLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for McpLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" | "notice" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" | "critical" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

impl fmt::Display for McpLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

// Case-insensitive: the original JSON configs carried "ERROR"-style values.
impl<'de> Deserialize<'de> for McpLogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How duplicate aggregated identifiers are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Highest-priority upstream wins; later duplicates are skipped.
    #[default]
    Priority,
    /// First source seen wins (same effect as `priority`).
    First,
    /// Namespaces are expected to prevent conflicts; residual collisions
    /// fall back to priority.
    Namespace,
    /// A duplicate identifier is a fatal aggregation error.
    Error,
}

/// Which capability kinds the bridge exposes downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationSettings {
    pub tools: bool,
    pub resources: bool,
    pub prompts: bool,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }
}

impl AggregationSettings {
    pub fn exposes(&self, kind: CapabilityKind) -> bool {
        match kind {
            CapabilityKind::Tools => self.tools,
            CapabilityKind::Resources => self.resources,
            CapabilityKind::Prompts => self.prompts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    pub enabled: bool,
    /// Bridge-wide override; when unset, each upstream's
    /// `max_consecutive_failures` applies.
    #[serde(alias = "maxFailures")]
    pub max_failures: Option<u32>,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_failures: None,
        }
    }
}

/// Bridge-wide settings (`"bridge"` object in the config file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeSettings {
    /// When true and an upstream declares no explicit namespace, its
    /// normalized name becomes the namespace for every capability kind.
    #[serde(alias = "defaultNamespace")]
    pub default_namespace: bool,
    #[serde(alias = "conflictResolution")]
    pub conflict_resolution: ConflictResolution,
    pub aggregation: AggregationSettings,
    pub failover: FailoverSettings,
    /// Default stderr relay threshold for upstreams without a `log_level`.
    #[serde(alias = "mcpLogLevel")]
    pub mcp_log_level: McpLogLevel,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            default_namespace: false,
            conflict_resolution: ConflictResolution::default(),
            aggregation: AggregationSettings::default(),
            failover: FailoverSettings::default(),
            mcp_log_level: McpLogLevel::Error,
        }
    }
}

/// Liveness probing and restart policy for one upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    /// Probe operation: `list_tools`, `list_resources`, `list_prompts`,
    /// `call_tool`, `read_resource`, `get_prompt`, `ping`, `health`,
    /// `status`. Anything else falls back to `list_tools` with a warning.
    pub operation: String,
    #[serde(alias = "timeoutMs", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(alias = "keepAliveInterval", alias = "keep_alive_interval")]
    pub keep_alive_interval_ms: u64,
    #[serde(alias = "keepAliveTimeout", alias = "keep_alive_timeout")]
    pub keep_alive_timeout_ms: u64,
    #[serde(alias = "maxConsecutiveFailures")]
    pub max_consecutive_failures: u32,
    #[serde(alias = "autoRestart")]
    pub auto_restart: bool,
    #[serde(alias = "maxRestartAttempts")]
    pub max_restart_attempts: u32,
    #[serde(alias = "restartDelay", alias = "restart_delay")]
    pub restart_delay_ms: u64,
    #[serde(alias = "toolName")]
    pub tool_name: Option<String>,
    #[serde(alias = "toolArguments")]
    pub tool_arguments: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(alias = "resourceUri")]
    pub resource_uri: Option<String>,
    #[serde(alias = "promptName")]
    pub prompt_name: Option<String>,
    #[serde(alias = "promptArguments")]
    pub prompt_arguments: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            operation: "list_tools".to_string(),
            timeout_ms: 5_000,
            keep_alive_interval_ms: 30_000,
            keep_alive_timeout_ms: 5_000,
            max_consecutive_failures: 3,
            auto_restart: true,
            max_restart_attempts: 3,
            restart_delay_ms: 1_000,
            tool_name: None,
            tool_arguments: None,
            resource_uri: None,
            prompt_name: None,
            prompt_arguments: None,
        }
    }
}

impl HealthCheckConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

/// One upstream server entry (`"servers"` map values in the config file).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Initial connect deadline, in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    /// Lower value = higher priority during aggregation and routing.
    #[serde(default = "default_priority")]
    pub priority: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, alias = "toolNamespace")]
    pub tool_namespace: Option<String>,
    #[serde(default, alias = "resourceNamespace")]
    pub resource_namespace: Option<String>,
    #[serde(default, alias = "promptNamespace")]
    pub prompt_namespace: Option<String>,
    /// Per-upstream stderr relay threshold; overrides `bridge.mcp_log_level`.
    #[serde(default, alias = "logLevel")]
    pub log_level: Option<McpLogLevel>,
    #[serde(default, alias = "healthCheck")]
    pub health_check: HealthCheckConfig,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_priority() -> i64 {
    100
}

impl UpstreamConfig {
    /// Minimal config for a stdio command; used by tests and programmatic
    /// callers.
    pub fn for_command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            enabled: true,
            command: command.into(),
            args,
            env: HashMap::new(),
            timeout: default_timeout_secs(),
            priority: default_priority(),
            tags: Vec::new(),
            tool_namespace: None,
            resource_namespace: None,
            prompt_namespace: None,
            log_level: None,
            health_check: HealthCheckConfig::default(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Effective namespace for a capability kind: the explicit per-kind
    /// namespace wins, otherwise the normalized upstream name when
    /// `bridge.default_namespace` is set, otherwise none.
    pub fn effective_namespace(
        &self,
        kind: CapabilityKind,
        bridge: &BridgeSettings,
        normalized_name: &str,
    ) -> Option<String> {
        let explicit = match kind {
            CapabilityKind::Tools => self.tool_namespace.as_ref(),
            CapabilityKind::Resources => self.resource_namespace.as_ref(),
            CapabilityKind::Prompts => self.prompt_namespace.as_ref(),
        };
        if let Some(ns) = explicit {
            return Some(ns.clone());
        }
        if bridge.default_namespace {
            return Some(normalized_name.to_string());
        }
        None
    }

    /// True when the fields that require reconfiguration action differ.
    pub fn differs_from(&self, other: &Self) -> bool {
        self.enabled != other.enabled
            || self.command != other.command
            || self.args != other.args
            || self.env != other.env
            || self.priority != other.priority
            || self.timeout != other.timeout
            || self.health_check != other.health_check
            || self.tool_namespace != other.tool_namespace
            || self.resource_namespace != other.resource_namespace
            || self.prompt_namespace != other.prompt_namespace
            || self.tags != other.tags
    }

    /// True when replacing `other` with this config forces a reconnect.
    pub fn needs_reconnect(&self, other: &Self) -> bool {
        self.command != other.command || self.args != other.args || self.env != other.env
    }
}

/// Whole config file: `{ "servers": { name: UpstreamConfig }, "bridge": … }`.
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfiguration {
    pub servers: HashMap<String, UpstreamConfig>,
    #[serde(default)]
    pub bridge: BridgeSettings,
}
