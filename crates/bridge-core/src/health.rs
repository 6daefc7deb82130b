//! Liveness probing, keep-alives, and automatic restarts for upstreams.
//!
//! Two cooperative loops run while the supervisor is alive: the failover
//! loop probes every connected upstream on a fixed cadence, and the
//! keep-alive loop pings upstreams whose own interval has elapsed. Both
//! feed the same failure accounting; exhausted upstreams are disconnected
//! and, when policy allows, restarted under the per-upstream restart lock.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bridge_config::{BridgeSettings, HealthCheckConfig};

use crate::error::UpstreamError;
use crate::session::{UpstreamSession, UpstreamStatus};
use crate::supervisor::Supervisor;

const FAILOVER_INTERVAL: Duration = Duration::from_secs(30);
const KEEP_ALIVE_FAILURE_LIMIT: u32 = 3;
const DEFAULT_KEEP_ALIVE_CADENCE: Duration = Duration::from_secs(60);

/// Probe selected from an upstream's health-check configuration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ProbeOp {
    ListTools,
    ListResources,
    ListPrompts,
    CallTool {
        name: String,
        arguments: serde_json::Map<String, serde_json::Value>,
    },
    ReadResource {
        uri: String,
    },
    GetPrompt {
        name: String,
        arguments: Option<serde_json::Map<String, serde_json::Value>>,
    },
}

/// Map the configured operation onto an executable probe. Misconfigured or
/// unknown operations fall back to `list_tools`; the second element carries
/// the warning to emit when that happens.
pub(crate) fn resolve_probe(health_check: &HealthCheckConfig) -> (ProbeOp, Option<String>) {
    match health_check.operation.to_lowercase().as_str() {
        "list_tools" => (ProbeOp::ListTools, None),
        "list_resources" => (ProbeOp::ListResources, None),
        "list_prompts" => (ProbeOp::ListPrompts, None),
        "call_tool" => match &health_check.tool_name {
            Some(name) => (
                ProbeOp::CallTool {
                    name: name.clone(),
                    arguments: health_check.tool_arguments.clone().unwrap_or_default(),
                },
                None,
            ),
            None => (
                ProbeOp::ListTools,
                Some(
                    "probe 'call_tool' requires 'tool_name'; falling back to list_tools"
                        .to_string(),
                ),
            ),
        },
        "read_resource" => match &health_check.resource_uri {
            Some(uri) => (ProbeOp::ReadResource { uri: uri.clone() }, None),
            None => (
                ProbeOp::ListTools,
                Some(
                    "probe 'read_resource' requires 'resource_uri'; falling back to list_tools"
                        .to_string(),
                ),
            ),
        },
        "get_prompt" => match &health_check.prompt_name {
            Some(name) => (
                ProbeOp::GetPrompt {
                    name: name.clone(),
                    arguments: health_check.prompt_arguments.clone(),
                },
                None,
            ),
            None => (
                ProbeOp::ListTools,
                Some(
                    "probe 'get_prompt' requires 'prompt_name'; falling back to list_tools"
                        .to_string(),
                ),
            ),
        },
        // The rmcp client has no dedicated ping request; a listing is the
        // cheapest round-trip.
        "ping" | "health" | "status" => (ProbeOp::ListTools, None),
        other => (
            ProbeOp::ListTools,
            Some(format!(
                "unknown probe operation '{other}'; falling back to list_tools"
            )),
        ),
    }
}

async fn execute_probe(session: &UpstreamSession, op: ProbeOp) -> Result<(), UpstreamError> {
    match op {
        ProbeOp::ListTools => session.list_tools().await.map(|_| ()),
        ProbeOp::ListResources => session.list_resources().await.map(|_| ()),
        ProbeOp::ListPrompts => session.list_prompts().await.map(|_| ()),
        ProbeOp::CallTool { name, arguments } => {
            session.call_tool(&name, Some(arguments)).await.map(|_| ())
        }
        ProbeOp::ReadResource { uri } => session.read_resource(&uri).await.map(|_| ()),
        ProbeOp::GetPrompt { name, arguments } => {
            session.get_prompt(&name, arguments).await.map(|_| ())
        }
    }
}

/// Run the configured probe, bounded by `deadline`. A response that lands
/// exactly at the deadline still counts as success.
async fn run_probe(session: &UpstreamSession, deadline: Duration) -> Result<(), String> {
    let config = session.config_snapshot().await;
    let (op, warning) = resolve_probe(&config.health_check);
    if let Some(warning) = warning {
        tracing::warn!(upstream = %session.name(), "{warning}");
    }
    match tokio::time::timeout(deadline, execute_probe(session, op)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err(format!("probe timed out after {}ms", deadline.as_millis())),
    }
}

/// Threshold precedence: bridge-wide failover override, then the upstream's
/// own `max_consecutive_failures` (which itself defaults to 3).
pub(crate) fn effective_max_failures(
    settings: &BridgeSettings,
    health_check: &HealthCheckConfig,
) -> u32 {
    settings
        .failover
        .max_failures
        .unwrap_or(health_check.max_consecutive_failures)
        .max(1)
}

pub(crate) fn should_restart(health_check: &HealthCheckConfig, restart_count: u32) -> bool {
    health_check.auto_restart && restart_count < health_check.max_restart_attempts
}

pub(crate) async fn failover_loop(supervisor: Arc<Supervisor>) {
    let shutdown = supervisor.shutdown_token();
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        failover_pass(&supervisor).await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(FAILOVER_INTERVAL) => {}
        }
    }
}

/// One probe round over every connected upstream.
pub(crate) async fn failover_pass(supervisor: &Arc<Supervisor>) {
    for session in supervisor.sessions_snapshot().await {
        if session.status().await != UpstreamStatus::Connected {
            continue;
        }
        let config = session.config_snapshot().await;
        match run_probe(&session, config.health_check.probe_timeout()).await {
            Ok(()) => session.record_probe_success().await,
            Err(error) => {
                tracing::warn!(upstream = %session.name(), error = %error, "health check failed");
                let consecutive = session.record_probe_failure(&error).await;
                let max_failures = effective_max_failures(supervisor.settings(), &config.health_check);
                if consecutive >= max_failures {
                    tracing::error!(
                        upstream = %session.name(),
                        consecutive,
                        "upstream exceeded consecutive failure limit, marking failed"
                    );
                    session.mark_failed().await;
                    session.release_connection().await;
                    maybe_schedule_restart(supervisor, session).await;
                }
            }
        }
    }
}

pub(crate) async fn keep_alive_loop(supervisor: Arc<Supervisor>) {
    let shutdown = supervisor.shutdown_token();
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        keep_alive_pass(&supervisor).await;
        let cadence = keep_alive_cadence(&supervisor).await;
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(cadence) => {}
        }
    }
}

/// Minimum enabled keep-alive interval across upstreams.
async fn keep_alive_cadence(supervisor: &Arc<Supervisor>) -> Duration {
    let mut cadence: Option<Duration> = None;
    for session in supervisor.sessions_snapshot().await {
        let config = session.config_snapshot().await;
        if config.health_check.enabled {
            let interval = config.health_check.keep_alive_interval();
            cadence = Some(cadence.map_or(interval, |current| current.min(interval)));
        }
    }
    cadence.unwrap_or(DEFAULT_KEEP_ALIVE_CADENCE)
}

/// Ping every connected upstream whose keep-alive interval has elapsed.
/// Pings run as separate supervisor-tracked tasks so one slow upstream
/// cannot stall the loop.
pub(crate) async fn keep_alive_pass(supervisor: &Arc<Supervisor>) {
    let now = SystemTime::now();
    for session in supervisor.sessions_snapshot().await {
        if session.status().await != UpstreamStatus::Connected {
            continue;
        }
        let config = session.config_snapshot().await;
        if !config.health_check.enabled {
            continue;
        }
        let last = session.health_snapshot().await.last_keep_alive;
        let elapsed = now.duration_since(last).unwrap_or_default();
        if elapsed < config.health_check.keep_alive_interval() {
            continue;
        }

        let supervisor_for_task = supervisor.clone();
        let handle = tokio::spawn(async move {
            send_keep_alive(supervisor_for_task, session).await;
        });
        supervisor.track_task(handle).await;
    }
}

async fn send_keep_alive(supervisor: Arc<Supervisor>, session: Arc<UpstreamSession>) {
    let config = session.config_snapshot().await;
    match run_probe(&session, config.health_check.keep_alive_timeout()).await {
        Ok(()) => {
            session.record_keep_alive_success().await;
            tracing::debug!(upstream = %session.name(), "keep-alive ok");
        }
        Err(error) => {
            let failures = session.record_keep_alive_failure(&error).await;
            tracing::warn!(
                upstream = %session.name(),
                failures,
                error = %error,
                "keep-alive failed"
            );
            if failures >= KEEP_ALIVE_FAILURE_LIMIT {
                tracing::error!(
                    upstream = %session.name(),
                    failures,
                    "keep-alive exhausted, marking upstream failed"
                );
                session.fail_from_keep_alive().await;
                session.release_connection().await;
                maybe_schedule_restart(&supervisor, session).await;
            }
        }
    }
}

async fn maybe_schedule_restart(supervisor: &Arc<Supervisor>, session: Arc<UpstreamSession>) {
    let config = session.config_snapshot().await;
    let restart_count = session.health_snapshot().await.restart_count;
    if !should_restart(&config.health_check, restart_count) {
        return;
    }
    let supervisor_for_task = supervisor.clone();
    let handle = tokio::spawn(async move {
        restart_upstream(supervisor_for_task, session).await;
    });
    supervisor.track_task(handle).await;
}

/// Restart one failed upstream. The per-upstream lock guarantees a single
/// concurrent restart; if another path already recovered the session, this
/// returns without touching it.
pub(crate) async fn restart_upstream(supervisor: Arc<Supervisor>, session: Arc<UpstreamSession>) {
    let Some(lock) = supervisor.restart_lock(session.name()).await else {
        // Upstream was removed while the restart was queued.
        return;
    };
    let _guard = lock.lock().await;

    if session.status().await != UpstreamStatus::Failed {
        return;
    }

    let config = session.config_snapshot().await;
    let attempt = session.begin_restart_attempt().await;
    tracing::info!(
        upstream = %session.name(),
        attempt,
        max_attempts = config.health_check.max_restart_attempts,
        "restarting upstream"
    );

    let shutdown = supervisor.shutdown_token();
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(config.health_check.restart_delay()) => {}
    }

    session.release_connection().await;
    session.reset_failure_counters().await;

    match session.start().await {
        Ok(()) => tracing::info!(upstream = %session.name(), "restart succeeded"),
        Err(error) => {
            let text = format!("{error:#}");
            session.record_restart_error(&text).await;
            tracing::error!(upstream = %session.name(), error = %text, "restart failed");
        }
    }
}
