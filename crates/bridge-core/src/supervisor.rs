//! Supervisor core: owns the upstream session set, restart locks, shutdown
//! signaling, and the spawned health tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bridge_config::{BridgeSettings, UpstreamConfig, normalize_name};
use rmcp::model::{Prompt, Resource, Tool};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health;
use crate::session::{UpstreamSession, UpstreamStatus};

const INITIAL_CONNECT_WAIT_SECS: u64 = 30;
const STOP_GRACE_MILLIS: u64 = 2_000;

pub struct Supervisor {
    settings: BridgeSettings,
    sessions: RwLock<HashMap<String, Arc<UpstreamSession>>>,
    restart_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Point-in-time view of one connected upstream, used to build aggregated
/// listings and route requests. The aggregate is a pure function of these.
pub(crate) struct UpstreamSnapshot {
    pub name: String,
    pub config: UpstreamConfig,
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
    pub session: Arc<UpstreamSession>,
}

impl Supervisor {
    pub fn new(settings: BridgeSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            sessions: RwLock::new(HashMap::new()),
            restart_locks: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Connect all enabled upstreams and start the health loops. Waits up to
    /// 30 s for the initial connections; stragglers keep connecting in the
    /// background.
    pub async fn start(self: &Arc<Self>, servers: &HashMap<String, UpstreamConfig>) {
        tracing::info!(configured = servers.len(), "starting upstream supervisor");

        for (name, config) in servers {
            if !config.enabled {
                tracing::info!(upstream = %name, "upstream disabled, skipping");
                continue;
            }
            self.insert_session(name, config.clone()).await;
        }

        let sessions = self.sessions_snapshot().await;
        let mut connects = Vec::with_capacity(sessions.len());
        for session in sessions {
            connects.push(tokio::spawn(async move {
                let _ = session.start().await;
            }));
        }
        if !connects.is_empty()
            && tokio::time::timeout(
                Duration::from_secs(INITIAL_CONNECT_WAIT_SECS),
                futures::future::join_all(connects),
            )
            .await
            .is_err()
        {
            tracing::warn!(
                "some upstreams took longer than {INITIAL_CONNECT_WAIT_SECS} seconds to connect"
            );
        }

        self.spawn_health_tasks().await;

        let active = self.connected_count().await;
        tracing::info!(active, "upstream supervisor started");
    }

    async fn spawn_health_tasks(self: &Arc<Self>) {
        if self.settings.failover.enabled {
            let supervisor = self.clone();
            self.track_task(tokio::spawn(health::failover_loop(supervisor)))
                .await;
        }

        let mut any_keep_alive = false;
        for session in self.sessions_snapshot().await {
            if session.config_snapshot().await.health_check.enabled {
                any_keep_alive = true;
                break;
            }
        }
        if any_keep_alive {
            let supervisor = self.clone();
            self.track_task(tokio::spawn(health::keep_alive_loop(supervisor)))
                .await;
        }
    }

    /// Signal shutdown and release every upstream. Bounded: teardown gets a
    /// short grace period, after which remaining children die with their
    /// dropped handles.
    pub async fn stop(&self) {
        tracing::info!("stopping upstream supervisor");
        self.shutdown.cancel();

        for handle in self.tasks.lock().await.drain(..) {
            handle.abort();
        }

        let sessions = self.sessions_snapshot().await;
        let teardown = futures::future::join_all(sessions.iter().map(|session| session.stop()));
        if tokio::time::timeout(Duration::from_millis(STOP_GRACE_MILLIS), teardown)
            .await
            .is_err()
        {
            tracing::debug!("session teardown exceeded the stop grace period");
        }

        tracing::info!("upstream supervisor stopped");
    }

    pub(crate) async fn insert_session(
        &self,
        name: &str,
        config: UpstreamConfig,
    ) -> Arc<UpstreamSession> {
        let normalized = normalize_name(name);
        let session = Arc::new(UpstreamSession::new(
            normalized.clone(),
            config,
            self.settings.mcp_log_level,
        ));
        self.sessions
            .write()
            .await
            .insert(normalized.clone(), session.clone());
        self.restart_locks
            .lock()
            .await
            .insert(normalized, Arc::new(Mutex::new(())));
        session
    }

    pub(crate) async fn remove_session(&self, normalized: &str) -> Option<Arc<UpstreamSession>> {
        self.restart_locks.lock().await.remove(normalized);
        self.sessions.write().await.remove(normalized)
    }

    pub async fn session(&self, name: &str) -> Option<Arc<UpstreamSession>> {
        self.sessions.read().await.get(&normalize_name(name)).cloned()
    }

    pub(crate) async fn sessions_snapshot(&self) -> Vec<Arc<UpstreamSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub(crate) async fn restart_lock(&self, name: &str) -> Option<Arc<Mutex<()>>> {
        self.restart_locks.lock().await.get(name).cloned()
    }

    /// Retain spawned health/keep-alive/restart tasks so stop() can abort
    /// them; finished handles are pruned on the way in.
    pub(crate) async fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for session in self.sessions_snapshot().await {
            if session.status().await == UpstreamStatus::Connected {
                count += 1;
            }
        }
        count
    }

    /// Connected upstreams ordered by ascending priority (name as
    /// tie-breaker, so the ordering is deterministic).
    pub(crate) async fn connected_snapshots(&self) -> Vec<UpstreamSnapshot> {
        let mut snapshots = Vec::new();
        for session in self.sessions_snapshot().await {
            if session.status().await != UpstreamStatus::Connected {
                continue;
            }
            snapshots.push(UpstreamSnapshot {
                name: session.name().to_string(),
                config: session.config_snapshot().await,
                tools: session.tools().await,
                resources: session.resources().await,
                prompts: session.prompts().await,
                session,
            });
        }
        snapshots.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.name.cmp(&b.name))
        });
        snapshots
    }

    /// Status report for every managed upstream, disabled ones included.
    pub async fn status(&self) -> HashMap<String, UpstreamStatusReport> {
        let mut report = HashMap::new();
        let sessions: Vec<_> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(name, session)| (name.clone(), session.clone()))
            .collect();

        for (name, session) in sessions {
            let health = session.health_snapshot().await;
            let config = session.config_snapshot().await;
            report.insert(
                name,
                UpstreamStatusReport {
                    status: health.status,
                    last_seen: health.last_seen.map(rfc3339),
                    failure_count: health.failure_count,
                    last_error: health.last_error,
                    capabilities: CapabilityCounts {
                        tools: session.tools().await.len(),
                        resources: session.resources().await.len(),
                        prompts: session.prompts().await.len(),
                    },
                    health: HealthCounters {
                        consecutive_failures: health.consecutive_failures,
                        restart_count: health.restart_count,
                        last_restart: health.last_restart.map(rfc3339),
                        keep_alive_failures: health.keep_alive_failures,
                        last_keep_alive: rfc3339(health.last_keep_alive),
                    },
                    config: ConfigEcho {
                        enabled: config.enabled,
                        command: config.command.clone(),
                        args: config.args.clone(),
                        priority: config.priority,
                        tags: config.tags.clone(),
                        health_check_enabled: config.health_check.enabled,
                        health_check_operation: config.health_check.operation.clone(),
                        auto_restart: config.health_check.auto_restart,
                    },
                },
            );
        }
        report
    }
}

fn rfc3339(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc3339()
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct UpstreamStatusReport {
    pub status: UpstreamStatus,
    pub last_seen: Option<String>,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub capabilities: CapabilityCounts,
    pub health: HealthCounters,
    pub config: ConfigEcho,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CapabilityCounts {
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthCounters {
    pub consecutive_failures: u32,
    pub restart_count: u32,
    pub last_restart: Option<String>,
    pub keep_alive_failures: u32,
    pub last_keep_alive: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ConfigEcho {
    pub enabled: bool,
    pub command: String,
    pub args: Vec<String>,
    pub priority: i64,
    pub tags: Vec<String>,
    pub health_check_enabled: bool,
    pub health_check_operation: String,
    pub auto_restart: bool,
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
