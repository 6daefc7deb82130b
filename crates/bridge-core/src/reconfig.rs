//! Live reconfiguration: diff a new upstream map against the running set
//! and apply add/remove/update actions, atomically per upstream.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bridge_config::{UpstreamConfig, normalize_name};

use crate::session::UpstreamSession;
use crate::supervisor::Supervisor;

#[derive(Debug, PartialEq)]
pub(crate) struct NameDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub retained: Vec<String>,
}

pub(crate) fn diff_names(current: &HashSet<String>, incoming: &HashSet<String>) -> NameDiff {
    let mut added: Vec<String> = incoming.difference(current).cloned().collect();
    let mut removed: Vec<String> = current.difference(incoming).cloned().collect();
    let mut retained: Vec<String> = current.intersection(incoming).cloned().collect();
    added.sort();
    removed.sort();
    retained.sort();
    NameDiff {
        added,
        removed,
        retained,
    }
}

impl Supervisor {
    /// Apply a new upstream configuration map. Reloading the currently
    /// running configuration is a no-op: untouched upstreams keep their
    /// connections and counters.
    pub async fn update_servers(&self, new_configs: HashMap<String, UpstreamConfig>) {
        let incoming: HashMap<String, UpstreamConfig> = new_configs
            .into_iter()
            .map(|(name, config)| (normalize_name(&name), config))
            .collect();

        let current: HashSet<String> = self
            .sessions_snapshot()
            .await
            .iter()
            .map(|session| session.name().to_string())
            .collect();
        let incoming_names: HashSet<String> = incoming.keys().cloned().collect();
        let diff = diff_names(&current, &incoming_names);

        tracing::info!(
            add = diff.added.len(),
            remove = diff.removed.len(),
            check = diff.retained.len(),
            "applying upstream configuration changes"
        );

        for name in &diff.removed {
            self.remove_upstream(name).await;
        }

        for name in &diff.added {
            if let Some(config) = incoming.get(name) {
                self.add_upstream(name, config.clone()).await;
            }
        }

        for name in &diff.retained {
            let (Some(config), Some(session)) = (incoming.get(name), self.session(name).await)
            else {
                continue;
            };
            self.update_upstream(session, config.clone()).await;
        }

        tracing::info!("upstream configuration update complete");
    }

    async fn add_upstream(&self, name: &str, config: UpstreamConfig) {
        if !config.enabled {
            tracing::info!(upstream = %name, "upstream disabled, skipping");
            return;
        }
        tracing::info!(upstream = %name, "adding upstream");
        let session = self.insert_session(name, config).await;
        let _ = session.start().await;
    }

    async fn remove_upstream(&self, normalized: &str) {
        tracing::info!(upstream = %normalized, "removing upstream");
        if let Some(session) = self.remove_session(normalized).await {
            session.stop().await;
        }
    }

    async fn update_upstream(&self, session: Arc<UpstreamSession>, new_config: UpstreamConfig) {
        let old = session.config_snapshot().await;
        if !new_config.differs_from(&old) {
            return;
        }

        tracing::info!(upstream = %session.name(), "configuration changed, updating");

        if !new_config.enabled {
            session.stop().await;
            session.replace_config(new_config).await;
            session.mark_disabled().await;
            return;
        }

        if !old.enabled {
            session.replace_config(new_config).await;
            let _ = session.start().await;
            return;
        }

        if new_config.needs_reconnect(&old) {
            tracing::info!(upstream = %session.name(), "spawn parameters changed, reconnecting");
            session.stop().await;
            session.replace_config(new_config).await;
            let _ = session.start().await;
            return;
        }

        // Priority, tags, namespaces, health-check policy: mutate in place
        // and re-check probe targets against the cached capability lists.
        session.replace_config(new_config).await;
        session.validate_health_targets().await;
    }
}
