//! Client-side notification handling for upstream sessions.
//!
//! Each upstream child gets one [`UpstreamEvents`] handler. Notifications
//! the upstream pushes (log messages, progress, resource updates, list
//! changes) are surfaced under the bridge log with the upstream name
//! attached; the rmcp layer relays whatever needs to reach downstream.

use rmcp::handler::client::ClientHandler;
use rmcp::model::{
    ClientInfo, LoggingLevel, LoggingMessageNotificationParam, ProgressNotificationParam,
    ResourceUpdatedNotificationParam,
};
use rmcp::service::{NotificationContext, RoleClient};

#[derive(Clone)]
pub(crate) struct UpstreamEvents {
    upstream: String,
}

impl UpstreamEvents {
    pub(crate) fn new(upstream: String) -> Self {
        Self { upstream }
    }
}

impl ClientHandler for UpstreamEvents {
    fn on_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let upstream = self.upstream.clone();
        async move {
            let logger = params.logger.unwrap_or_default();
            match params.level {
                LoggingLevel::Debug => {
                    tracing::debug!(upstream = %upstream, logger = %logger, payload = ?params.data, "upstream log")
                }
                LoggingLevel::Info | LoggingLevel::Notice => {
                    tracing::info!(upstream = %upstream, logger = %logger, payload = ?params.data, "upstream log")
                }
                LoggingLevel::Warning => {
                    tracing::warn!(upstream = %upstream, logger = %logger, payload = ?params.data, "upstream warning")
                }
                LoggingLevel::Error
                | LoggingLevel::Critical
                | LoggingLevel::Alert
                | LoggingLevel::Emergency => {
                    tracing::error!(upstream = %upstream, logger = %logger, payload = ?params.data, "upstream error")
                }
            }
        }
    }

    fn on_progress(
        &self,
        params: ProgressNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let upstream = self.upstream.clone();
        async move {
            tracing::debug!(
                upstream = %upstream,
                progress = params.progress,
                total = ?params.total,
                "upstream progress"
            );
        }
    }

    fn on_resource_updated(
        &self,
        params: ResourceUpdatedNotificationParam,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        let upstream = self.upstream.clone();
        async move {
            tracing::info!(upstream = %upstream, uri = %params.uri, "upstream resource updated");
        }
    }

    fn on_resource_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        tracing::info!(upstream = %self.upstream, "upstream resource list changed");
        async move {}
    }

    fn on_tool_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        tracing::info!(upstream = %self.upstream, "upstream tool list changed");
        async move {}
    }

    fn on_prompt_list_changed(
        &self,
        _context: NotificationContext<RoleClient>,
    ) -> impl std::future::Future<Output = ()> + Send + '_ {
        tracing::info!(upstream = %self.upstream, "upstream prompt list changed");
        async move {}
    }

    fn get_info(&self) -> ClientInfo {
        let mut info = ClientInfo::default();
        info.client_info.name = "mcp-bridge".to_string();
        info.client_info.version = env!("CARGO_PKG_VERSION").to_string();
        info
    }
}
