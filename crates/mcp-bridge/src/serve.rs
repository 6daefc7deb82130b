//! Downstream SSE endpoint for the bridge facade.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use bridge_core::BridgeFacade;
use rmcp::transport::{SseServer, sse_server::SseServerConfig};
use tokio_util::sync::CancellationToken;

const SSE_PATH: &str = "/";
const SSE_POST_PATH: &str = "/message";

pub(crate) struct SseEndpoint {
    pub(crate) addr: SocketAddr,
    shutdown: CancellationToken,
    server_task: tokio::task::JoinHandle<()>,
}

impl SseEndpoint {
    pub(crate) async fn start(host: &str, port: u16, facade: BridgeFacade) -> Result<Self> {
        let bind_addr = format!("{host}:{port}")
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid bind address '{host}:{port}'"))?;

        let listener = tokio::net::TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind SSE endpoint at {bind_addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to resolve local SSE address")?;

        let shutdown = CancellationToken::new();
        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: local_addr,
            sse_path: SSE_PATH.to_string(),
            post_path: SSE_POST_PATH.to_string(),
            ct: shutdown.clone(),
            sse_keep_alive: None,
        });
        let _server_ct = sse_server.with_service_directly(move || facade.clone());

        let server_shutdown = shutdown.clone();
        let server_task = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, sse_router)
                .with_graceful_shutdown(async move {
                    server_shutdown.cancelled().await;
                })
                .await
            {
                tracing::warn!(error = %error, "SSE server stopped with error");
            }
        });

        Ok(Self {
            addr: local_addr,
            shutdown,
            server_task,
        })
    }

    pub(crate) async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.server_task.await {
            tracing::debug!(error = %error, "SSE server join failed");
        }
    }
}
