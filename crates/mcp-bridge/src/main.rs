//! Aggregating MCP bridge: spawns the configured upstream servers and
//! exposes their combined capabilities over a single SSE endpoint.

mod serve;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use bridge_core::{BridgeFacade, LogLevelHook, Supervisor};
use clap::Parser;
use rmcp::model::LoggingLevel;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::serve::SseEndpoint;

#[derive(Parser, Debug)]
#[command(
    name = "mcp-bridge",
    version,
    about = "Aggregating bridge for Model Context Protocol servers"
)]
struct Cli {
    /// Bridge configuration file (JSON).
    #[arg(long, default_value = "config.json", env = "MCP_BRIDGE_CONFIG")]
    config: PathBuf,

    /// Host for the downstream SSE endpoint.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the downstream SSE endpoint.
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Enable verbose logging.
    #[arg(long, default_value_t = false)]
    debug: bool,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    let (filter, filter_handle) = reload::Layer::new(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
    );
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if !cli.config.exists() {
        report_missing_config(&cli.config);
        return ExitCode::from(1);
    }

    let config = match bridge_config::load_config(&cli.config) {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "unrecoverable configuration error");
            return ExitCode::from(1);
        }
    };

    match run(cli, config, filter_handle).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %format!("{error:#}"), "bridge failed");
            ExitCode::from(1)
        }
    }
}

async fn run(
    cli: Cli,
    config: bridge_config::BridgeConfiguration,
    filter_handle: FilterHandle,
) -> Result<()> {
    tracing::info!(config = %cli.config.display(), "starting bridge");

    let supervisor = Supervisor::new(config.bridge);
    supervisor.start(&config.servers).await;

    let facade = BridgeFacade::new(supervisor.clone())
        .with_log_level_hook(log_level_hook(filter_handle));
    let endpoint = SseEndpoint::start(&cli.host, cli.port, facade).await?;

    println!("mcp-bridge listening on http://{}/", endpoint.addr);
    println!(
        "claude mcp add --transport sse bridge http://{}/",
        endpoint.addr
    );

    wait_for_shutdown(&cli.config, &supervisor).await?;

    endpoint.shutdown().await;
    supervisor.stop().await;
    tracing::info!("bridge shut down cleanly");
    Ok(())
}

/// Block until interrupted. On Unix, SIGHUP reloads the upstream set from
/// the config file without restarting the bridge.
async fn wait_for_shutdown(config_path: &Path, supervisor: &Arc<Supervisor>) -> Result<()> {
    #[cfg(unix)]
    {
        let mut sighup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .context("failed to install SIGHUP handler")?;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for interrupt")?;
                    tracing::info!("received interrupt, shutting down gracefully");
                    return Ok(());
                }
                _ = sighup.recv() => {
                    reload_upstreams(config_path, supervisor).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for interrupt")?;
        tracing::info!("received interrupt, shutting down gracefully");
        Ok(())
    }
}

async fn reload_upstreams(config_path: &Path, supervisor: &Arc<Supervisor>) {
    tracing::info!(config = %config_path.display(), "reloading upstream configuration");
    match bridge_config::load_config(config_path) {
        Ok(config) => {
            // Bridge-wide settings need a restart; only the server set is live.
            supervisor.update_servers(config.servers).await;
        }
        Err(error) => {
            tracing::error!(
                error = %format!("{error:#}"),
                "config reload failed, keeping the running upstream set"
            );
        }
    }
}

fn log_level_hook(filter_handle: FilterHandle) -> LogLevelHook {
    Arc::new(move |level| {
        let directive = filter_directive(&level);
        match filter_handle.modify(|filter| *filter = EnvFilter::new(directive)) {
            Ok(()) => tracing::info!(directive, "bridge log filter updated"),
            Err(error) => tracing::warn!(error = %error, "failed to update log filter"),
        }
    })
}

fn filter_directive(level: &LoggingLevel) -> &'static str {
    match level {
        LoggingLevel::Debug => "debug",
        LoggingLevel::Info | LoggingLevel::Notice => "info",
        LoggingLevel::Warning => "warn",
        LoggingLevel::Error
        | LoggingLevel::Critical
        | LoggingLevel::Alert
        | LoggingLevel::Emergency => "error",
    }
}

fn report_missing_config(path: &Path) {
    if path == Path::new("config.json") {
        eprintln!("No config.json found in the current directory.");
        eprintln!("Create a minimal one with:");
        eprintln!(
            "  echo '{{\"servers\": {{\"fetch\": {{\"command\": \"uvx\", \
             \"args\": [\"mcp-server-fetch\"]}}}}}}' > config.json"
        );
        eprintln!("or point at an existing file with --config path/to/config.json");
    } else {
        eprintln!("Bridge configuration file not found: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_levels_map_onto_filter_directives() {
        assert_eq!(filter_directive(&LoggingLevel::Debug), "debug");
        assert_eq!(filter_directive(&LoggingLevel::Notice), "info");
        assert_eq!(filter_directive(&LoggingLevel::Warning), "warn");
        assert_eq!(filter_directive(&LoggingLevel::Emergency), "error");
    }

    #[test]
    fn cli_defaults() {
        let cli = Cli::parse_from(["mcp-bridge"]);
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert_eq!(cli.host, "127.0.0.1");
        assert_eq!(cli.port, 8080);
        assert!(!cli.debug);
    }
}
