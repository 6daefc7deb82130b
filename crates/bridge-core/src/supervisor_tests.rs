use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bridge_config::{BridgeSettings, FailoverSettings, HealthCheckConfig, UpstreamConfig};

use crate::health;
use crate::session::UpstreamStatus;
use crate::supervisor::Supervisor;

const TOOL_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"__TOOL__","description":"mock tool","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"__REPLY__"}]}}\n' "$id"
      ;;
  esac
done
"#;

const CRASHABLE_SERVER: &str = r#"#!/bin/sh
flag="__FLAG__"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      if [ -f "$flag" ]; then
        exit 1
      fi
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"t","description":"mock tool","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
  esac
done
"#;

fn write_script(dir: &Path, file_name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(file_name);
    std::fs::write(&path, body)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }
    Ok(path)
}

fn tool_server_script(dir: &Path, file_name: &str, tool: &str, reply: &str) -> Result<PathBuf> {
    let body = TOOL_SERVER.replace("__TOOL__", tool).replace("__REPLY__", reply);
    write_script(dir, file_name, &body)
}

fn script_config(script: &Path) -> UpstreamConfig {
    UpstreamConfig::for_command("sh", vec![script.to_string_lossy().into_owned()])
}

fn quiet_settings() -> BridgeSettings {
    BridgeSettings {
        failover: FailoverSettings {
            enabled: false,
            max_failures: None,
        },
        ..BridgeSettings::default()
    }
}

async fn wait_for_status(
    supervisor: &Arc<Supervisor>,
    name: &str,
    expected: UpstreamStatus,
) -> bool {
    for _ in 0..100 {
        if let Some(session) = supervisor.session(name).await
            && session.status().await == expected
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn start_connects_enabled_upstreams_and_reports_status() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = tool_server_script(temp.path(), "mock.sh", "echo_tool", "pong")?;

    let mut disabled = script_config(&script);
    disabled.enabled = false;

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([
            ("mock".to_string(), script_config(&script)),
            ("off".to_string(), disabled),
        ]))
        .await;

    assert_eq!(supervisor.connected_count().await, 1);

    let report = supervisor.status().await;
    // Disabled upstreams never get a session record at startup.
    assert_eq!(report.len(), 1);
    let mock = &report["mock"];
    assert_eq!(mock.status, UpstreamStatus::Connected);
    assert_eq!(mock.capabilities.tools, 1);
    assert_eq!(mock.failure_count, 0);

    supervisor.stop().await;
    let session = supervisor.session("mock").await.unwrap();
    assert_eq!(session.status().await, UpstreamStatus::Disconnected);
    assert!(session.tools().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn normalized_names_key_the_session_map() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = tool_server_script(temp.path(), "mock.sh", "t", "pong")?;

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([(
            "My.Server".to_string(),
            script_config(&script),
        )]))
        .await;

    let session = supervisor.session("My.Server").await.unwrap();
    assert_eq!(session.name(), "my_server");
    assert!(supervisor.session("my_server").await.is_some());

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn reloading_the_current_config_is_a_no_op() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = tool_server_script(temp.path(), "mock.sh", "t", "pong")?;
    let config = script_config(&script);

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([("a".to_string(), config.clone())]))
        .await;

    let before = supervisor.session("a").await.unwrap();
    assert_eq!(before.status().await, UpstreamStatus::Connected);

    supervisor
        .update_servers(HashMap::from([("a".to_string(), config)]))
        .await;

    let after = supervisor.session("a").await.unwrap();
    assert!(Arc::ptr_eq(&before, &after), "session was recreated");
    assert_eq!(after.status().await, UpstreamStatus::Connected);
    assert_eq!(after.health_snapshot().await.restart_count, 0);

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn live_reconfiguration_swaps_upstreams_without_bridge_restart() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script_a = tool_server_script(temp.path(), "a.sh", "alpha", "from-a")?;
    let script_b = tool_server_script(temp.path(), "b.sh", "beta", "from-b")?;
    let script_c = tool_server_script(temp.path(), "c.sh", "gamma", "from-c")?;

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([
            ("a".to_string(), script_config(&script_a)),
            ("b".to_string(), script_config(&script_b)),
        ]))
        .await;
    assert_eq!(supervisor.connected_count().await, 2);

    supervisor
        .update_servers(HashMap::from([
            ("b".to_string(), script_config(&script_b)),
            ("c".to_string(), script_config(&script_c)),
        ]))
        .await;

    assert!(supervisor.session("a").await.is_none());
    assert!(wait_for_status(&supervisor, "c", UpstreamStatus::Connected).await);

    let snapshots = supervisor.connected_snapshots().await;
    let mut names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["b", "c"]);

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn disabling_an_upstream_disconnects_and_marks_it() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = tool_server_script(temp.path(), "mock.sh", "t", "pong")?;
    let config = script_config(&script);

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([("a".to_string(), config.clone())]))
        .await;

    let mut disabled = config;
    disabled.enabled = false;
    supervisor
        .update_servers(HashMap::from([("a".to_string(), disabled)]))
        .await;

    let session = supervisor.session("a").await.unwrap();
    assert_eq!(session.status().await, UpstreamStatus::Disabled);
    assert!(session.tools().await.is_empty());
    assert!(supervisor.connected_snapshots().await.is_empty());

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn probe_failures_remove_the_upstream_from_the_aggregate() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let flag = temp.path().join("crash.flag");
    let body = CRASHABLE_SERVER.replace("__FLAG__", &flag.to_string_lossy());
    let script = write_script(temp.path(), "crash.sh", &body)?;

    let mut config = script_config(&script);
    config.health_check = HealthCheckConfig {
        enabled: true,
        max_consecutive_failures: 1,
        auto_restart: false,
        timeout_ms: 2_000,
        ..HealthCheckConfig::default()
    };

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([("flaky".to_string(), config)]))
        .await;
    assert_eq!(supervisor.connected_count().await, 1);

    std::fs::write(&flag, "")?;
    health::failover_pass(&supervisor).await;

    let session = supervisor.session("flaky").await.unwrap();
    assert_eq!(session.status().await, UpstreamStatus::Failed);
    assert!(supervisor.connected_snapshots().await.is_empty());
    let health = session.health_snapshot().await;
    assert_eq!(health.consecutive_failures, 1);
    assert_eq!(health.restart_count, 0);
    assert!(health.last_error.is_some());

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn auto_restart_recovers_a_failed_upstream() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let flag = temp.path().join("crash.flag");
    let body = CRASHABLE_SERVER.replace("__FLAG__", &flag.to_string_lossy());
    let script = write_script(temp.path(), "crash.sh", &body)?;

    let mut config = script_config(&script);
    config.health_check = HealthCheckConfig {
        enabled: true,
        max_consecutive_failures: 1,
        auto_restart: true,
        max_restart_attempts: 2,
        restart_delay_ms: 100,
        timeout_ms: 2_000,
        ..HealthCheckConfig::default()
    };

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([("flaky".to_string(), config)]))
        .await;
    assert_eq!(supervisor.connected_count().await, 1);

    std::fs::write(&flag, "")?;
    health::failover_pass(&supervisor).await;
    // Let the replacement child come up healthy.
    std::fs::remove_file(&flag)?;

    assert!(
        wait_for_status(&supervisor, "flaky", UpstreamStatus::Connected).await,
        "upstream did not recover"
    );

    let session = supervisor.session("flaky").await.unwrap();
    let health = session.health_snapshot().await;
    assert_eq!(health.restart_count, 1);
    assert!(health.last_restart.is_some());
    assert_eq!(
        session.tools().await[0].name.as_ref(),
        "t",
        "capability did not reappear after restart"
    );

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn concurrent_restart_requests_run_once() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let flag = temp.path().join("crash.flag");
    let body = CRASHABLE_SERVER.replace("__FLAG__", &flag.to_string_lossy());
    let script = write_script(temp.path(), "crash.sh", &body)?;

    let mut config = script_config(&script);
    config.health_check = HealthCheckConfig {
        enabled: true,
        max_consecutive_failures: 1,
        auto_restart: false,
        restart_delay_ms: 100,
        timeout_ms: 2_000,
        ..HealthCheckConfig::default()
    };

    let supervisor = Supervisor::new(quiet_settings());
    supervisor
        .start(&HashMap::from([("flaky".to_string(), config)]))
        .await;

    std::fs::write(&flag, "")?;
    health::failover_pass(&supervisor).await;
    std::fs::remove_file(&flag)?;

    let session = supervisor.session("flaky").await.unwrap();
    assert_eq!(session.status().await, UpstreamStatus::Failed);

    // Both callers race for the restart lock; the loser must observe the
    // recovered status and back off.
    tokio::join!(
        health::restart_upstream(supervisor.clone(), session.clone()),
        health::restart_upstream(supervisor.clone(), session.clone()),
    );

    assert_eq!(session.status().await, UpstreamStatus::Connected);
    assert_eq!(session.health_snapshot().await.restart_count, 1);

    supervisor.stop().await;
    Ok(())
}
