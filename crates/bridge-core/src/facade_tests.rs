use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use bridge_config::{BridgeSettings, ConflictResolution, FailoverSettings, UpstreamConfig};
use rmcp::model::CallToolRequestParam;

use crate::facade::{BridgeFacade, TagFilter, TagMode, dedup_preserving_order};
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

const MCP_ERROR_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"t","description":"mock tool","inputSchema":{"type":"object","properties":{}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32000,"message":"nope"}}\n' "$id"
      ;;
  esac
done
"#;

fn write_tool_server(dir: &Path, file_name: &str, tool: &str, reply: &str) -> Result<PathBuf> {
    let body = TOOL_SERVER.replace("__TOOL__", tool).replace("__REPLY__", reply);
    write_script(dir, file_name, &body)
}

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

fn script_config(script: &Path, priority: i64) -> UpstreamConfig {
    let mut config =
        UpstreamConfig::for_command("sh", vec![script.to_string_lossy().into_owned()]);
    config.priority = priority;
    config
}

fn settings_without_failover() -> BridgeSettings {
    BridgeSettings {
        failover: FailoverSettings {
            enabled: false,
            max_failures: None,
        },
        ..BridgeSettings::default()
    }
}

async fn bridge_with(
    settings: BridgeSettings,
    servers: HashMap<String, UpstreamConfig>,
) -> (Arc<Supervisor>, BridgeFacade) {
    let supervisor = Supervisor::new(settings);
    supervisor.start(&servers).await;
    let facade = BridgeFacade::new(supervisor.clone());
    (supervisor, facade)
}

fn call(name: &str) -> CallToolRequestParam {
    CallToolRequestParam {
        name: name.to_owned().into(),
        arguments: None,
    }
}

fn reply_text(result: &rmcp::model::CallToolResult) -> String {
    result.content[0]
        .as_text()
        .map(|text| text.text.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn priority_wins_conflicts_and_routes_to_the_winner() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script_a = write_tool_server(temp.path(), "a.sh", "search", "from-a")?;
    let script_b = write_tool_server(temp.path(), "b.sh", "search", "from-b")?;

    let (supervisor, facade) = bridge_with(
        settings_without_failover(),
        HashMap::from([
            ("a".to_string(), script_config(&script_a, 1)),
            ("b".to_string(), script_config(&script_b, 10)),
        ]),
    )
    .await;

    let tools = facade.list_tools_internal().await;
    let names: Vec<String> = tools.iter().map(|tool| tool.name.to_string()).collect();
    assert_eq!(names, vec!["search".to_string()]);

    let result = facade.call_tool_internal(call("search")).await.unwrap();
    assert_eq!(reply_text(&result), "from-a");

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn default_namespace_isolates_identically_named_tools() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script_a = write_tool_server(temp.path(), "a.sh", "search", "from-a")?;
    let script_b = write_tool_server(temp.path(), "b.sh", "search", "from-b")?;

    let settings = BridgeSettings {
        default_namespace: true,
        ..settings_without_failover()
    };
    let (supervisor, facade) = bridge_with(
        settings,
        HashMap::from([
            ("a".to_string(), script_config(&script_a, 1)),
            ("b".to_string(), script_config(&script_b, 10)),
        ]),
    )
    .await;

    let tools = facade.list_tools_internal().await;
    let names: Vec<String> = tools.iter().map(|tool| tool.name.to_string()).collect();
    assert_eq!(names, vec!["a__search".to_string(), "b__search".to_string()]);

    let result = facade.call_tool_internal(call("b__search")).await.unwrap();
    assert_eq!(reply_text(&result), "from-b");

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn upstream_mcp_errors_reach_the_caller_verbatim() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_script(temp.path(), "err.sh", MCP_ERROR_SERVER)?;

    let (supervisor, facade) = bridge_with(
        settings_without_failover(),
        HashMap::from([("err".to_string(), script_config(&script, 1))]),
    )
    .await;

    let error = facade.call_tool_internal(call("t")).await.unwrap_err();
    assert_eq!(error.code.0, -32000);
    assert_eq!(error.message, "nope");

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_tool_is_a_not_found_error() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_tool_server(temp.path(), "a.sh", "search", "from-a")?;

    let (supervisor, facade) = bridge_with(
        settings_without_failover(),
        HashMap::from([("a".to_string(), script_config(&script, 1))]),
    )
    .await;

    let error = facade.call_tool_internal(call("missing")).await.unwrap_err();
    assert!(
        error.message.contains("no active upstream provides tool"),
        "got: {}",
        error.message
    );

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn disabled_aggregation_hides_tools() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script = write_tool_server(temp.path(), "a.sh", "search", "from-a")?;

    let mut settings = settings_without_failover();
    settings.aggregation.tools = false;
    let (supervisor, facade) = bridge_with(
        settings,
        HashMap::from([("a".to_string(), script_config(&script, 1))]),
    )
    .await;

    assert!(facade.list_tools_internal().await.is_empty());

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn conflict_error_policy_degrades_listing_to_empty() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script_a = write_tool_server(temp.path(), "a.sh", "dup", "from-a")?;
    let script_b = write_tool_server(temp.path(), "b.sh", "dup", "from-b")?;

    let settings = BridgeSettings {
        conflict_resolution: ConflictResolution::Error,
        ..settings_without_failover()
    };
    let (supervisor, facade) = bridge_with(
        settings,
        HashMap::from([
            ("a".to_string(), script_config(&script_a, 1)),
            ("b".to_string(), script_config(&script_b, 2)),
        ]),
    )
    .await;

    // The aggregate raises; the list handler answers with availability.
    assert!(facade.list_tools_internal().await.is_empty());

    supervisor.stop().await;
    Ok(())
}

#[tokio::test]
async fn tag_filtered_facade_sees_a_subset() -> Result<()> {
    let temp = tempfile::tempdir()?;
    let script_dev = write_tool_server(temp.path(), "dev.sh", "dev_tool", "dev")?;
    let script_prod = write_tool_server(temp.path(), "prod.sh", "prod_tool", "prod")?;

    let mut dev = script_config(&script_dev, 1);
    dev.tags = vec!["dev".to_string()];
    let mut prod = script_config(&script_prod, 2);
    prod.tags = vec!["prod".to_string()];

    let supervisor = Supervisor::new(settings_without_failover());
    supervisor
        .start(&HashMap::from([
            ("dev".to_string(), dev),
            ("prod".to_string(), prod),
        ]))
        .await;

    let facade = BridgeFacade::with_tag_filter(
        supervisor.clone(),
        TagFilter::new(vec!["dev".to_string()], TagMode::Intersection),
    );

    let tools = facade.list_tools_internal().await;
    let names: Vec<String> = tools.iter().map(|tool| tool.name.to_string()).collect();
    assert_eq!(names, vec!["dev_tool".to_string()]);

    supervisor.stop().await;
    Ok(())
}

#[test]
fn dedup_preserves_first_occurrence_order() {
    let values = vec![
        "alpha".to_string(),
        "beta".to_string(),
        "alpha".to_string(),
        "gamma".to_string(),
        "beta".to_string(),
    ];
    assert_eq!(
        dedup_preserving_order(values),
        vec![
            "alpha".to_string(),
            "beta".to_string(),
            "gamma".to_string()
        ]
    );
}

#[test]
fn tag_filter_intersection_requires_all_tags() {
    let filter = TagFilter::new(
        vec!["dev".to_string(), "vcs".to_string()],
        TagMode::Intersection,
    );
    assert!(filter.matches(&["dev".to_string(), "vcs".to_string(), "x".to_string()]));
    assert!(!filter.matches(&["dev".to_string()]));
    assert!(!filter.matches(&[]));
}

#[test]
fn tag_filter_union_requires_any_tag() {
    let filter = TagFilter::new(vec!["dev".to_string(), "vcs".to_string()], TagMode::Union);
    assert!(filter.matches(&["vcs".to_string()]));
    assert!(!filter.matches(&["prod".to_string()]));
    assert!(!filter.matches(&[]));
}
