use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::Path;

use crate::model::{BridgeConfiguration, normalize_name};

/// Load and validate a bridge configuration file (JSON).
pub fn load_config(path: &Path) -> Result<BridgeConfiguration> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bridge config: {}", path.display()))?;
    load_config_str(&raw)
        .with_context(|| format!("failed to parse bridge config: {}", path.display()))
}

/// Parse and validate a bridge configuration from a JSON string.
///
/// Unknown fields are ignored; a missing `bridge` object means defaults; the
/// `servers` key is required but may be an empty map.
pub fn load_config_str(raw: &str) -> Result<BridgeConfiguration> {
    let config: BridgeConfiguration =
        serde_json::from_str(raw).context("invalid bridge configuration JSON")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &BridgeConfiguration) -> Result<()> {
    let mut normalized: HashMap<String, &str> = HashMap::new();
    for (name, server) in &config.servers {
        if server.command.trim().is_empty() {
            bail!("server '{name}': 'command' must not be empty");
        }
        if server.timeout == 0 {
            bail!("server '{name}': 'timeout' must be at least 1 second");
        }
        let key = normalize_name(name);
        if let Some(previous) = normalized.insert(key.clone(), name.as_str()) {
            bail!(
                "servers '{previous}' and '{name}' both normalize to '{key}'; \
                 rename one of them"
            );
        }
    }
    Ok(())
}
