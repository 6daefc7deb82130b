//! Configuration model and loading for the MCP bridge.

mod loader;
mod model;


pub use loader::{load_config, load_config_str};
pub use model::{
    AggregationSettings, BridgeConfiguration, BridgeSettings, CapabilityKind, ConflictResolution,
    FailoverSettings, HealthCheckConfig, McpLogLevel, UpstreamConfig, normalize_name,
};
