//! Multi-upstream connection management and capability aggregation for the
//! MCP bridge: upstream sessions over stdio children, health supervision
//! with keep-alives and restarts, deconflicted capability views, request
//! routing, and live reconfiguration.

mod aggregate;
mod error;
mod facade;
mod health;
mod notify;
mod reconfig;
mod router;
mod session;
mod supervisor;

pub use error::{AggregateError, RouteError, UpstreamError};
pub use facade::{BridgeFacade, LogLevelHook, TagFilter, TagMode};
pub use session::{HealthSnapshot, UpstreamSession, UpstreamStatus};
pub use supervisor::{
    CapabilityCounts, ConfigEcho, HealthCounters, Supervisor, UpstreamStatusReport,
};
