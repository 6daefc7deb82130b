use rmcp::model::ErrorData;

/// Failure of a single upstream operation.
///
/// MCP-level errors returned by the upstream are part of the protocol
/// contract and carried verbatim; everything else (transport, library,
/// missing connection) collapses into an opaque transport failure.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream MCP error {}: {}", .0.code.0, .0.message)]
    Mcp(ErrorData),

    #[error("upstream transport failure: {0}")]
    Transport(String),

    #[error("no active upstream connection")]
    NotConnected,
}

impl From<rmcp::service::ServiceError> for UpstreamError {
    fn from(err: rmcp::service::ServiceError) -> Self {
        match err {
            rmcp::service::ServiceError::McpError(data) => Self::Mcp(data),
            other => Self::Transport(other.to_string()),
        }
    }
}

impl UpstreamError {
    /// True for errors that must reach the downstream caller unchanged.
    pub fn is_mcp(&self) -> bool {
        matches!(self, Self::Mcp(_))
    }
}

/// Aggregation failed while building a deconflicted view.
#[derive(Debug, thiserror::Error)]
pub enum AggregateError {
    #[error("{kind} identifier conflict: '{identifier}'")]
    Conflict {
        kind: &'static str,
        identifier: String,
    },
}

/// The router could not resolve an externally visible identifier.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("no active upstream provides {kind} '{identifier}'")]
    NotFound {
        kind: &'static str,
        identifier: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::ErrorData;

    #[test]
    fn mcp_error_display_includes_code_and_message() {
        let err = UpstreamError::Mcp(ErrorData::invalid_params("bad args", None));
        let text = err.to_string();
        assert!(text.contains("bad args"), "got: {text}");
        assert!(err.is_mcp());
    }

    #[test]
    fn transport_error_is_not_mcp() {
        let err = UpstreamError::Transport("connection closed".to_string());
        assert!(!err.is_mcp());
        assert_eq!(
            err.to_string(),
            "upstream transport failure: connection closed"
        );
    }

    #[test]
    fn route_error_display() {
        let err = RouteError::NotFound {
            kind: "tool",
            identifier: "gh__search".to_string(),
        };
        assert_eq!(err.to_string(), "no active upstream provides tool 'gh__search'");
    }
}
