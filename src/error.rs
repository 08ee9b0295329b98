use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum ParamedicError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unable to find an available port in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("Failed to probe port {port}: {source}")]
    PortProbe {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to bind local server on port {port}: {source}")]
    ServerBind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("No connection URL available: {0}")]
    ConnectionUrlUnavailable(String),

    #[error("Session has been shut down")]
    SessionClosed,

    #[error("Process error: {0}")]
    Process(String),

    #[error("`{command}` exited with code {code}")]
    CommandFailed { command: String, code: i32 },

    #[error("Unable to build the project: {0}")]
    BuildFailed(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Interrupted by the user")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse classification used by the orchestrator to pick an exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input or a user interrupt; no further target runs.
    Fatal,
    /// Something in the environment failed while running a target.
    Infrastructure,
}

impl ParamedicError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParamedicError::Config(_)
            | ParamedicError::ConnectionUrlUnavailable(_)
            | ParamedicError::Interrupted => ErrorKind::Fatal,
            _ => ErrorKind::Infrastructure,
        }
    }
}

impl IntoResponse for ParamedicError {
    fn into_response(self) -> Response {
        let status = match &self {
            ParamedicError::SessionClosed => StatusCode::SERVICE_UNAVAILABLE,
            ParamedicError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
        });

        (status, axum::Json(body)).into_response()
    }
}
