//! Engine error taxonomy (spec §7).

/// The canonical kinds of failure the dispatcher can classify a request
/// into. Each maps to a specific HTTP status and envelope shape in
/// [`crate::response`].
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// URL does not match any configured prefix or handler.
    #[error("no handler for request")]
    NoHandler,

    /// Client violated a documented rule: body on GET/DELETE, multiple
    /// files, wrong content-type for PATCH, invalid pagination order,
    /// malformed patch, etc. Carries the status to use and a message.
    #[error("{message}")]
    ClientError { status: u16, message: String },

    /// Resource-level absence on PATCH/DELETE/GET.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// A custom or post-handler was expected to write a response but did
    /// not.
    #[error("handler did not send any response")]
    ManuallyHandled,

    /// Internal signal: the resolved file is not JSON and should be
    /// streamed as-is. The dispatcher converts this into the 200
    /// streaming path; it is never surfaced to a client.
    #[error("file requires streaming")]
    ReadFile { path: std::path::PathBuf, mime: &'static str },

    /// Middleware chain exhausted its error list with an unresolved
    /// error.
    #[error("middleware error: {0}")]
    MiddlewareError(String),

    /// Gateway timeout elapsed before the pipeline completed.
    #[error("gateway timeout")]
    Timeout,

    /// Any other unexpected failure (e.g. filesystem I/O).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn client(status: u16, message: impl Into<String>) -> Self {
        EngineError::ClientError { status, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        EngineError::NotFound { message: message.into() }
    }

    /// HTTP status this error maps to, per spec §7.
    pub fn status(&self) -> u16 {
        match self {
            EngineError::NoHandler => 404,
            EngineError::ClientError { status, .. } => *status,
            EngineError::NotFound { .. } => 404,
            EngineError::ManuallyHandled => 500,
            EngineError::ReadFile { .. } => 200,
            EngineError::MiddlewareError(_) => 500,
            EngineError::Timeout => 504,
            EngineError::Internal(_) => 500,
        }
    }

    /// Human message for the error envelope.
    pub fn message(&self) -> String {
        match self {
            EngineError::NoHandler => "No handler matched this request".to_string(),
            EngineError::ClientError { message, .. } => message.clone(),
            EngineError::NotFound { message } => message.clone(),
            EngineError::ManuallyHandled => {
                "FS REST Handle request not send any response".to_string()
            }
            EngineError::ReadFile { .. } => String::new(),
            EngineError::MiddlewareError(msg) => msg.clone(),
            EngineError::Timeout => "Gateway Timeout".to_string(),
            EngineError::Internal(msg) => msg.clone(),
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::client(400, format!("PARSE_ERROR: {e}"))
    }
}

/// Canonical reason phrase for a status code, used in the error envelope's
/// `error` field.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        500 => "Internal Server Error",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
