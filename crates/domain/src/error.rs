/// Shared error type used across the engine.
///
/// Each variant corresponds to one entry in the error taxonomy: structural
/// violations are distinct from recoverable, tool-local failures so callers
/// can match exhaustively instead of string-sniffing.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("validation: {0}")]
    Validation(String),

    #[error("tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("plan generation failed: {0}")]
    PlanGeneration(String),

    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    #[error("history compression failed: {0}")]
    Compression(String),

    #[error("state consistency: {0}")]
    StateConsistency(String),

    #[error("cancelled")]
    Cancellation,

    #[error("step budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error represents a transient condition the tool
    /// invocation envelope (`ag-tools`) should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Http(_) | Error::Provider { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
