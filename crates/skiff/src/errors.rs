use thiserror::Error;

/// Errors raised by the agent loop and its tools.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Tool execution failed: {0}")]
    ExecutionError(String),

    #[error("Invalid history: {0}")]
    InvalidHistory(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

/// Errors raised while talking to the model endpoint.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request failed with status {status}: {body}")]
    Http { status: u16, body: String },

    #[error("API Error ({kind}): {message}")]
    Api { kind: String, message: String },

    #[error("Vendor API Error (code {code}): {message}")]
    Vendor { code: i64, message: String },

    #[error("Vendor API Error (code 1008): {0}. Insufficient balance, please recharge your account")]
    InsufficientBalance(String),

    #[error("Vendor API Error (code 2013): {message}. Model '{model}' is not supported")]
    ModelNotSupported { model: String, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether another attempt at the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Network(_) | ProviderError::Api { .. } | ProviderError::Vendor { .. } => {
                true
            }
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::InsufficientBalance(_)
            | ProviderError::ModelNotSupported { .. }
            | ProviderError::InvalidRequest(_)
            | ProviderError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Errors raised by the background process registry and shell execution.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("Background process not found: {0}")]
    NotFound(String),

    #[error("Command timed out after {0} seconds")]
    Timeout(u64),

    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    #[error("Invalid filter pattern: {0}")]
    InvalidFilter(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Errors raised while talking to an external tool server over stdio.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum McpError {
    #[error("Invalid MCP config: {0}")]
    Config(String),

    #[error("Failed to start MCP server '{server}': {message}")]
    Spawn { server: String, message: String },

    #[error("Transport error with MCP server '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("MCP server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("MCP server '{0}' did not complete the handshake in time")]
    Timeout(String),

    #[error("MCP server '{0}' exited")]
    Terminated(String),

    #[error("Invalid MCP response: {0}")]
    InvalidResponse(String),
}

pub type McpResult<T> = Result<T, McpError>;
