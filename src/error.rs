use std::io;

/// Errors crossing component boundaries.
///
/// Every public runtime operation returns either a value or one of these;
/// `code()` gives the stable string the tunnel and API boundary report, so
/// variants can be renamed without breaking remote callers.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("node type already registered: {0}")]
    DuplicateType(String),

    #[error("unknown node type: {0}")]
    UnknownType(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("flow already running: {0}")]
    AlreadyRunning(String),

    #[error("engine is terminal: {0}")]
    Terminal(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("node start failed: {node_id}: {message}")]
    Lifecycle { node_id: String, message: String },

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("resource: {0}")]
    Resource(String),

    #[error("device not provisioned")]
    NotProvisioned,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("command timed out: {id}")]
    CommandTimeout { id: String },

    #[error("cascade depth exceeded: {0}")]
    DepthExceeded(usize),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

impl RuntimeError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        RuntimeError::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable code string for the wire and for logs.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Validation(_) => "validation",
            RuntimeError::DuplicateType(_) => "duplicate_type",
            RuntimeError::UnknownType(_) => "unknown_type",
            RuntimeError::NotFound { .. } => "not_found",
            RuntimeError::AlreadyRunning(_) => "already_running",
            RuntimeError::Terminal(_) => "terminal",
            RuntimeError::Execution(_) => "execution",
            RuntimeError::Lifecycle { .. } => "lifecycle",
            RuntimeError::TypeMismatch { .. } => "type_mismatch",
            RuntimeError::Resource(_) => "resource",
            RuntimeError::NotProvisioned => "not_provisioned",
            RuntimeError::AuthenticationFailed(_) => "authentication_failed",
            RuntimeError::ProvisioningFailed(_) => "provisioning_failed",
            RuntimeError::CommandTimeout { .. } => "command_timeout",
            RuntimeError::DepthExceeded(_) => "depth_exceeded",
            RuntimeError::Io(_) => "io",
            RuntimeError::Serde(_) => "serialization",
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
