//! Error types and gRPC status mapping.
//!
//! The harness separates three failure classes:
//! - construction-time misconfiguration (duplicate or missing tables, bad config,
//!   an unavailable port), which must stop the harness before it serves;
//! - request-level conditions raised by the P4Runtime server and mapped to
//!   gRPC status codes;
//! - apply-path outcomes, which never surface here: they travel inside the
//!   acknowledgment's [`ResponseCode`](crate::swss::notifier::ResponseCode).

use thiserror::Error;
use tonic::{Code, Status};

/// Common harness error conditions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarnessError {
    /// A table name was registered twice in one database grouping.
    #[error("duplicate table registration: {table}")]
    DuplicateTable { table: String },

    /// A table required by a component is not registered.
    #[error("missing required table: {table}")]
    MissingTable { table: String },

    /// Configuration value rejected during validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The RPC transport could not be brought up.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A mutation was offered to a queue that no longer accepts work.
    #[error("mutation queue for table {table} is closed")]
    QueueClosed { table: String },

    /// Malformed or semantically invalid request.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Referenced entity does not exist.
    #[error("not found: {message}")]
    NotFound { message: String },

    /// Entity already exists.
    #[error("already exists: {message}")]
    AlreadyExists { message: String },

    /// Request is valid but the system is not in a state to serve it.
    #[error("failed precondition: {message}")]
    FailedPrecondition { message: String },

    /// Caller is not allowed to perform the request.
    #[error("permission denied: {message}")]
    PermissionDenied { message: String },

    /// Request uses a feature this server does not implement.
    #[error("unimplemented: {message}")]
    Unimplemented { message: String },

    /// No acknowledgment arrived before the response timeout.
    #[error("deadline exceeded: {message}")]
    DeadlineExceeded { message: String },

    /// Backing store unavailable.
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// Backing store out of resources.
    #[error("resource exhausted: {message}")]
    ResourceExhausted { message: String },

    /// Internal invariant violated.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HarnessError {
    /// Create an InvalidArgument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a NotFound error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create an AlreadyExists error.
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::AlreadyExists {
            message: message.into(),
        }
    }

    /// Create a FailedPrecondition error.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Create a PermissionDenied error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create an Unimplemented error.
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::Unimplemented {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an InvalidConfig error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Check if this error is a construction-time configuration fault.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTable { .. } | Self::MissingTable { .. } | Self::InvalidConfig { .. }
        )
    }

    /// Message without the variant prefix, as reported to P4Runtime clients.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidArgument { message }
            | Self::NotFound { message }
            | Self::AlreadyExists { message }
            | Self::FailedPrecondition { message }
            | Self::PermissionDenied { message }
            | Self::Unimplemented { message }
            | Self::DeadlineExceeded { message }
            | Self::Unavailable { message }
            | Self::ResourceExhausted { message }
            | Self::Internal { message } => message.clone(),
            _ => self.to_string(),
        }
    }
}

/// Result type using HarnessError.
pub type HarnessResult<T> = Result<T, HarnessError>;

// ============================================================================
// gRPC mapping
// ============================================================================

/// Maps harness errors onto gRPC status codes.
pub struct GrpcErrorMapping;

impl GrpcErrorMapping {
    /// Map a HarnessError to a gRPC status code.
    pub fn to_grpc_code(error: &HarnessError) -> Code {
        match error {
            HarnessError::DuplicateTable { .. }
            | HarnessError::MissingTable { .. }
            | HarnessError::InvalidConfig { .. } => Code::FailedPrecondition,
            HarnessError::Transport { .. } => Code::Unavailable,
            HarnessError::QueueClosed { .. } => Code::Unavailable,
            HarnessError::InvalidArgument { .. } => Code::InvalidArgument,
            HarnessError::NotFound { .. } => Code::NotFound,
            HarnessError::AlreadyExists { .. } => Code::AlreadyExists,
            HarnessError::FailedPrecondition { .. } => Code::FailedPrecondition,
            HarnessError::PermissionDenied { .. } => Code::PermissionDenied,
            HarnessError::Unimplemented { .. } => Code::Unimplemented,
            HarnessError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            HarnessError::Unavailable { .. } => Code::Unavailable,
            HarnessError::ResourceExhausted { .. } => Code::ResourceExhausted,
            HarnessError::Internal { .. } => Code::Internal,
        }
    }

    /// Upper-case code name used in batch error summaries (`#1: INVALID_ARGUMENT: ...`).
    pub fn code_name(code: Code) -> &'static str {
        match code {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

/// Convert a HarnessError to a tonic Status.
pub fn harness_error_to_status(e: HarnessError) -> Status {
    let code = GrpcErrorMapping::to_grpc_code(&e);
    Status::new(code, e.message())
}

impl From<HarnessError> for Status {
    fn from(e: HarnessError) -> Self {
        harness_error_to_status(e)
    }
}
