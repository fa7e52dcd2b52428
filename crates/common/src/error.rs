use thiserror::Error;

/// Canonical keymux error taxonomy used across crates.
///
/// Classification guidance:
/// - [`KmxError::Planning`]: query shape/name/semantic issues discovered before execution
/// - [`KmxError::Unsupported`]: syntactically valid but intentionally unimplemented behavior
/// - [`KmxError::Execution`]: runtime primitive evaluation or vindex mapping failures
/// - [`KmxError::Connection`]: backend connection I/O failures (trigger a health check)
/// - [`KmxError::Aborted`] / [`KmxError::Canceled`] / [`KmxError::FailedPrecondition`]:
///   connection-state violations that must cross the RPC boundary with their exact code
/// - [`KmxError::InvalidConfig`]: catalog/vschema/registry contract violations
#[derive(Debug, Error)]
pub enum KmxError {
    /// Query planning/analyzer failures.
    ///
    /// Examples:
    /// - unknown table or keyspace
    /// - semantic "not unshardable" analysis results
    #[error("planning error: {0}")]
    Planning(String),

    /// Valid request for a construct not implemented in the current version.
    ///
    /// Planner-facing unsupported constructs carry a stable error id as a
    /// message prefix (for example `VT12001`).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Runtime failures after planning succeeded.
    ///
    /// Examples:
    /// - vindex mapping/reversal on invalid values
    /// - primitive evaluation on malformed inputs
    #[error("execution error: {0}")]
    Execution(String),

    /// Backend connection I/O failure.
    ///
    /// Distinct from [`KmxError::Execution`] so callers can decide whether a
    /// MySQL health check is warranted.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid or inconsistent configuration/registry state.
    ///
    /// Examples:
    /// - vindex registration after the registry froze
    /// - duplicate vindex names
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation on a connection or transaction that has been aborted.
    #[error("{0}")]
    Aborted(String),

    /// Operation on a connection that is already closed.
    #[error("{0}")]
    Canceled(String),

    /// Operation whose precondition does not hold (for example tainting an
    /// already reserved connection).
    #[error("{0}")]
    FailedPrecondition(String),

    /// An error annotated with additional context while propagating.
    #[error("{context}: {source}")]
    Wrapped {
        /// Human-readable context prepended to the underlying message.
        context: String,
        /// The wrapped error; the machine-readable code is taken from here.
        source: Box<KmxError>,
    },
}

/// Machine-readable error code crossing the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Aborted connection or transaction.
    Aborted,
    /// Operation on a closed connection.
    Canceled,
    /// Precondition violation.
    FailedPrecondition,
    /// Invalid argument/configuration/plan request.
    InvalidArgument,
    /// Intentionally unimplemented construct.
    Unimplemented,
    /// Internal runtime failure.
    Internal,
    /// Backend unavailable.
    Unavailable,
}

impl KmxError {
    /// Machine-readable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            KmxError::Planning(_) | KmxError::InvalidConfig(_) => ErrorCode::InvalidArgument,
            KmxError::Unsupported(_) => ErrorCode::Unimplemented,
            KmxError::Execution(_) => ErrorCode::Internal,
            KmxError::Connection(_) => ErrorCode::Unavailable,
            KmxError::Aborted(_) => ErrorCode::Aborted,
            KmxError::Canceled(_) => ErrorCode::Canceled,
            KmxError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            KmxError::Wrapped { source, .. } => source.code(),
        }
    }

    /// Whether this is a backend connection failure that should trigger a
    /// MySQL health check.
    pub fn is_conn_err(&self) -> bool {
        match self {
            KmxError::Connection(_) => true,
            KmxError::Wrapped { source, .. } => source.is_conn_err(),
            _ => false,
        }
    }

    /// Annotate an error with propagation context, preserving its code.
    pub fn wrap(context: impl Into<String>, source: KmxError) -> KmxError {
        KmxError::Wrapped {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

impl From<&KmxError> for tonic::Code {
    fn from(err: &KmxError) -> Self {
        match err.code() {
            ErrorCode::Aborted => tonic::Code::Aborted,
            ErrorCode::Canceled => tonic::Code::Cancelled,
            ErrorCode::FailedPrecondition => tonic::Code::FailedPrecondition,
            ErrorCode::InvalidArgument => tonic::Code::InvalidArgument,
            ErrorCode::Unimplemented => tonic::Code::Unimplemented,
            ErrorCode::Internal => tonic::Code::Internal,
            ErrorCode::Unavailable => tonic::Code::Unavailable,
        }
    }
}

impl From<KmxError> for tonic::Status {
    fn from(err: KmxError) -> Self {
        tonic::Status::new((&err).into(), err.to_string())
    }
}

/// Standard keymux result alias.
pub type Result<T> = std::result::Result<T, KmxError>;
