//! Operation outcome taxonomy and internal failure signals.
//!
//! Handlers, queries and change trackers fail with [`ExecutionError`]. At the
//! root boundary every `ExecutionError` is converted into exactly one
//! [`OperationError`] by [`crate::classify`]; `OperationError` is the only
//! error type the public façade returns.

use std::fmt;
use std::sync::Arc;

use opflow_core::ValidationError;

use crate::cancel::OperationToken;
use crate::stack::OperationStackTrace;

type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

// ---------------------------------------------------------------------------
// OperationErrorKind
// ---------------------------------------------------------------------------

/// Outcome category of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationErrorKind {
    /// The client sent something the system cannot accept.
    BadRequest,
    /// The request was well-formed but violates a business rule.
    UnprocessableEntity,
    /// A concurrent change won; the client may retry.
    Conflict,
    /// The system failed; the client is not at fault.
    InternalServerError,
    /// A nested operation exceeded its timeout.
    GatewayTimeout,
    /// The caller cancelled the operation.
    Canceled,
    /// Rejected before execution because the processor is saturated. Only
    /// the load-shedding layer produces it, never the processor itself.
    ServiceUnavailable,
}

impl OperationErrorKind {
    /// HTTP-style status code for the outcome.
    #[must_use]
    pub fn status_code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::Conflict => 409,
            Self::UnprocessableEntity => 422,
            Self::Canceled => 499,
            Self::InternalServerError => 500,
            Self::ServiceUnavailable => 503,
            Self::GatewayTimeout => 504,
        }
    }

    /// Stable lowercase label, used for metrics and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::UnprocessableEntity => "unprocessable_entity",
            Self::Conflict => "conflict",
            Self::InternalServerError => "internal_server_error",
            Self::GatewayTimeout => "gateway_timeout",
            Self::Canceled => "canceled",
            Self::ServiceUnavailable => "service_unavailable",
        }
    }

    /// Returns `true` for outcomes that blame the caller's input.
    #[must_use]
    pub fn is_client_error(self) -> bool {
        matches!(
            self,
            Self::BadRequest | Self::UnprocessableEntity | Self::Conflict
        )
    }
}

impl fmt::Display for OperationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// OperationError
// ---------------------------------------------------------------------------

/// A classified operation failure.
///
/// Carries the stack trace captured where the failure happened and keeps the
/// original error as its [`source`](std::error::Error::source).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    kind: OperationErrorKind,
    message: String,
    stack_trace: OperationStackTrace,
    #[source]
    cause: Option<Cause>,
}

impl OperationError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(
        kind: OperationErrorKind,
        message: impl Into<String>,
        stack_trace: OperationStackTrace,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            stack_trace,
            cause: None,
        }
    }

    /// Shorthand for a [`OperationErrorKind::BadRequest`] error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>, stack_trace: OperationStackTrace) -> Self {
        Self::new(OperationErrorKind::BadRequest, message, stack_trace)
    }

    /// Shorthand for an [`OperationErrorKind::InternalServerError`] error.
    #[must_use]
    pub fn internal(message: impl Into<String>, stack_trace: OperationStackTrace) -> Self {
        Self::new(OperationErrorKind::InternalServerError, message, stack_trace)
    }

    /// Error returned by the load-shedding layer.
    #[must_use]
    pub fn service_unavailable() -> Self {
        Self::new(
            OperationErrorKind::ServiceUnavailable,
            "processor overloaded, try again later",
            OperationStackTrace::new(),
        )
    }

    /// Attaches the error that caused this one.
    #[must_use]
    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    /// The outcome category.
    #[must_use]
    pub fn kind(&self) -> OperationErrorKind {
        self.kind
    }

    /// Human-readable description.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stack trace at the point of failure.
    #[must_use]
    pub fn stack_trace(&self) -> &OperationStackTrace {
        &self.stack_trace
    }

    /// The original error, if any.
    #[must_use]
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }

    /// Shorthand for `kind().status_code()`.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }
}

// ---------------------------------------------------------------------------
// Internal failure signals
// ---------------------------------------------------------------------------

/// Application-defined failure that decides its own outcome.
///
/// The default [`classify`](ApplicationError::classify) reports
/// `BadRequest` when the whole chain was started by a client request and
/// `InternalServerError` otherwise.
pub trait ApplicationError: std::error::Error + Send + Sync + 'static {
    /// Chooses the outcome given the stack trace at the failure point.
    fn classify(&self, stack: &OperationStackTrace) -> OperationErrorKind {
        if stack.is_bad_request() {
            OperationErrorKind::BadRequest
        } else {
            OperationErrorKind::InternalServerError
        }
    }
}

/// Failure raised by application code that the classifier translates.
#[derive(Debug, Clone, thiserror::Error)]
pub enum InternalOperationError {
    /// A business rule rejected the request.
    #[error("business rule violated: {0}")]
    BusinessRuleViolation(String),
    /// A resource was changed concurrently.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    /// Content failed validation inside a handler.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Custom application error with its own classification.
    #[error(transparent)]
    Application(Arc<dyn ApplicationError>),
}

/// Signal that a cancellation token fired.
#[derive(Debug, Clone, thiserror::Error)]
#[error("operation was canceled")]
pub struct OperationCanceled {
    /// The token that was observed cancelled.
    pub token: OperationToken,
}

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Error returned by handlers, queries, change trackers and nested
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// Already classified; passes through every boundary unchanged.
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// Application failure awaiting classification.
    #[error("{error}")]
    Internal {
        /// The failure signal.
        error: InternalOperationError,
        /// Stack at the failure point, filled in by the nearest operation
        /// boundary when the raiser did not supply one.
        stack: Option<OperationStackTrace>,
    },
    /// A cancellation token fired.
    #[error("{canceled}")]
    Canceled {
        /// Which token fired.
        canceled: OperationCanceled,
        /// Stack at the point cancellation was observed.
        stack: Option<OperationStackTrace>,
    },
    /// Anything else. Always an internal-server-error.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ExecutionError {
    /// A business-rule violation.
    #[must_use]
    pub fn business_rule(message: impl Into<String>) -> Self {
        InternalOperationError::BusinessRuleViolation(message.into()).into()
    }

    /// A concurrency conflict, typically raised by a change tracker.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        InternalOperationError::ConcurrencyConflict(message.into()).into()
    }

    /// A custom application error.
    #[must_use]
    pub fn application(error: impl ApplicationError) -> Self {
        InternalOperationError::Application(Arc::new(error)).into()
    }

    /// Cancellation observed on `token`.
    #[must_use]
    pub fn canceled(token: OperationToken) -> Self {
        Self::Canceled {
            canceled: OperationCanceled { token },
            stack: None,
        }
    }

    /// Records `stack` as the failure point unless one is already set.
    #[must_use]
    pub fn at(self, stack: &OperationStackTrace) -> Self {
        match self {
            Self::Internal { error, stack: None } => Self::Internal {
                error,
                stack: Some(stack.clone()),
            },
            Self::Canceled {
                canceled,
                stack: None,
            } => Self::Canceled {
                canceled,
                stack: Some(stack.clone()),
            },
            other => other,
        }
    }

    /// Returns `true` for cancellation signals.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled { .. })
    }
}

impl From<InternalOperationError> for ExecutionError {
    fn from(error: InternalOperationError) -> Self {
        Self::Internal { error, stack: None }
    }
}

impl From<ValidationError> for ExecutionError {
    fn from(error: ValidationError) -> Self {
        InternalOperationError::Validation(error).into()
    }
}

impl From<OperationCanceled> for ExecutionError {
    fn from(canceled: OperationCanceled) -> Self {
        Self::Canceled {
            canceled,
            stack: None,
        }
    }
}
