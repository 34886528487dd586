//! Failure classification.
//!
//! Converts an [`ExecutionError`] into exactly one [`OperationError`] at an
//! operation boundary, consulting the stack trace captured at the failure
//! point and the boundary's own cancellation token.

use std::sync::Arc;

use crate::cancel::OperationToken;
use crate::error::{ExecutionError, InternalOperationError, OperationError, OperationErrorKind};
use crate::stack::{OperationKind, OperationStackTrace};

/// Classifies `error` at the boundary owning `boundary_token`.
///
/// `boundary_stack` is used when the error carries no stack of its own.
#[must_use]
pub fn classify(
    error: ExecutionError,
    boundary_token: &OperationToken,
    boundary_stack: &OperationStackTrace,
) -> OperationError {
    match error {
        ExecutionError::Operation(classified) => classified,
        ExecutionError::Canceled { canceled, stack } => {
            let stack = stack.unwrap_or_else(|| boundary_stack.clone());
            let kind = classify_cancellation(&canceled.token, boundary_token);
            OperationError::new(kind, canceled.to_string(), stack).with_cause(Arc::new(canceled))
        }
        ExecutionError::Internal { error, stack } => {
            let stack = stack.unwrap_or_else(|| boundary_stack.clone());
            let kind = classify_internal(&error, &stack);
            OperationError::new(kind, error.to_string(), stack).with_cause(Arc::new(error))
        }
        ExecutionError::Unexpected(error) => {
            let cause: Box<dyn std::error::Error + Send + Sync> = error.into();
            OperationError::internal(cause.to_string(), boundary_stack.clone())
                .with_cause(Arc::from(cause))
        }
    }
}

/// Outcome for a cancellation observed on `observed`, seen from the boundary
/// owning `boundary`.
#[must_use]
pub fn classify_cancellation(
    observed: &OperationToken,
    boundary: &OperationToken,
) -> OperationErrorKind {
    if observed == boundary {
        return OperationErrorKind::Canceled;
    }
    if !observed.is_descendant_of(boundary) {
        return OperationErrorKind::InternalServerError;
    }
    // Any token between the observed one and the boundary may have fired its
    // timeout and propagated the cancellation downwards.
    let mut current = Some(observed);
    while let Some(token) = current {
        if token == boundary {
            break;
        }
        if token.is_timed_out() {
            return OperationErrorKind::GatewayTimeout;
        }
        current = token.parent();
    }
    if boundary.is_cancelled() {
        OperationErrorKind::Canceled
    } else {
        OperationErrorKind::InternalServerError
    }
}

/// Outcome for an application failure raised with `stack` as the failure
/// point.
#[must_use]
pub fn classify_internal(
    error: &InternalOperationError,
    stack: &OperationStackTrace,
) -> OperationErrorKind {
    if stack
        .current()
        .is_some_and(|frame| frame.kind() == OperationKind::Query)
    {
        return OperationErrorKind::InternalServerError;
    }
    let client_chain = stack.is_bad_request();
    match error {
        InternalOperationError::BusinessRuleViolation(_) if client_chain => {
            OperationErrorKind::UnprocessableEntity
        }
        InternalOperationError::ConcurrencyConflict(_) if client_chain => {
            OperationErrorKind::Conflict
        }
        InternalOperationError::Validation(_) if client_chain => OperationErrorKind::BadRequest,
        InternalOperationError::Application(app) => app.classify(stack),
        _ => OperationErrorKind::InternalServerError,
    }
}
