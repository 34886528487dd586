//! Query execution.
//!
//! A query runs in its own frame with a read-only context: no unit of work
//! and no output bus. Nested queries are sealed at their own boundary, so an
//! application failure inside a query always reaches the caller as an
//! already-classified internal-server-error. Cancellation passes through
//! unclassified and is judged by the root.

use std::any::{type_name, Any};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use opflow_core::{Message, MessageDirection, MessageKind};
use tracing::debug;

use super::result::QueryOperationResult;
use crate::cancel::TimeoutGuard;
use crate::classify::classify;
use crate::context::{OperationContext, QueryContext};
use crate::error::{ExecutionError, OperationError};
use crate::handler::{MessageQuery, Query};
use crate::stack::StackFrame;

/// A query frame plus the timer backing its timeout, if any.
struct QueryScope {
    context: QueryContext,
    _timeout: Option<TimeoutGuard>,
}

impl QueryScope {
    fn enter(
        parent: &OperationContext,
        component: &'static str,
        message: Option<Message>,
        timeout: Option<Duration>,
    ) -> Self {
        let (token, guard) = match timeout {
            Some(timeout) => {
                let (token, guard) = parent.token().child_with_timeout(timeout);
                (token, Some(guard))
            }
            None => (parent.token().clone(), None),
        };
        let frame = StackFrame::query(component, message, token.clone());
        debug!(query = component, timeout = ?timeout, "executing query");
        Self {
            context: QueryContext::new(parent.with_token(token).push(frame)),
            _timeout: guard,
        }
    }

    /// Runs `execution` between two cancellation checks.
    async fn run<R>(
        &self,
        execution: impl Future<Output = Result<R, ExecutionError>>,
    ) -> Result<R, ExecutionError> {
        self.context.check_cancellation()?;
        let value = execution
            .await
            .map_err(|e| e.at(self.context.stack_trace()))?;
        self.context.check_cancellation()?;
        Ok(value)
    }

    /// Classifies everything but cancellation at this boundary.
    fn seal<R>(&self, result: Result<R, ExecutionError>) -> Result<R, ExecutionError> {
        match result {
            Err(error) if !error.is_canceled() => Err(ExecutionError::Operation(classify(
                error,
                self.context.token(),
                self.context.stack_trace(),
            ))),
            other => other,
        }
    }
}

/// Builds the request envelope for a query invoked with `request`.
fn request_message<T: Any + Send + Sync>(
    parent: &OperationContext,
    request: T,
    direction: MessageDirection,
) -> Message<T> {
    let message = parent
        .message_factory()
        .create_as(request, MessageKind::Request, direction);
    match parent.stack_trace().current().and_then(|f| f.message()) {
        Some(trigger) => message.with_correlation_id(trigger.id()),
        None => message,
    }
}

fn response_message<R: Any + Send + Sync>(value: R, input: Option<&Message>) -> Message<R> {
    let message = Message::new(value)
        .with_kind(MessageKind::Response)
        .with_direction(MessageDirection::Output);
    match input {
        Some(request) => message.with_correlation_id(request.id()),
        None => message,
    }
}

// ---------------------------------------------------------------------------
// Nested queries
// ---------------------------------------------------------------------------

pub(crate) async fn execute_nested<R, Q>(
    parent: &OperationContext,
    query: &Q,
) -> Result<R, ExecutionError>
where
    R: Send,
    Q: Query<R> + ?Sized,
{
    let scope = QueryScope::enter(parent, type_name::<Q>(), None, query.timeout());
    let result = scope.run(query.execute(&scope.context)).await;
    scope.seal(result)
}

pub(crate) async fn execute_nested_with_message<T, R, Q>(
    parent: &OperationContext,
    query: &Q,
    request: T,
) -> Result<R, ExecutionError>
where
    T: Any + Send + Sync,
    R: Send,
    Q: MessageQuery<T, R> + ?Sized,
{
    let message = request_message(parent, request, MessageDirection::Internal);
    let erased = message.clone().into_any();
    let scope = QueryScope::enter(parent, type_name::<Q>(), Some(erased.clone()), query.timeout());
    let validation = parent.config().message_validation;
    let result = match parent.message_factory().validate(&erased, &validation) {
        Ok(()) => scope.run(query.execute(message, &scope.context)).await,
        Err(invalid) => Err(ExecutionError::from(invalid).at(scope.context.stack_trace())),
    };
    scope.seal(result)
}

// ---------------------------------------------------------------------------
// Root queries
// ---------------------------------------------------------------------------

pub(crate) async fn execute_root<R, Q>(
    root: &OperationContext,
    query: &Q,
) -> Result<QueryOperationResult<R>, OperationError>
where
    R: Any + Send + Sync,
    Q: Query<R> + ?Sized,
{
    let scope = QueryScope::enter(root, type_name::<Q>(), None, query.timeout());
    let result = scope.run(query.execute(&scope.context)).await;
    match result {
        Ok(value) => Ok(QueryOperationResult::new(None, response_message(value, None))),
        Err(error) => Err(classify(error, root.token(), scope.context.stack_trace())),
    }
}

pub(crate) async fn execute_root_with_message<T, R, Q>(
    root: &OperationContext,
    query: &Q,
    request: T,
) -> Result<QueryOperationResult<R>, OperationError>
where
    T: Any + Send + Sync,
    R: Any + Send + Sync,
    Q: MessageQuery<T, R> + ?Sized,
{
    let message = request_message(root, request, MessageDirection::Input);
    let erased = message.clone().into_any();
    let scope = QueryScope::enter(root, type_name::<Q>(), Some(erased.clone()), query.timeout());

    let validation = root.config().message_validation;
    if let Err(invalid) = root.message_factory().validate(&erased, &validation) {
        debug!(message = %erased, error = %invalid, "rejected invalid request message");
        return Err(OperationError::bad_request(
            invalid.to_string(),
            scope.context.stack_trace().clone(),
        )
        .with_cause(Arc::new(invalid)));
    }

    let result = scope.run(query.execute(message, &scope.context)).await;
    match result {
        Ok(value) => {
            let output = response_message(value, Some(&erased));
            Ok(QueryOperationResult::new(Some(erased), output))
        }
        Err(error) => Err(classify(error, root.token(), scope.context.stack_trace())),
    }
}
