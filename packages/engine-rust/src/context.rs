//! Execution contexts handed to handlers and queries.
//!
//! [`OperationContext`] is an immutable value: entering a nested operation
//! produces a new context with a longer stack trace and never changes the
//! caller's. [`MessageHandlerContext`] adds the unit of work and the frame's
//! output bus; [`QueryContext`] is the read-only variant.

use std::any::Any;
use std::ops::Deref;
use std::sync::Arc;

use opflow_core::{ClockSource, MessageFactory, Principal};

use crate::bus::MessageBus;
use crate::cancel::OperationToken;
use crate::config::ProcessorConfig;
use crate::error::ExecutionError;
use crate::handler::{MessageQuery, Query};
use crate::operation::query;
use crate::registry::HandlerRegistry;
use crate::stack::{OperationStackTrace, StackFrame};
use crate::unit_of_work::{ChangeTracker, UnitOfWork, UnitOfWorkError};

/// Shared, read-only collaborators of one processor.
pub(crate) struct ProcessorRuntime {
    pub(crate) factory: Arc<MessageFactory>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) config: ProcessorConfig,
    pub(crate) clock: Arc<dyn ClockSource>,
}

// ---------------------------------------------------------------------------
// OperationContext
// ---------------------------------------------------------------------------

/// Ambient state of the currently executing operation.
#[derive(Clone)]
pub struct OperationContext {
    runtime: Arc<ProcessorRuntime>,
    stack: OperationStackTrace,
    token: OperationToken,
    principal: Option<Arc<Principal>>,
}

impl OperationContext {
    pub(crate) fn root(
        runtime: Arc<ProcessorRuntime>,
        token: OperationToken,
        principal: Option<Arc<Principal>>,
    ) -> Self {
        Self {
            runtime,
            stack: OperationStackTrace::new(),
            token,
            principal,
        }
    }

    /// Context for a nested operation running in `frame`.
    pub(crate) fn push(&self, frame: StackFrame) -> Self {
        Self {
            stack: self.stack.push(frame),
            ..self.clone()
        }
    }

    /// Same context observing a different token.
    pub(crate) fn with_token(&self, token: OperationToken) -> Self {
        Self {
            token,
            ..self.clone()
        }
    }

    pub(crate) fn runtime(&self) -> &ProcessorRuntime {
        &self.runtime
    }

    /// Frames of every operation enclosing the current one.
    #[must_use]
    pub fn stack_trace(&self) -> &OperationStackTrace {
        &self.stack
    }

    /// Cancellation token of the current frame.
    #[must_use]
    pub fn token(&self) -> &OperationToken {
        &self.token
    }

    #[must_use]
    pub fn clock(&self) -> &dyn ClockSource {
        self.runtime.clock.as_ref()
    }

    /// Current time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.runtime.clock.now()
    }

    /// Identity the operation runs on behalf of.
    #[must_use]
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_deref()
    }

    #[must_use]
    pub fn message_factory(&self) -> &MessageFactory {
        &self.runtime.factory
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.runtime.config
    }

    /// Fails with a cancellation signal if this frame's token has fired.
    ///
    /// # Errors
    ///
    /// Returns [`ExecutionError::Canceled`] carrying this frame's token.
    pub fn check_cancellation(&self) -> Result<(), ExecutionError> {
        if self.token.is_cancelled() {
            Err(ExecutionError::canceled(self.token.clone()).at(&self.stack))
        } else {
            Ok(())
        }
    }

    /// Executes `query` as a nested operation.
    ///
    /// Application failures inside the query surface as already-classified
    /// internal-server-errors; cancellation passes through unchanged.
    ///
    /// # Errors
    ///
    /// Returns the query's failure.
    pub async fn execute_query<R, Q>(&self, query: &Q) -> Result<R, ExecutionError>
    where
        R: Send,
        Q: Query<R> + ?Sized,
    {
        query::execute_nested(self, query).await
    }

    /// Executes `query` with `request` as its request message.
    ///
    /// # Errors
    ///
    /// Returns the query's failure.
    pub async fn execute_query_with_message<T, R, Q>(
        &self,
        query: &Q,
        request: T,
    ) -> Result<R, ExecutionError>
    where
        T: Any + Send + Sync,
        R: Send,
        Q: MessageQuery<T, R> + ?Sized,
    {
        query::execute_nested_with_message(self, query, request).await
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("stack", &self.stack)
            .field("token", &self.token)
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MessageHandlerContext
// ---------------------------------------------------------------------------

/// Context of one handler invocation.
#[derive(Debug)]
pub struct MessageHandlerContext {
    operation: OperationContext,
    unit_of_work: Arc<UnitOfWork>,
    bus: MessageBus,
}

impl MessageHandlerContext {
    pub(crate) fn new(
        operation: OperationContext,
        unit_of_work: Arc<UnitOfWork>,
        bus: MessageBus,
    ) -> Self {
        Self {
            operation,
            unit_of_work,
            bus,
        }
    }

    #[must_use]
    pub fn operation(&self) -> &OperationContext {
        &self.operation
    }

    /// The root operation's unit of work.
    #[must_use]
    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.unit_of_work
    }

    /// Enlists `tracker` in the root operation's unit of work.
    ///
    /// # Errors
    ///
    /// Fails if the unit of work is disabled or already completed.
    pub fn enlist(&self, tracker: Arc<dyn ChangeTracker>) -> Result<bool, UnitOfWorkError> {
        self.unit_of_work.enlist(tracker)
    }

    /// Output buffer of this invocation.
    pub fn bus(&mut self) -> &mut MessageBus {
        &mut self.bus
    }
}

impl Deref for MessageHandlerContext {
    type Target = OperationContext;

    fn deref(&self) -> &OperationContext {
        &self.operation
    }
}

// ---------------------------------------------------------------------------
// QueryContext
// ---------------------------------------------------------------------------

/// Read-only context of one query execution.
#[derive(Debug, Clone)]
pub struct QueryContext {
    operation: OperationContext,
}

impl QueryContext {
    pub(crate) fn new(operation: OperationContext) -> Self {
        Self { operation }
    }

    #[must_use]
    pub fn operation(&self) -> &OperationContext {
        &self.operation
    }
}

impl Deref for QueryContext {
    type Target = OperationContext;

    fn deref(&self) -> &OperationContext {
        &self.operation
    }
}
