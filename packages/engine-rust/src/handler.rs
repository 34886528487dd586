//! Handler and query traits.
//!
//! Application code implements [`MessageHandler`] for commands and events,
//! and [`Query`] or [`MessageQuery`] for reads. Closures can be adapted with
//! [`handler_fn`], [`query_fn`] and [`message_query_fn`].

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opflow_core::Message;

use crate::context::{MessageHandlerContext, QueryContext};
use crate::error::ExecutionError;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Handles commands or events with content `T`.
#[async_trait]
pub trait MessageHandler<T: Any + Send + Sync>: Send + Sync {
    /// Handles one message. Output goes through `context.bus()`, state
    /// changes through trackers enlisted in `context.unit_of_work()`.
    async fn handle(
        &self,
        message: Message<T>,
        context: &mut MessageHandlerContext,
    ) -> Result<(), ExecutionError>;
}

/// A read that needs no request message.
#[async_trait]
pub trait Query<R: Send>: Send + Sync {
    async fn execute(&self, context: &QueryContext) -> Result<R, ExecutionError>;

    /// Time budget for one execution. When it elapses the query's token is
    /// cancelled and the failure surfaces as a gateway timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// A read driven by a request message with content `T`.
#[async_trait]
pub trait MessageQuery<T: Any + Send + Sync, R: Send>: Send + Sync {
    async fn execute(&self, message: Message<T>, context: &QueryContext)
        -> Result<R, ExecutionError>;

    /// See [`Query::timeout`].
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

#[async_trait]
impl<T, H> MessageHandler<T> for &H
where
    T: Any + Send + Sync,
    H: MessageHandler<T> + ?Sized,
{
    async fn handle(
        &self,
        message: Message<T>,
        context: &mut MessageHandlerContext,
    ) -> Result<(), ExecutionError> {
        (**self).handle(message, context).await
    }
}

// ---------------------------------------------------------------------------
// Type-erased handlers
// ---------------------------------------------------------------------------

/// A handler that accepts type-erased messages. Used by the registry and the
/// event fan-out.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    /// Type name of the wrapped handler.
    fn component(&self) -> &'static str;

    async fn handle(
        &self,
        message: Message,
        context: &mut MessageHandlerContext,
    ) -> Result<(), ExecutionError>;
}

/// Binds a typed handler to its content type and downcasts on invocation.
pub(crate) struct TypedHandler<T, H> {
    handler: H,
    _content: PhantomData<fn(T)>,
}

impl<T, H> TypedHandler<T, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _content: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> ErasedHandler for TypedHandler<T, H>
where
    T: Any + Send + Sync,
    H: MessageHandler<T>,
{
    fn component(&self) -> &'static str {
        std::any::type_name::<H>().trim_start_matches('&')
    }

    async fn handle(
        &self,
        message: Message,
        context: &mut MessageHandlerContext,
    ) -> Result<(), ExecutionError> {
        let typed = message.downcast::<T>().map_err(|m| {
            anyhow::anyhow!(
                "handler {} cannot handle {}",
                std::any::type_name::<H>(),
                m.content_type()
            )
        })?;
        self.handler.handle(typed, context).await
    }
}

impl<T, H> fmt::Debug for TypedHandler<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedHandler")
            .field("handler", &std::any::type_name::<H>())
            .field("content", &std::any::type_name::<T>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Closure adapters
// ---------------------------------------------------------------------------

/// Handler built from a closure. See [`handler_fn`].
pub struct HandlerFn<T, F> {
    f: F,
    _content: PhantomData<fn(T)>,
}

/// Adapts a closure into a [`MessageHandler`].
///
/// ```ignore
/// let handler = handler_fn(|message: Message<PlaceOrder>, ctx| {
///     Box::pin(async move {
///         ctx.bus().publish(OrderPlaced { id: message.content().id })?;
///         Ok(())
///     })
/// });
/// ```
#[must_use]
pub fn handler_fn<T, F>(f: F) -> HandlerFn<T, F>
where
    T: Any + Send + Sync,
    F: for<'a> Fn(
            Message<T>,
            &'a mut MessageHandlerContext,
        ) -> BoxFuture<'a, Result<(), ExecutionError>>
        + Send
        + Sync,
{
    HandlerFn {
        f,
        _content: PhantomData,
    }
}

#[async_trait]
impl<T, F> MessageHandler<T> for HandlerFn<T, F>
where
    T: Any + Send + Sync,
    F: for<'a> Fn(
            Message<T>,
            &'a mut MessageHandlerContext,
        ) -> BoxFuture<'a, Result<(), ExecutionError>>
        + Send
        + Sync,
{
    async fn handle(
        &self,
        message: Message<T>,
        context: &mut MessageHandlerContext,
    ) -> Result<(), ExecutionError> {
        (self.f)(message, context).await
    }
}

/// Query built from a closure. See [`query_fn`].
pub struct QueryFn<R, F> {
    f: F,
    timeout: Option<Duration>,
    _result: PhantomData<fn() -> R>,
}

impl<R, F> QueryFn<R, F> {
    /// Declares a time budget for the query.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Adapts a closure into a [`Query`].
#[must_use]
pub fn query_fn<R, F>(f: F) -> QueryFn<R, F>
where
    R: Send,
    F: for<'a> Fn(&'a QueryContext) -> BoxFuture<'a, Result<R, ExecutionError>> + Send + Sync,
{
    QueryFn {
        f,
        timeout: None,
        _result: PhantomData,
    }
}

#[async_trait]
impl<R, F> Query<R> for QueryFn<R, F>
where
    R: Send,
    F: for<'a> Fn(&'a QueryContext) -> BoxFuture<'a, Result<R, ExecutionError>> + Send + Sync,
{
    async fn execute(&self, context: &QueryContext) -> Result<R, ExecutionError> {
        (self.f)(context).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Message query built from a closure. See [`message_query_fn`].
pub struct MessageQueryFn<T, R, F> {
    f: F,
    timeout: Option<Duration>,
    _types: PhantomData<fn(T) -> R>,
}

impl<T, R, F> MessageQueryFn<T, R, F> {
    /// Declares a time budget for the query.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Adapts a closure into a [`MessageQuery`].
#[must_use]
pub fn message_query_fn<T, R, F>(f: F) -> MessageQueryFn<T, R, F>
where
    T: Any + Send + Sync,
    R: Send,
    F: for<'a> Fn(Message<T>, &'a QueryContext) -> BoxFuture<'a, Result<R, ExecutionError>>
        + Send
        + Sync,
{
    MessageQueryFn {
        f,
        timeout: None,
        _types: PhantomData,
    }
}

#[async_trait]
impl<T, R, F> MessageQuery<T, R> for MessageQueryFn<T, R, F>
where
    T: Any + Send + Sync,
    R: Send,
    F: for<'a> Fn(Message<T>, &'a QueryContext) -> BoxFuture<'a, Result<R, ExecutionError>>
        + Send
        + Sync,
{
    async fn execute(
        &self,
        message: Message<T>,
        context: &QueryContext,
    ) -> Result<R, ExecutionError> {
        (self.f)(message, context).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
