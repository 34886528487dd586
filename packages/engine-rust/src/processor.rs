//! The processor façade.
//!
//! [`MicroProcessor`] is the public entry point: it builds a root operation
//! context, runs the operation, dispatches the committed output on success and
//! records telemetry for every call.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use opflow_core::{
    ClockSource, Message, MessageDirection, MessageFactory, MessageKind, Principal, SystemClock,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::cancel::OperationToken;
use crate::config::ProcessorConfig;
use crate::context::{OperationContext, ProcessorRuntime};
use crate::dispatch::{dispatch, NullDispatcher, ServiceBusDispatcher};
use crate::error::{OperationError, OperationErrorKind};
use crate::handler::{ErasedHandler, MessageHandler, MessageQuery, Query, TypedHandler};
use crate::operation::{
    handler as handler_operation, query as query_operation, MessageHandlerOperationResult,
    QueryOperationResult,
};
use crate::registry::HandlerRegistry;

// ---------------------------------------------------------------------------
// MicroProcessor
// ---------------------------------------------------------------------------

/// Executes commands, events and queries as root operations.
///
/// Cloning is cheap; clones share the registry, factory and dispatcher.
#[derive(Clone)]
pub struct MicroProcessor {
    runtime: Arc<ProcessorRuntime>,
    dispatcher: Arc<dyn ServiceBusDispatcher>,
    principal: Option<Arc<Principal>>,
}

impl MicroProcessor {
    /// Starts building a processor.
    #[must_use]
    pub fn builder() -> MicroProcessorBuilder {
        MicroProcessorBuilder::default()
    }

    /// A processor that runs every operation on behalf of `principal`.
    #[must_use]
    pub fn with_principal(&self, principal: Principal) -> Self {
        Self {
            principal: Some(Arc::new(principal)),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn config(&self) -> &ProcessorConfig {
        &self.runtime.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.runtime.registry
    }

    #[must_use]
    pub fn message_factory(&self) -> &MessageFactory {
        &self.runtime.factory
    }

    /// Executes `command` with `handler`.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the operation or of the dispatch.
    pub async fn execute_command<T, H>(
        &self,
        handler: &H,
        command: T,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerOperationResult, OperationError>
    where
        T: Any + Send + Sync,
        H: MessageHandler<T>,
    {
        let message = self
            .runtime
            .factory
            .create_as(command, MessageKind::Command, MessageDirection::Input)
            .into_any();
        let bound = TypedHandler::<T, &H>::new(handler);
        self.run_handlers("command", self.root_context(token), message, &[&bound])
            .await
    }

    /// Handles `event` with `handler`.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the operation or of the dispatch.
    pub async fn handle_event<T, H>(
        &self,
        handler: &H,
        event: T,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerOperationResult, OperationError>
    where
        T: Any + Send + Sync,
        H: MessageHandler<T>,
    {
        let message = self
            .runtime
            .factory
            .create_as(event, MessageKind::Event, MessageDirection::Input)
            .into_any();
        let bound = TypedHandler::<T, &H>::new(handler);
        self.run_handlers("event", self.root_context(token), message, &[&bound])
            .await
    }

    /// Routes `message` to the handlers registered for its content type.
    ///
    /// Commands need at least one input-eligible handler; events may have
    /// none. Requests and responses are rejected.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for unroutable messages, otherwise the classified
    /// failure of the operation or of the dispatch.
    pub async fn handle_message(
        &self,
        message: Message,
        token: Option<CancellationToken>,
    ) -> Result<MessageHandlerOperationResult, OperationError> {
        let message = self
            .runtime
            .factory
            .resolve_kind(&message)
            .with_direction(MessageDirection::Input);
        let handlers = self
            .runtime
            .registry
            .handlers_for(message.content_type(), MessageDirection::Input);
        let root = self.root_context(token);
        let operation = match message.kind() {
            MessageKind::Command if handlers.is_empty() => {
                let reason = format!("no handler registered for command {message}");
                return Err(reject(&root, &message, reason));
            }
            MessageKind::Command => "command",
            MessageKind::Event => "event",
            MessageKind::Request | MessageKind::Response => {
                let reason = format!(
                    "{} messages cannot be handled, execute a query instead",
                    message.kind()
                );
                return Err(reject(&root, &message, reason));
            }
            MessageKind::Undefined => "message",
        };
        let bound: Vec<&dyn ErasedHandler> = handlers.iter().map(|h| h.as_ref()).collect();
        self.run_handlers(operation, root, message, &bound).await
    }

    /// Executes `query`.
    ///
    /// # Errors
    ///
    /// Returns the classified failure of the query.
    pub async fn execute_query<R, Q>(
        &self,
        query: &Q,
        token: Option<CancellationToken>,
    ) -> Result<QueryOperationResult<R>, OperationError>
    where
        R: Any + Send + Sync,
        Q: Query<R> + ?Sized,
    {
        let root = self.root_context(token);
        let span = info_span!(
            "operation",
            operation = "query",
            query = std::any::type_name::<Q>(),
            outcome = tracing::field::Empty,
        );
        observe("query", query_operation::execute_root(&root, query))
            .instrument(span)
            .await
    }

    /// Executes `query` with `request` as its request message.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` for an invalid request, otherwise the classified
    /// failure of the query.
    pub async fn execute_query_with_message<T, R, Q>(
        &self,
        query: &Q,
        request: T,
        token: Option<CancellationToken>,
    ) -> Result<QueryOperationResult<R>, OperationError>
    where
        T: Any + Send + Sync,
        R: Any + Send + Sync,
        Q: MessageQuery<T, R> + ?Sized,
    {
        let root = self.root_context(token);
        let span = info_span!(
            "operation",
            operation = "query",
            query = std::any::type_name::<Q>(),
            outcome = tracing::field::Empty,
        );
        observe(
            "query",
            query_operation::execute_root_with_message(&root, query, request),
        )
        .instrument(span)
        .await
    }

    fn root_context(&self, token: Option<CancellationToken>) -> OperationContext {
        let token = token.map_or_else(OperationToken::new, OperationToken::from_cancellation_token);
        OperationContext::root(Arc::clone(&self.runtime), token, self.principal.clone())
    }

    async fn run_handlers(
        &self,
        operation: &'static str,
        root: OperationContext,
        message: Message,
        handlers: &[&dyn ErasedHandler],
    ) -> Result<MessageHandlerOperationResult, OperationError> {
        let span = info_span!(
            "operation",
            operation,
            message_type = message.content_type().short_name(),
            message_id = message.id(),
            handlers = handlers.len(),
            outcome = tracing::field::Empty,
        );
        let execution = async {
            let result = handler_operation::execute_root(&root, handlers, message).await?;
            if !result.output().is_empty() {
                dispatch(self.dispatcher.as_ref(), result.output())
                    .await
                    .map_err(|e| {
                        let cause: Box<dyn std::error::Error + Send + Sync> = e.into();
                        let stack =
                            handler_operation::root_stack(&root, handlers, result.input());
                        OperationError::internal(
                            format!("failed to dispatch output: {cause}"),
                            stack,
                        )
                        .with_cause(Arc::from(cause))
                    })?;
            }
            Ok::<_, OperationError>(result)
        };
        observe(operation, execution).instrument(span).await
    }
}

/// Records outcome and duration of a root operation.
async fn observe<T>(
    operation: &'static str,
    execution: impl Future<Output = Result<T, OperationError>>,
) -> Result<T, OperationError> {
    let started = Instant::now();
    let result = execution.await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    tracing::Span::current().record("outcome", outcome);
    match &result {
        Ok(_) => debug!(operation, "operation succeeded"),
        Err(e) if e.kind().is_client_error() => {
            debug!(operation, error = %e, "operation rejected");
        }
        Err(e) => warn!(operation, error = %e, stack = %e.stack_trace(), "operation failed"),
    }
    metrics::counter!(
        "opflow_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("opflow_operation_duration_seconds", "operation" => operation)
        .record(started.elapsed().as_secs_f64());
    result
}

/// Rejects `message` before any operation starts. The trace holds the single
/// frame the message would have run in.
fn reject(root: &OperationContext, message: &Message, reason: String) -> OperationError {
    metrics::counter!(
        "opflow_operations_total",
        "operation" => "message",
        "outcome" => OperationErrorKind::BadRequest.as_str()
    )
    .increment(1);
    debug!(message = %message, %reason, "rejected unroutable message");
    OperationError::bad_request(reason, handler_operation::root_stack(root, &[], message))
}

impl std::fmt::Debug for MicroProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicroProcessor")
            .field("config", &self.runtime.config)
            .field("registry", &self.runtime.registry)
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// MicroProcessorBuilder
// ---------------------------------------------------------------------------

/// Builder for [`MicroProcessor`]. Every collaborator has a default.
#[derive(Default)]
pub struct MicroProcessorBuilder {
    config: ProcessorConfig,
    factory: Option<Arc<MessageFactory>>,
    registry: Option<Arc<HandlerRegistry>>,
    dispatcher: Option<Arc<dyn ServiceBusDispatcher>>,
    clock: Option<Arc<dyn ClockSource>>,
}

impl MicroProcessorBuilder {
    #[must_use]
    pub fn config(mut self, config: ProcessorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn message_factory(mut self, factory: MessageFactory) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    #[must_use]
    pub fn registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<dyn ServiceBusDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn build(self) -> MicroProcessor {
        MicroProcessor {
            runtime: Arc::new(ProcessorRuntime {
                factory: self.factory.unwrap_or_default(),
                registry: self.registry.unwrap_or_default(),
                config: self.config,
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            }),
            dispatcher: self.dispatcher.unwrap_or_else(|| Arc::new(NullDispatcher)),
            principal: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::FutureExt;
    use opflow_core::{ContentType, ValidationError};
    use parking_lot::Mutex;

    use super::*;
    use crate::config::UnitOfWorkMode;
    use crate::context::{MessageHandlerContext, QueryContext};
    use crate::error::ExecutionError;
    use crate::handler::handler_fn;
    use crate::stack::{OperationKind, StackFrame};
    use crate::unit_of_work::{ChangeTracker, UnitOfWorkId};

    // -- messages -----------------------------------------------------------

    #[derive(Debug)]
    struct PlaceOrder {
        quantity: u32,
    }
    struct EventA;
    struct EventB;
    struct EventC;
    struct GetStock {
        sku: &'static str,
    }

    // -- handlers -----------------------------------------------------------

    struct PublishAB;

    #[async_trait]
    impl MessageHandler<PlaceOrder> for PublishAB {
        async fn handle(
            &self,
            _message: Message<PlaceOrder>,
            context: &mut MessageHandlerContext,
        ) -> Result<(), ExecutionError> {
            context.bus().publish(EventA)?;
            context.bus().publish(EventB)?;
            Ok(())
        }
    }

    struct PublishC;

    #[async_trait]
    impl MessageHandler<EventA> for PublishC {
        async fn handle(
            &self,
            _message: Message<EventA>,
            context: &mut MessageHandlerContext,
        ) -> Result<(), ExecutionError> {
            context.bus().publish(EventC)?;
            Ok(())
        }
    }

    struct Ignore;

    #[async_trait]
    impl<T: Any + Send + Sync> MessageHandler<T> for Ignore {
        async fn handle(
            &self,
            _message: Message<T>,
            _context: &mut MessageHandlerContext,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    struct Fail(fn() -> ExecutionError);

    #[async_trait]
    impl<T: Any + Send + Sync> MessageHandler<T> for Fail {
        async fn handle(
            &self,
            _message: Message<T>,
            _context: &mut MessageHandlerContext,
        ) -> Result<(), ExecutionError> {
            Err((self.0)())
        }
    }

    /// Enlists one tracker per resource id, then optionally fails.
    struct Enlist {
        spy: Arc<SpyState>,
        resources: Vec<&'static str>,
        fail_save: bool,
        fail_handler: bool,
    }

    impl Enlist {
        fn new(spy: &Arc<SpyState>, resources: &[&'static str]) -> Self {
            Self {
                spy: Arc::clone(spy),
                resources: resources.to_vec(),
                fail_save: false,
                fail_handler: false,
            }
        }
    }

    #[async_trait]
    impl<T: Any + Send + Sync> MessageHandler<T> for Enlist {
        async fn handle(
            &self,
            _message: Message<T>,
            context: &mut MessageHandlerContext,
        ) -> Result<(), ExecutionError> {
            for resource in &self.resources {
                context.enlist(Arc::new(Spy {
                    state: Arc::clone(&self.spy),
                    resource,
                    fail: self.fail_save,
                }))?;
            }
            if self.fail_handler {
                return Err(ExecutionError::business_rule("order limit exceeded"));
            }
            Ok(())
        }
    }

    // -- change tracker spy -------------------------------------------------

    #[derive(Default)]
    struct SpyState {
        saves: AtomicUsize,
        undos: AtomicUsize,
    }

    struct Spy {
        state: Arc<SpyState>,
        resource: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl ChangeTracker for Spy {
        fn group_id(&self) -> &str {
            "orders"
        }

        fn resource_id(&self) -> &str {
            self.resource
        }

        fn has_changes(&self, _unit_of_work: UnitOfWorkId) -> bool {
            true
        }

        async fn save_changes(&self, _unit_of_work: UnitOfWorkId) -> Result<(), ExecutionError> {
            self.state.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ExecutionError::conflict("stale order version"));
            }
            Ok(())
        }

        async fn undo_changes(&self, _unit_of_work: UnitOfWorkId) {
            self.state.undos.fetch_add(1, Ordering::SeqCst);
        }
    }

    // -- dispatcher ---------------------------------------------------------

    #[derive(Default)]
    struct Recording {
        commands: Mutex<Vec<Message>>,
        events: Mutex<Vec<Message>>,
        fail: bool,
    }

    #[async_trait]
    impl ServiceBusDispatcher for Recording {
        async fn send_commands(&self, commands: Vec<Message>) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("broker unavailable");
            }
            self.commands.lock().extend(commands);
            Ok(())
        }

        async fn publish_events(&self, events: Vec<Message>) -> anyhow::Result<()> {
            self.events.lock().extend(events);
            Ok(())
        }
    }

    // -- queries ------------------------------------------------------------

    struct SlowQuery;

    #[async_trait]
    impl Query<u32> for SlowQuery {
        async fn execute(&self, _context: &QueryContext) -> Result<u32, ExecutionError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }

        fn timeout(&self) -> Option<Duration> {
            Some(Duration::from_secs(1))
        }
    }

    struct FailingQuery;

    #[async_trait]
    impl Query<u32> for FailingQuery {
        async fn execute(&self, _context: &QueryContext) -> Result<u32, ExecutionError> {
            Err(ExecutionError::business_rule("stock unavailable"))
        }
    }

    struct StockQuery;

    #[async_trait]
    impl MessageQuery<GetStock, u32> for StockQuery {
        async fn execute(
            &self,
            message: Message<GetStock>,
            context: &QueryContext,
        ) -> Result<u32, ExecutionError> {
            assert_eq!(context.stack_trace().len(), 1);
            Ok(if message.content().sku == "apple" { 12 } else { 0 })
        }
    }

    /// Handler that runs `query` and publishes nothing.
    struct RunQuery<Q>(Q);

    #[async_trait]
    impl<Q: Query<u32>> MessageHandler<PlaceOrder> for RunQuery<Q> {
        async fn handle(
            &self,
            _message: Message<PlaceOrder>,
            context: &mut MessageHandlerContext,
        ) -> Result<(), ExecutionError> {
            context.execute_query(&self.0).await?;
            Ok(())
        }
    }

    // -- helpers ------------------------------------------------------------

    fn factory() -> MessageFactory {
        MessageFactory::builder()
            .command::<PlaceOrder>()
            .event::<EventA>()
            .event::<EventB>()
            .event::<EventC>()
            .request::<GetStock>()
            .validator::<PlaceOrder, _>(|order| {
                if order.quantity == 0 {
                    Err(ValidationError::new("PlaceOrder", "quantity must be positive"))
                } else {
                    Ok(())
                }
            })
            .build()
    }

    fn processor(registry: HandlerRegistry) -> MicroProcessor {
        MicroProcessor::builder()
            .message_factory(factory())
            .registry(Arc::new(registry))
            .build()
    }

    fn order() -> PlaceOrder {
        PlaceOrder { quantity: 1 }
    }

    fn types(messages: &[Message]) -> Vec<ContentType> {
        messages.iter().map(|m| m.content_type()).collect()
    }

    // -- fan-out ------------------------------------------------------------

    #[tokio::test]
    async fn events_are_handled_depth_first() {
        let registry = HandlerRegistry::new();
        registry.register::<EventA, _>(PublishC);
        registry.register::<EventB, _>(Ignore);
        registry.register::<EventC, _>(Ignore);
        let processor = processor(registry);

        let result = processor
            .execute_command(&PublishAB, order(), None)
            .await
            .unwrap();

        assert_eq!(
            types(result.output()),
            vec![
                ContentType::of::<EventA>(),
                ContentType::of::<EventC>(),
                ContentType::of::<EventB>(),
            ]
        );
        // PublishAB, PublishC and one Ignore per B and C.
        assert_eq!(result.handler_count(), 4);
        assert!(result
            .output()
            .iter()
            .all(|m| m.kind() == MessageKind::Event));
    }

    #[tokio::test]
    async fn output_is_correlated_to_its_trigger() {
        let registry = HandlerRegistry::new();
        registry.register::<EventA, _>(PublishC);
        let processor = processor(registry);

        let result = processor
            .execute_command(&PublishAB, order(), None)
            .await
            .unwrap();
        let output = result.output();

        assert_eq!(output[0].correlation_id(), Some(result.input().id()));
        assert_eq!(output[1].correlation_id(), Some(output[0].id()));
    }

    #[tokio::test]
    async fn scheduled_events_are_not_handled_in_process() {
        let handled = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new();
        let counter = Arc::clone(&handled);
        registry.register::<EventA, _>(handler_fn(move |_message: Message<EventA>, _context| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ExecutionError>(())
            }
            .boxed()
        }));
        let processor = processor(registry);

        let schedule = handler_fn(|_message: Message<PlaceOrder>, context| {
            async move {
                let later = context.now_ms() + 60_000;
                context.bus().publish_at(EventA, later)?;
                Ok::<_, ExecutionError>(())
            }
            .boxed()
        });
        let result = processor
            .execute_command(&schedule, order(), None)
            .await
            .unwrap();

        assert_eq!(result.output().len(), 1);
        assert_eq!(handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runaway_event_chain_is_stopped() {
        struct Loop;

        #[async_trait]
        impl MessageHandler<EventA> for Loop {
            async fn handle(
                &self,
                _message: Message<EventA>,
                context: &mut MessageHandlerContext,
            ) -> Result<(), ExecutionError> {
                context.bus().publish(EventA)?;
                Ok(())
            }
        }

        let registry = HandlerRegistry::new();
        registry.register::<EventA, _>(Loop);
        let processor = MicroProcessor::builder()
            .config(ProcessorConfig {
                max_event_depth: 3,
                ..ProcessorConfig::default()
            })
            .registry(Arc::new(registry))
            .build();

        let err = processor
            .handle_event(&Loop, EventA, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
        assert!(err.message().contains("maximum handling depth"));
    }

    // -- unit of work -------------------------------------------------------

    #[tokio::test]
    async fn distinct_resources_are_flushed_separately() {
        let spy = Arc::new(SpyState::default());
        let processor = processor(HandlerRegistry::new());

        processor
            .execute_command(&Enlist::new(&spy, &["order-1", "order-2"]), order(), None)
            .await
            .unwrap();
        assert_eq!(spy.saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn same_resource_is_flushed_once() {
        let spy = Arc::new(SpyState::default());
        let processor = processor(HandlerRegistry::new());

        processor
            .execute_command(&Enlist::new(&spy, &["order-1", "order-1"]), order(), None)
            .await
            .unwrap();
        assert_eq!(spy.saves.load(Ordering::SeqCst), 1);
        assert_eq!(spy.undos.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failure_rolls_back_without_flushing() {
        let spy = Arc::new(SpyState::default());
        let processor = processor(HandlerRegistry::new());
        let handler = Enlist {
            fail_handler: true,
            ..Enlist::new(&spy, &["order-1"])
        };

        processor
            .execute_command(&handler, order(), None)
            .await
            .unwrap_err();
        assert_eq!(spy.saves.load(Ordering::SeqCst), 0);
        assert_eq!(spy.undos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_unit_of_work_rejects_enlistment() {
        let spy = Arc::new(SpyState::default());
        let processor = MicroProcessor::builder()
            .config(ProcessorConfig {
                unit_of_work_mode: UnitOfWorkMode::Disabled,
                ..ProcessorConfig::default()
            })
            .build();

        let err = processor
            .execute_command(&Enlist::new(&spy, &["order-1"]), order(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
        assert_eq!(spy.saves.load(Ordering::SeqCst), 0);
    }

    // -- classification -----------------------------------------------------

    #[tokio::test]
    async fn business_rule_in_command_is_unprocessable() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_command(
                &Fail(|| ExecutionError::business_rule("order limit exceeded")),
                order(),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), OperationErrorKind::UnprocessableEntity);
        assert_eq!(err.status_code(), 422);
        assert_eq!(err.stack_trace().len(), 1);
    }

    #[tokio::test]
    async fn business_rule_in_event_is_internal() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .handle_event(
                &Fail(|| ExecutionError::business_rule("order limit exceeded")),
                EventA,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
    }

    #[tokio::test]
    async fn business_rule_below_an_event_frame_is_internal() {
        let registry = HandlerRegistry::new();
        registry.register::<EventA, _>(Fail(|| ExecutionError::business_rule("no stock")));
        let processor = processor(registry);

        let err = processor
            .execute_command(&PublishAB, order(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
        assert!(err.stack_trace().contains_event());
    }

    #[tokio::test]
    async fn flush_conflict_in_command_is_conflict() {
        let spy = Arc::new(SpyState::default());
        let processor = processor(HandlerRegistry::new());
        let handler = Enlist {
            fail_save: true,
            ..Enlist::new(&spy, &["order-1"])
        };

        let err = processor
            .execute_command(&handler, order(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::Conflict);
        assert_eq!(spy.undos.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flush_conflict_in_event_is_internal() {
        let spy = Arc::new(SpyState::default());
        let processor = processor(HandlerRegistry::new());
        let handler = Enlist {
            fail_save: true,
            ..Enlist::new(&spy, &["order-1"])
        };

        let err = processor
            .handle_event(&handler, EventA, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
    }

    #[tokio::test]
    async fn unexpected_failure_is_internal_with_cause() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_command(
                &Fail(|| anyhow::anyhow!("disk full").into()),
                order(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
        assert!(err.cause().is_some());
    }

    #[tokio::test]
    async fn nested_query_failure_is_sealed() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_command(&RunQuery(FailingQuery), order(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
        assert_eq!(
            err.stack_trace().current().map(StackFrame::kind),
            Some(OperationKind::Query)
        );
    }

    // -- cancellation -------------------------------------------------------

    #[tokio::test]
    async fn cancelling_own_token_is_canceled() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        let processor = processor(HandlerRegistry::new());
        let handler = handler_fn(move |_message: Message<PlaceOrder>, context| {
            let trigger = trigger.clone();
            async move {
                trigger.cancel();
                context.check_cancellation()
            }
            .boxed()
        });

        let err = processor
            .execute_command(&handler, order(), Some(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::Canceled);
    }

    #[tokio::test]
    async fn foreign_cancellation_is_internal() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_command(
                &Fail(|| ExecutionError::canceled(OperationToken::new())),
                order(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
    }

    #[tokio::test]
    async fn precancelled_command_runs_no_handler() {
        let spy = Arc::new(SpyState::default());
        let token = CancellationToken::new();
        token.cancel();
        let processor = processor(HandlerRegistry::new());

        let err = processor
            .execute_command(&Enlist::new(&spy, &["order-1"]), order(), Some(token))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::Canceled);
        assert_eq!(spy.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn query_timeout_is_gateway_timeout() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_command(&RunQuery(SlowQuery), order(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::GatewayTimeout);
        assert_eq!(err.status_code(), 504);
    }

    #[tokio::test(start_paused = true)]
    async fn root_query_timeout_is_gateway_timeout() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_query(&SlowQuery, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::GatewayTimeout);
    }

    // -- validation and routing ---------------------------------------------

    #[tokio::test]
    async fn invalid_command_is_bad_request() {
        let spy = Arc::new(SpyState::default());
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_command(
                &Enlist::new(&spy, &["order-1"]),
                PlaceOrder { quantity: 0 },
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), OperationErrorKind::BadRequest);
        assert!(err.message().contains("quantity must be positive"));
        assert_eq!(err.stack_trace().len(), 1);
        assert_eq!(spy.saves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_event_is_internal() {
        let processor = MicroProcessor::builder()
            .message_factory(
                MessageFactory::builder()
                    .event::<EventB>()
                    .validator::<EventB, _>(|_| {
                        Err(ValidationError::new("EventB", "missing order id"))
                    })
                    .build(),
            )
            .build();

        let err = processor
            .handle_event(&Ignore, EventB, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
        assert!(err.message().contains("missing order id"));
        assert_eq!(
            err.stack_trace().root().map(StackFrame::message_kind),
            Some(MessageKind::Event)
        );
    }

    #[tokio::test]
    async fn invalid_output_fails_the_handler() {
        let processor = processor(HandlerRegistry::new());
        let handler = handler_fn(|_message: Message<PlaceOrder>, context| {
            async move {
                context.bus().send(PlaceOrder { quantity: 0 })?;
                Ok::<_, ExecutionError>(())
            }
            .boxed()
        });
        let err = processor
            .execute_command(&handler, order(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
    }

    #[tokio::test]
    async fn handle_message_routes_registered_command() {
        let registry = HandlerRegistry::new();
        registry.register::<PlaceOrder, _>(PublishAB);
        let processor = processor(registry);

        let result = processor
            .handle_message(Message::new(order()).into_any(), None)
            .await
            .unwrap();
        assert_eq!(result.handler_count(), 1);
        assert_eq!(result.input().kind(), MessageKind::Command);
        assert_eq!(result.events().count(), 2);
    }

    #[tokio::test]
    async fn handle_message_rejects_unhandled_command() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .handle_message(Message::new(order()).into_any(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn handle_message_accepts_unhandled_event() {
        let processor = processor(HandlerRegistry::new());
        let result = processor
            .handle_message(Message::new(EventB).into_any(), None)
            .await
            .unwrap();
        assert_eq!(result.handler_count(), 0);
        assert!(result.output().is_empty());
    }

    #[tokio::test]
    async fn handle_message_rejects_requests() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .handle_message(Message::new(GetStock { sku: "apple" }).into_any(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::BadRequest);
        let frame = err.stack_trace().current().unwrap();
        assert_eq!(frame.message_kind(), MessageKind::Request);
        assert_eq!(frame.component(), "unhandled");
    }

    // -- dispatch -----------------------------------------------------------

    #[tokio::test]
    async fn committed_output_is_dispatched_by_kind() {
        let dispatcher = Arc::new(Recording::default());
        let processor = MicroProcessor::builder()
            .message_factory(factory())
            .dispatcher(Arc::clone(&dispatcher) as Arc<dyn ServiceBusDispatcher>)
            .build();
        let handler = handler_fn(|_message: Message<PlaceOrder>, context| {
            async move {
                context.bus().publish(EventA)?;
                context.bus().send(PlaceOrder { quantity: 2 })?;
                Ok::<_, ExecutionError>(())
            }
            .boxed()
        });

        processor
            .execute_command(&handler, order(), None)
            .await
            .unwrap();
        assert_eq!(dispatcher.commands.lock().len(), 1);
        assert_eq!(dispatcher.events.lock().len(), 1);
    }

    #[tokio::test]
    async fn nothing_is_dispatched_on_failure() {
        let dispatcher = Arc::new(Recording::default());
        let registry = HandlerRegistry::new();
        registry.register::<EventB, _>(Fail(|| ExecutionError::business_rule("rejected")));
        let processor = MicroProcessor::builder()
            .registry(Arc::new(registry))
            .dispatcher(Arc::clone(&dispatcher) as Arc<dyn ServiceBusDispatcher>)
            .build();

        processor
            .execute_command(&PublishAB, order(), None)
            .await
            .unwrap_err();
        assert!(dispatcher.events.lock().is_empty());
    }

    #[tokio::test]
    async fn dispatch_failure_is_internal() {
        let dispatcher = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let processor = MicroProcessor::builder()
            .dispatcher(dispatcher as Arc<dyn ServiceBusDispatcher>)
            .build();
        let handler = handler_fn(|_message: Message<PlaceOrder>, context| {
            async move {
                context.bus().send(PlaceOrder { quantity: 2 })?;
                Ok::<_, ExecutionError>(())
            }
            .boxed()
        });

        let err = processor
            .execute_command(&handler, order(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
        assert!(err.message().contains("broker unavailable"));
        assert_eq!(err.stack_trace().len(), 1);
        assert_eq!(
            err.stack_trace().root().map(StackFrame::message_kind),
            Some(MessageKind::Command)
        );
    }

    // -- queries and principal ----------------------------------------------

    #[tokio::test]
    async fn query_with_message_correlates_response() {
        let processor = processor(HandlerRegistry::new());
        let result = processor
            .execute_query_with_message(&StockQuery, GetStock { sku: "apple" }, None)
            .await
            .unwrap();

        assert_eq!(*result.value(), 12);
        let request = result.input().unwrap();
        assert_eq!(request.kind(), MessageKind::Request);
        assert_eq!(result.output().kind(), MessageKind::Response);
        assert_eq!(result.output().correlation_id(), Some(request.id()));
    }

    #[tokio::test]
    async fn root_query_failure_is_internal() {
        let processor = processor(HandlerRegistry::new());
        let err = processor
            .execute_query(&FailingQuery, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), OperationErrorKind::InternalServerError);
    }

    #[tokio::test]
    async fn principal_reaches_handlers() {
        let processor = processor(HandlerRegistry::new())
            .with_principal(Principal::new("alice").with_role("admin"));
        let handler = handler_fn(|_message: Message<PlaceOrder>, context| {
            async move {
                match context.principal() {
                    Some(principal) if principal.is_in_role("admin") => Ok(()),
                    _ => Err(ExecutionError::business_rule("admin role required")),
                }
            }
            .boxed()
        });

        processor
            .execute_command(&handler, order(), None)
            .await
            .unwrap();
    }
}
