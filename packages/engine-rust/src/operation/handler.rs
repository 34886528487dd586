//! Command and event execution.
//!
//! A root operation invokes its handlers, then recursively handles every
//! unscheduled event they produced, depth-first: an event's own sub-events are
//! fully processed before the next sibling event. The unit of work is flushed
//! once, after the whole tree has been handled.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use opflow_core::{Message, MessageDirection, MessageKind};
use tracing::debug;

use super::result::MessageHandlerOperationResult;
use crate::bus::MessageBus;
use crate::classify::classify;
use crate::context::{MessageHandlerContext, OperationContext};
use crate::error::{ExecutionError, OperationError};
use crate::handler::ErasedHandler;
use crate::stack::{OperationStackTrace, StackFrame};
use crate::unit_of_work::UnitOfWork;

/// Component name used for a root frame that has no handler.
const UNHANDLED: &str = "unhandled";

/// Runs `handlers` against `message` as one root operation.
///
/// # Errors
///
/// Returns the classified failure. On failure every enlisted change tracker
/// is rolled back.
pub(crate) async fn execute_root(
    root: &OperationContext,
    handlers: &[&dyn ErasedHandler],
    message: Message,
) -> Result<MessageHandlerOperationResult, OperationError> {
    let runtime = root.runtime();
    let message = runtime.factory.resolve_kind(&message);
    let root_stack = root_stack(root, handlers, &message);

    if let Err(invalid) = runtime
        .factory
        .validate(&message, &runtime.config.message_validation)
    {
        debug!(message = %message, error = %invalid, "rejected invalid input message");
        let error = ExecutionError::from(invalid).at(&root_stack);
        return Err(classify(error, root.token(), &root_stack));
    }

    let unit_of_work = Arc::new(UnitOfWork::new(runtime.config.unit_of_work_mode));
    let outcome = async {
        let mut result = MessageHandlerOperationResult::empty(message.clone());
        for handler in handlers {
            let handled = invoke(root, &unit_of_work, *handler, message.clone(), 0).await?;
            result.append(handled);
        }
        if root.token().is_cancelled() {
            return Err(ExecutionError::canceled(root.token().clone()));
        }
        unit_of_work.save_changes().await?;
        Ok::<_, ExecutionError>(result)
    }
    .await;

    match outcome {
        Ok(result) => Ok(result),
        Err(error) => {
            // No-op when the flush itself failed; that path has rolled back.
            unit_of_work.undo_changes().await;
            Err(classify(error.at(&root_stack), root.token(), &root_stack))
        }
    }
}

/// Trace of the root frame for `message`, named after its first handler.
pub(crate) fn root_stack(
    root: &OperationContext,
    handlers: &[&dyn ErasedHandler],
    message: &Message,
) -> OperationStackTrace {
    let component = handlers.first().map_or(UNHANDLED, |h| h.component());
    root.stack_trace().push(StackFrame::handler(
        component,
        message.clone(),
        root.token().clone(),
    ))
}

/// Invokes one handler in a new frame and handles the events it produced.
fn invoke<'a>(
    parent: &'a OperationContext,
    unit_of_work: &'a Arc<UnitOfWork>,
    handler: &'a dyn ErasedHandler,
    message: Message,
    depth: usize,
) -> BoxFuture<'a, Result<MessageHandlerOperationResult, ExecutionError>> {
    Box::pin(async move {
        let runtime = parent.runtime();
        let frame = parent.push(StackFrame::handler(
            handler.component(),
            message.clone(),
            parent.token().clone(),
        ));
        frame.check_cancellation()?;

        let bus = MessageBus::new(
            Arc::clone(&runtime.factory),
            runtime.config.message_validation,
            Some(message.id().to_string()),
        );
        let mut context = MessageHandlerContext::new(frame, Arc::clone(unit_of_work), bus);

        debug!(
            handler = handler.component(),
            message = %message,
            depth,
            "invoking handler"
        );
        handler
            .handle(message.clone(), &mut context)
            .await
            .map_err(|e| e.at(context.stack_trace()))?;
        context.check_cancellation()?;

        let output = context.bus().commit()?;
        let mut result = MessageHandlerOperationResult::empty(message);
        result.record_invocation();

        let now = context.now_ms();
        for produced in output {
            result.push_output(produced.clone());
            if produced.kind() == MessageKind::Event && !produced.is_scheduled_at(now) {
                let handled =
                    handle_event(context.operation(), unit_of_work, produced, depth + 1).await?;
                result.append(handled);
            }
        }
        Ok(result)
    })
}

/// Delivers an internally produced event to every output-eligible handler.
async fn handle_event(
    parent: &OperationContext,
    unit_of_work: &Arc<UnitOfWork>,
    event: Message,
    depth: usize,
) -> Result<MessageHandlerOperationResult, ExecutionError> {
    let runtime = parent.runtime();
    let max_depth = runtime.config.max_event_depth;
    if depth > max_depth {
        return Err(anyhow::anyhow!(
            "event {event} exceeds the maximum handling depth of {max_depth}"
        )
        .into());
    }

    let event = event.with_direction(MessageDirection::Internal);
    let handlers = runtime
        .registry
        .handlers_for(event.content_type(), MessageDirection::Internal);
    debug!(event = %event, handlers = handlers.len(), depth, "handling produced event");

    let mut result = MessageHandlerOperationResult::empty(event.clone());
    for handler in &handlers {
        let handled = invoke(parent, unit_of_work, handler.as_ref(), event.clone(), depth).await?;
        result.append(handled);
    }
    Ok(result)
}
