//! Per-frame output buffer.
//!
//! Every handler invocation gets its own [`MessageBus`]. Commands and events
//! written to it are stamped as `Output` messages correlated to the message
//! being handled. After the handler returns the operation commits the bus;
//! from then on the buffer is read-only.

use std::any::Any;
use std::sync::Arc;

use opflow_core::{
    Message, MessageDirection, MessageFactory, MessageKind, MessageValidationOptions,
    ValidationError,
};

use crate::error::ExecutionError;

/// Errors from writing to or committing a [`MessageBus`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum MessageBusError {
    #[error("message bus has already been committed")]
    AlreadyCommitted,
    #[error("invalid output message: {0}")]
    InvalidMessage(#[from] ValidationError),
}

impl From<MessageBusError> for ExecutionError {
    fn from(error: MessageBusError) -> Self {
        Self::Unexpected(anyhow::Error::new(error))
    }
}

/// Append-only buffer of commands and events produced by one handler.
pub struct MessageBus {
    factory: Arc<MessageFactory>,
    validation: MessageValidationOptions,
    correlation_id: Option<String>,
    messages: Vec<Message>,
    committed: bool,
}

impl MessageBus {
    /// Creates an uncommitted bus. Written messages are correlated to
    /// `correlation_id` when set.
    #[must_use]
    pub fn new(
        factory: Arc<MessageFactory>,
        validation: MessageValidationOptions,
        correlation_id: Option<String>,
    ) -> Self {
        Self {
            factory,
            validation,
            correlation_id,
            messages: Vec::new(),
            committed: false,
        }
    }

    /// Schedules `command` for dispatch after the operation completes.
    ///
    /// # Errors
    ///
    /// Fails if the bus is committed or the command is invalid.
    pub fn send<T: Any + Send + Sync>(&mut self, command: T) -> Result<(), MessageBusError> {
        self.write(command, MessageKind::Command, None)
    }

    /// Schedules `command` for delivery at `delivery_time_ms`.
    ///
    /// # Errors
    ///
    /// Fails if the bus is committed or the command is invalid.
    pub fn send_at<T: Any + Send + Sync>(
        &mut self,
        command: T,
        delivery_time_ms: u64,
    ) -> Result<(), MessageBusError> {
        self.write(command, MessageKind::Command, Some(delivery_time_ms))
    }

    /// Publishes `event`. Unscheduled events are also handled inside the
    /// current operation.
    ///
    /// # Errors
    ///
    /// Fails if the bus is committed or the event is invalid.
    pub fn publish<T: Any + Send + Sync>(&mut self, event: T) -> Result<(), MessageBusError> {
        self.write(event, MessageKind::Event, None)
    }

    /// Publishes `event` for delivery at `delivery_time_ms`. A delivery time
    /// in the future keeps the event out of in-process handling.
    ///
    /// # Errors
    ///
    /// Fails if the bus is committed or the event is invalid.
    pub fn publish_at<T: Any + Send + Sync>(
        &mut self,
        event: T,
        delivery_time_ms: u64,
    ) -> Result<(), MessageBusError> {
        self.write(event, MessageKind::Event, Some(delivery_time_ms))
    }

    fn write<T: Any + Send + Sync>(
        &mut self,
        content: T,
        kind: MessageKind,
        delivery_time_ms: Option<u64>,
    ) -> Result<(), MessageBusError> {
        if self.committed {
            return Err(MessageBusError::AlreadyCommitted);
        }
        let mut message = self
            .factory
            .create_as(content, kind, MessageDirection::Output)
            .with_delivery_time(delivery_time_ms)
            .into_any();
        if let Some(correlation_id) = &self.correlation_id {
            message = message.with_correlation_id(correlation_id.as_str());
        }
        self.factory.validate(&message, &self.validation)?;
        tracing::trace!(message = %message, "buffered output message");
        self.messages.push(message);
        Ok(())
    }

    /// Seals the bus and returns everything written, in write order.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::AlreadyCommitted`] on a second commit.
    pub fn commit(&mut self) -> Result<Vec<Message>, MessageBusError> {
        if self.committed {
            return Err(MessageBusError::AlreadyCommitted);
        }
        self.committed = true;
        Ok(std::mem::take(&mut self.messages))
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Messages written so far and not yet committed.
    #[must_use]
    pub fn pending(&self) -> &[Message] {
        &self.messages
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("correlation_id", &self.correlation_id)
            .field("pending", &self.messages.len())
            .field("committed", &self.committed)
            .finish_non_exhaustive()
    }
}
