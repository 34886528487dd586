//! Hand-off of committed output to the external service bus.

use async_trait::async_trait;
use futures_util::future::try_join;
use opflow_core::{Message, MessageKind};
use tracing::debug;

/// External transport for messages produced by a successful root operation.
#[async_trait]
pub trait ServiceBusDispatcher: Send + Sync {
    /// Delivers commands, in production order.
    async fn send_commands(&self, commands: Vec<Message>) -> anyhow::Result<()>;

    /// Delivers events, in production order.
    async fn publish_events(&self, events: Vec<Message>) -> anyhow::Result<()>;
}

/// No-op dispatcher. Drops everything.
///
/// This is the default when no external service bus is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDispatcher;

#[async_trait]
impl ServiceBusDispatcher for NullDispatcher {
    async fn send_commands(&self, _commands: Vec<Message>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn publish_events(&self, _events: Vec<Message>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Splits `output` by kind and hands commands and events to `dispatcher`
/// concurrently. Messages of any other kind are not dispatched.
pub(crate) async fn dispatch(
    dispatcher: &dyn ServiceBusDispatcher,
    output: &[Message],
) -> anyhow::Result<()> {
    let (commands, events): (Vec<_>, Vec<_>) = output
        .iter()
        .filter(|m| matches!(m.kind(), MessageKind::Command | MessageKind::Event))
        .cloned()
        .partition(|m| m.kind() == MessageKind::Command);
    let (command_count, event_count) = (commands.len(), events.len());
    debug!(commands = command_count, events = event_count, "dispatching output");

    let send = async {
        if commands.is_empty() {
            Ok(())
        } else {
            dispatcher.send_commands(commands).await
        }
    };
    let publish = async {
        if events.is_empty() {
            Ok(())
        } else {
            dispatcher.publish_events(events).await
        }
    };
    try_join(send, publish).await?;

    metrics::counter!("opflow_dispatched_messages_total", "kind" => "command")
        .increment(command_count as u64);
    metrics::counter!("opflow_dispatched_messages_total", "kind" => "event")
        .increment(event_count as u64);
    Ok(())
}
