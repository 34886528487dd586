//! Handler registry: message type -> ordered dispatch table.

use std::any::{Any, TypeId};
use std::sync::Arc;

use dashmap::DashMap;
use opflow_core::{ContentType, MessageDirection};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::handler::{ErasedHandler, MessageHandler, TypedHandler};

// ---------------------------------------------------------------------------
// HandlerConfig
// ---------------------------------------------------------------------------

/// Streams a handler accepts messages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageSources {
    /// Messages handed to the processor from outside.
    pub input: bool,
    /// Messages produced by handlers within the same operation.
    pub output: bool,
}

impl Default for MessageSources {
    fn default() -> Self {
        Self {
            input: true,
            output: true,
        }
    }
}

impl MessageSources {
    /// Only external messages.
    #[must_use]
    pub fn input_only() -> Self {
        Self {
            input: true,
            output: false,
        }
    }

    /// Only messages produced inside the operation.
    #[must_use]
    pub fn output_only() -> Self {
        Self {
            input: false,
            output: true,
        }
    }

    /// Returns `true` if a message travelling in `direction` is accepted.
    #[must_use]
    pub fn accepts(self, direction: MessageDirection) -> bool {
        match direction {
            MessageDirection::Input => self.input,
            MessageDirection::Output | MessageDirection::Internal => self.output,
        }
    }
}

/// Per-registration handler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HandlerConfig {
    pub sources: MessageSources,
}

impl HandlerConfig {
    #[must_use]
    pub fn with_sources(sources: MessageSources) -> Self {
        Self { sources }
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn ErasedHandler>,
    config: HandlerConfig,
}

/// Registry of message handlers keyed by content type.
///
/// Handlers for one type are invoked in registration order. The registry is
/// usually built once at startup and shared through an `Arc`.
pub struct HandlerRegistry {
    by_type: DashMap<TypeId, Vec<Registration>>,
    /// Content types in first-registration order.
    types: RwLock<Vec<ContentType>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_type: DashMap::new(),
            types: RwLock::new(Vec::new()),
        }
    }

    /// Registers `handler` for messages with content `T`, accepting both
    /// sources.
    pub fn register<T, H>(&self, handler: H)
    where
        T: Any + Send + Sync,
        H: MessageHandler<T> + 'static,
    {
        self.register_with::<T, H>(handler, HandlerConfig::default());
    }

    /// Registers `handler` for messages with content `T`.
    pub fn register_with<T, H>(&self, handler: H, config: HandlerConfig)
    where
        T: Any + Send + Sync,
        H: MessageHandler<T> + 'static,
    {
        let content_type = ContentType::of::<T>();
        let registration = Registration {
            handler: Arc::new(TypedHandler::<T, H>::new(handler)),
            config,
        };
        tracing::debug!(
            message_type = content_type.short_name(),
            handler = registration.handler.component(),
            "registered handler"
        );
        let mut entry = self.by_type.entry(content_type.id()).or_default();
        if entry.is_empty() {
            self.types.write().push(content_type);
        }
        entry.push(registration);
    }

    /// Handlers bound to `content_type` that accept messages travelling in
    /// `direction`, in registration order.
    pub(crate) fn handlers_for(
        &self,
        content_type: ContentType,
        direction: MessageDirection,
    ) -> Vec<Arc<dyn ErasedHandler>> {
        self.by_type
            .get(&content_type.id())
            .map(|entry| {
                entry
                    .iter()
                    .filter(|r| r.config.sources.accepts(direction))
                    .map(|r| Arc::clone(&r.handler))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of handlers registered for `content_type`, regardless of source.
    #[must_use]
    pub fn handler_count(&self, content_type: ContentType) -> usize {
        self.by_type
            .get(&content_type.id())
            .map_or(0, |entry| entry.len())
    }

    /// Content types with at least one handler, in registration order.
    #[must_use]
    pub fn message_types(&self) -> Vec<ContentType> {
        self.types.read().clone()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.types.read().len())
            .finish_non_exhaustive()
    }
}
