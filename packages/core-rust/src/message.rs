//! Immutable message envelopes.
//!
//! A [`Message`] wraps shared, immutable content together with its identity,
//! correlation, kind, direction and optional delivery time. Every `with_*`
//! method returns a new envelope that shares the same content allocation, so
//! copies are cheap and the content itself is never mutated.
//!
//! The type parameter defaults to [`AnyContent`], the type-erased form used
//! by registries and output buffers. [`Message::downcast`] recovers the typed
//! form and [`Message::into_any`] erases it again.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Type-erased message content.
pub type AnyContent = dyn Any + Send + Sync;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// The role a message plays in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Kind could not be resolved for this message type.
    #[default]
    Undefined,
    /// A request to change state, handled by exactly one logical owner.
    Command,
    /// A notification that state has changed.
    Event,
    /// A read request executed by a query.
    Request,
    /// The answer produced by a query.
    Response,
}

impl MessageKind {
    /// Returns `true` for kinds that originate from a client asking for
    /// something (commands and requests).
    #[must_use]
    pub fn is_client_request(self) -> bool {
        matches!(self, Self::Command | Self::Request)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::Command => "command",
            Self::Event => "event",
            Self::Request => "request",
            Self::Response => "response",
        };
        f.write_str(name)
    }
}

/// Which stream a message belongs to relative to the running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageDirection {
    /// Received from outside the processor (external input stream).
    #[default]
    Input,
    /// Produced by a handler or query (output stream).
    Output,
    /// An output message being handled again inside the same operation.
    Internal,
}

// ---------------------------------------------------------------------------
// ContentType
// ---------------------------------------------------------------------------

/// Runtime identity of a message's content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentType {
    id: TypeId,
    name: &'static str,
}

impl ContentType {
    /// Returns the content type descriptor for `T`.
    #[must_use]
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The `TypeId` of the content.
    #[must_use]
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Fully qualified type name of the content.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path (`orders::PlaceOrder` -> `PlaceOrder`).
    #[must_use]
    pub fn short_name(&self) -> &'static str {
        let base = self.name.split('<').next().unwrap_or(self.name);
        let start = base.rfind("::").map_or(0, |idx| idx + 2);
        &self.name[start..]
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Immutable envelope around message content.
pub struct Message<T: ?Sized + Send + Sync = AnyContent> {
    content: Arc<T>,
    content_type: ContentType,
    id: Arc<str>,
    correlation_id: Option<Arc<str>>,
    kind: MessageKind,
    direction: MessageDirection,
    delivery_time_ms: Option<u64>,
}

/// Generates a fresh message identifier.
#[must_use]
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl<T: Any + Send + Sync> Message<T> {
    /// Wraps `content` in a new input envelope with a fresh id and
    /// [`MessageKind::Undefined`].
    #[must_use]
    pub fn new(content: T) -> Self {
        Self::with_id(content, new_message_id())
    }

    /// Wraps `content` in a new input envelope with the given id.
    #[must_use]
    pub fn with_id(content: T, id: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(content), id)
    }

    /// Wraps already-shared content in a new input envelope with the given id.
    #[must_use]
    pub fn from_arc(content: Arc<T>, id: impl Into<String>) -> Self {
        Self {
            content,
            content_type: ContentType::of::<T>(),
            id: Arc::from(id.into()),
            correlation_id: None,
            kind: MessageKind::Undefined,
            direction: MessageDirection::Input,
            delivery_time_ms: None,
        }
    }

    /// Erases the content type.
    #[must_use]
    pub fn into_any(self) -> Message {
        let content: Arc<AnyContent> = self.content;
        Message {
            content,
            content_type: self.content_type,
            id: self.id,
            correlation_id: self.correlation_id,
            kind: self.kind,
            direction: self.direction,
            delivery_time_ms: self.delivery_time_ms,
        }
    }
}

impl Message {
    /// Recovers the typed envelope, or returns `self` unchanged when the
    /// content is not a `T`.
    ///
    /// # Errors
    ///
    /// Returns the original envelope if the content type does not match.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Message<T>, Message> {
        if self.content_type.id != TypeId::of::<T>() {
            return Err(self);
        }
        match self.content.downcast::<T>() {
            Ok(content) => Ok(Message {
                content,
                content_type: self.content_type,
                id: self.id,
                correlation_id: self.correlation_id,
                kind: self.kind,
                direction: self.direction,
                delivery_time_ms: self.delivery_time_ms,
            }),
            Err(content) => Err(Message { content, ..self }),
        }
    }

    /// Borrows the content as `T` if the types match.
    #[must_use]
    pub fn content_as<T: Any>(&self) -> Option<&T> {
        (*self.content).downcast_ref::<T>()
    }

    /// Returns `true` if the content is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.content_type.id == TypeId::of::<T>()
    }
}

impl<T: ?Sized + Send + Sync> Message<T> {
    /// The message content.
    #[must_use]
    pub fn content(&self) -> &T {
        &self.content
    }

    /// Shared handle to the message content.
    #[must_use]
    pub fn content_arc(&self) -> Arc<T> {
        Arc::clone(&self.content)
    }

    /// Runtime type of the content.
    #[must_use]
    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Unique identifier of this message.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Identifier of the message that caused this one, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The message kind.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The message direction.
    #[must_use]
    pub fn direction(&self) -> MessageDirection {
        self.direction
    }

    /// Requested delivery time in milliseconds since the Unix epoch.
    #[must_use]
    pub fn delivery_time_ms(&self) -> Option<u64> {
        self.delivery_time_ms
    }

    /// Returns `true` if the message must not be delivered before a time
    /// that is still in the future relative to `now_ms`.
    #[must_use]
    pub fn is_scheduled_at(&self, now_ms: u64) -> bool {
        self.delivery_time_ms.is_some_and(|at| at > now_ms)
    }

    /// Returns a copy with a different kind.
    #[must_use]
    pub fn with_kind(&self, kind: MessageKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Returns a copy with a different direction.
    #[must_use]
    pub fn with_direction(&self, direction: MessageDirection) -> Self {
        Self {
            direction,
            ..self.clone()
        }
    }

    /// Returns a copy correlated to the given message id.
    #[must_use]
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(Arc::from(correlation_id.into())),
            ..self.clone()
        }
    }

    /// Returns a copy with a different (or no) delivery time.
    #[must_use]
    pub fn with_delivery_time(&self, delivery_time_ms: Option<u64>) -> Self {
        Self {
            delivery_time_ms,
            ..self.clone()
        }
    }

    /// Returns a copy with a fresh id, correlated to this message's id.
    #[must_use]
    pub fn correlate(&self) -> Self {
        Self {
            id: Arc::from(new_message_id()),
            correlation_id: Some(Arc::clone(&self.id)),
            ..self.clone()
        }
    }
}

impl<T: ?Sized + Send + Sync> Clone for Message<T> {
    fn clone(&self) -> Self {
        Self {
            content: Arc::clone(&self.content),
            content_type: self.content_type,
            id: Arc::clone(&self.id),
            correlation_id: self.correlation_id.clone(),
            kind: self.kind,
            direction: self.direction,
            delivery_time_ms: self.delivery_time_ms,
        }
    }
}

impl<T: ?Sized + Send + Sync> fmt::Debug for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("content_type", &self.content_type.short_name())
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("kind", &self.kind)
            .field("direction", &self.direction)
            .field("delivery_time_ms", &self.delivery_time_ms)
            .finish_non_exhaustive()
    }
}

impl<T: ?Sized + Send + Sync> fmt::Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.content_type, self.kind, self.id)
    }
}
