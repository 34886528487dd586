//! Message factory: explicit message-type registrations.
//!
//! The factory maps content types to their [`MessageKind`] and optional
//! validator. It is built once at startup through [`MessageFactoryBuilder`]
//! and shared read-only afterwards.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::message::{AnyContent, ContentType, Message, MessageDirection, MessageKind};
use crate::validation::{MessageValidationOptions, ValidationError};

type ErasedValidator = Arc<dyn Fn(&AnyContent) -> Result<(), ValidationError> + Send + Sync>;

/// Registration for a single content type.
#[derive(Clone)]
struct MessageType {
    kind: MessageKind,
    validator: Option<ErasedValidator>,
}

// ---------------------------------------------------------------------------
// MessageFactory
// ---------------------------------------------------------------------------

/// Creates message envelopes and validates them against registered rules.
#[derive(Clone, Default)]
pub struct MessageFactory {
    types: HashMap<TypeId, MessageType>,
}

impl MessageFactory {
    /// Starts building a factory.
    #[must_use]
    pub fn builder() -> MessageFactoryBuilder {
        MessageFactoryBuilder::default()
    }

    /// Returns the registered kind for a content type, or
    /// [`MessageKind::Undefined`] if the type is unknown.
    #[must_use]
    pub fn kind_of(&self, content_type: ContentType) -> MessageKind {
        self.types
            .get(&content_type.id())
            .map_or(MessageKind::Undefined, |t| t.kind)
    }

    /// Creates an envelope for `content` with the registered kind.
    #[must_use]
    pub fn create<T: Any + Send + Sync>(
        &self,
        content: T,
        direction: MessageDirection,
    ) -> Message<T> {
        let msg = Message::new(content);
        let kind = self.kind_of(msg.content_type());
        msg.with_kind(kind).with_direction(direction)
    }

    /// Creates an envelope for `content` with an explicit kind, ignoring any
    /// registration.
    #[must_use]
    pub fn create_as<T: Any + Send + Sync>(
        &self,
        content: T,
        kind: MessageKind,
        direction: MessageDirection,
    ) -> Message<T> {
        Message::new(content)
            .with_kind(kind)
            .with_direction(direction)
    }

    /// Resolves an `Undefined` kind from the registrations. Messages with a
    /// kind already set are returned unchanged.
    #[must_use]
    pub fn resolve_kind(&self, message: &Message) -> Message {
        if message.kind() == MessageKind::Undefined {
            message.with_kind(self.kind_of(message.content_type()))
        } else {
            message.clone()
        }
    }

    /// Validates a message according to `options`.
    ///
    /// Input and internal messages are checked when `options.input` is set,
    /// output messages when `options.output` is set. The kind check applies
    /// regardless of direction.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if the kind is undefined and not allowed,
    /// or if the registered validator rejects the content.
    pub fn validate(
        &self,
        message: &Message,
        options: &MessageValidationOptions,
    ) -> Result<(), ValidationError> {
        let content_type = message.content_type();
        if message.kind() == MessageKind::Undefined && !options.allow_undefined_kind {
            return Err(ValidationError::new(
                content_type.short_name(),
                "message kind could not be resolved",
            ));
        }
        let enabled = match message.direction() {
            MessageDirection::Input | MessageDirection::Internal => options.input,
            MessageDirection::Output => options.output,
        };
        if !enabled {
            return Ok(());
        }
        match self
            .types
            .get(&content_type.id())
            .and_then(|t| t.validator.as_ref())
        {
            Some(validator) => {
                tracing::trace!(message_type = content_type.short_name(), "validating message");
                validator(message.content())
            }
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFactory")
            .field("registered_types", &self.types.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MessageFactoryBuilder
// ---------------------------------------------------------------------------

/// Builder for [`MessageFactory`].
#[derive(Default)]
pub struct MessageFactoryBuilder {
    types: HashMap<TypeId, MessageType>,
}

impl MessageFactoryBuilder {
    /// Registers `T` with the given kind. Re-registering replaces the kind
    /// and keeps any validator.
    #[must_use]
    pub fn register<T: Any + Send + Sync>(mut self, kind: MessageKind) -> Self {
        self.types
            .entry(TypeId::of::<T>())
            .and_modify(|t| t.kind = kind)
            .or_insert(MessageType {
                kind,
                validator: None,
            });
        self
    }

    /// Registers `T` as a command.
    #[must_use]
    pub fn command<T: Any + Send + Sync>(self) -> Self {
        self.register::<T>(MessageKind::Command)
    }

    /// Registers `T` as an event.
    #[must_use]
    pub fn event<T: Any + Send + Sync>(self) -> Self {
        self.register::<T>(MessageKind::Event)
    }

    /// Registers `T` as a query request.
    #[must_use]
    pub fn request<T: Any + Send + Sync>(self) -> Self {
        self.register::<T>(MessageKind::Request)
    }

    /// Registers `T` as a query response.
    #[must_use]
    pub fn response<T: Any + Send + Sync>(self) -> Self {
        self.register::<T>(MessageKind::Response)
    }

    /// Attaches a validator to `T`. Unregistered types keep an undefined kind.
    #[must_use]
    pub fn validator<T, F>(mut self, validate: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) -> Result<(), ValidationError> + Send + Sync + 'static,
    {
        let erased: ErasedValidator = Arc::new(move |content: &AnyContent| {
            match content.downcast_ref::<T>() {
                Some(typed) => validate(typed),
                None => Err(ValidationError::new(
                    std::any::type_name::<T>(),
                    "content does not match the registered type",
                )),
            }
        });
        self.types
            .entry(TypeId::of::<T>())
            .and_modify(|t| t.validator = Some(Arc::clone(&erased)))
            .or_insert(MessageType {
                kind: MessageKind::Undefined,
                validator: Some(erased),
            });
        self
    }

    /// Finishes the factory.
    #[must_use]
    pub fn build(self) -> MessageFactory {
        MessageFactory { types: self.types }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PlaceOrder {
        quantity: u32,
    }
    struct OrderPlaced;
    struct GetOrder;
    struct Unknown;

    fn factory() -> MessageFactory {
        MessageFactory::builder()
            .command::<PlaceOrder>()
            .event::<OrderPlaced>()
            .request::<GetOrder>()
            .validator::<PlaceOrder, _>(|cmd| {
                if cmd.quantity == 0 {
                    Err(ValidationError::new("PlaceOrder", "quantity must be positive"))
                } else {
                    Ok(())
                }
            })
            .build()
    }

    #[test]
    fn create_resolves_registered_kind() {
        let f = factory();
        let cmd = f.create(PlaceOrder { quantity: 1 }, MessageDirection::Input);
        assert_eq!(cmd.kind(), MessageKind::Command);
        let evt = f.create(OrderPlaced, MessageDirection::Output);
        assert_eq!(evt.kind(), MessageKind::Event);
        assert_eq!(evt.direction(), MessageDirection::Output);
        let unknown = f.create(Unknown, MessageDirection::Input);
        assert_eq!(unknown.kind(), MessageKind::Undefined);
    }

    #[test]
    fn resolve_kind_only_fills_undefined() {
        let f = factory();
        let msg = Message::new(GetOrder).into_any();
        assert_eq!(f.resolve_kind(&msg).kind(), MessageKind::Request);

        let explicit = Message::new(GetOrder)
            .with_kind(MessageKind::Command)
            .into_any();
        assert_eq!(f.resolve_kind(&explicit).kind(), MessageKind::Command);
    }

    #[test]
    fn validate_rejects_undefined_kind_unless_allowed() {
        let f = factory();
        let msg = Message::new(Unknown).into_any();
        assert!(f.validate(&msg, &MessageValidationOptions::default()).is_err());
        let lenient = MessageValidationOptions {
            allow_undefined_kind: true,
            ..MessageValidationOptions::default()
        };
        assert!(f.validate(&msg, &lenient).is_ok());
    }

    #[test]
    fn validate_runs_registered_validator_per_direction() {
        let f = factory();
        let bad_input = f
            .create(PlaceOrder { quantity: 0 }, MessageDirection::Input)
            .into_any();
        let err = f
            .validate(&bad_input, &MessageValidationOptions::default())
            .unwrap_err();
        assert_eq!(err.message_type(), "PlaceOrder");

        let input_off = MessageValidationOptions {
            input: false,
            ..MessageValidationOptions::default()
        };
        assert!(f.validate(&bad_input, &input_off).is_ok());

        let bad_output = bad_input.with_direction(MessageDirection::Output);
        assert!(f.validate(&bad_output, &input_off).is_err());
    }

    #[test]
    fn validator_without_kind_leaves_kind_undefined() {
        let f = MessageFactory::builder()
            .validator::<Unknown, _>(|_| Ok(()))
            .build();
        assert_eq!(
            f.kind_of(ContentType::of::<Unknown>()),
            MessageKind::Undefined
        );
    }
}
