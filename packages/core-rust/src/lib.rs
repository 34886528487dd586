//! `opflow` core: message envelopes, message factory, validation and clock sources.

pub mod clock;
pub mod factory;
pub mod message;
pub mod principal;
pub mod validation;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use factory::{MessageFactory, MessageFactoryBuilder};
pub use message::{
    new_message_id, AnyContent, ContentType, Message, MessageDirection, MessageKind,
};
pub use principal::Principal;
pub use validation::{FieldError, MessageValidationOptions, ValidationError};
