//! Message validation primitives.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single validation failure for one member of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Name of the offending member, empty for message-level failures.
    pub field: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// One or more validation failures reported for a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("message {message_type} is invalid: {}", join(.errors))]
pub struct ValidationError {
    message_type: String,
    errors: Vec<FieldError>,
}

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    /// Creates an error for `message_type` with a single message-level failure.
    #[must_use]
    pub fn new(message_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            errors: vec![FieldError {
                field: String::new(),
                message: message.into(),
            }],
        }
    }

    /// Creates an error for `message_type` with the given field failures.
    #[must_use]
    pub fn with_errors(message_type: impl Into<String>, errors: Vec<FieldError>) -> Self {
        Self {
            message_type: message_type.into(),
            errors,
        }
    }

    /// Appends a field failure.
    #[must_use]
    pub fn field(mut self, field: impl Into<String>, message: impl Into<String>) -> Self {
        self.errors.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
        self
    }

    /// Name of the message type that failed validation.
    #[must_use]
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// The individual failures.
    #[must_use]
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }
}

/// Controls which messages the pipeline validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MessageValidationOptions {
    /// Validate messages entering the processor.
    pub input: bool,
    /// Validate messages produced by handlers and queries.
    pub output: bool,
    /// Accept messages whose kind cannot be resolved.
    pub allow_undefined_kind: bool,
}

impl Default for MessageValidationOptions {
    fn default() -> Self {
        Self {
            input: true,
            output: true,
            allow_undefined_kind: false,
        }
    }
}

impl MessageValidationOptions {
    /// Options that validate nothing and accept any kind.
    #[must_use]
    pub fn none() -> Self {
        Self {
            input: false,
            output: false,
            allow_undefined_kind: true,
        }
    }
}
