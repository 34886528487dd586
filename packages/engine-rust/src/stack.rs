//! Operation stack trace.
//!
//! The stack trace is a persistent (immutable, structurally shared) list of
//! [`StackFrame`]s. [`OperationStackTrace::push`] returns a new trace whose
//! tail is the receiver; the receiver itself is never modified. Two branches
//! forked from the same ancestor therefore never observe each other's frames,
//! no matter how they are scheduled.

use std::fmt;
use std::sync::Arc;

use opflow_core::{Message, MessageKind};

use crate::cancel::OperationToken;

/// Kind of operation that pushed a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// A command or event handler invocation.
    MessageHandler,
    /// A query execution.
    Query,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageHandler => f.write_str("handler"),
            Self::Query => f.write_str("query"),
        }
    }
}

// ---------------------------------------------------------------------------
// StackFrame
// ---------------------------------------------------------------------------

/// One level of nested operation execution.
#[derive(Debug, Clone)]
pub struct StackFrame {
    component: &'static str,
    message: Option<Message>,
    token: OperationToken,
    kind: OperationKind,
}

impl StackFrame {
    /// Frame for a handler invoked with `message`.
    #[must_use]
    pub fn handler(component: &'static str, message: Message, token: OperationToken) -> Self {
        Self {
            component,
            message: Some(message),
            token,
            kind: OperationKind::MessageHandler,
        }
    }

    /// Frame for a query, with or without a request message.
    #[must_use]
    pub fn query(component: &'static str, message: Option<Message>, token: OperationToken) -> Self {
        Self {
            component,
            message,
            token,
            kind: OperationKind::Query,
        }
    }

    /// Type name of the handler or query executing in this frame.
    #[must_use]
    pub fn component(&self) -> &'static str {
        self.component
    }

    /// The message being processed, if any.
    #[must_use]
    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// The frame's cancellation token.
    #[must_use]
    pub fn token(&self) -> &OperationToken {
        &self.token
    }

    /// Which kind of operation pushed the frame.
    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Kind of the frame's message. Message-less query frames count as
    /// requests.
    #[must_use]
    pub fn message_kind(&self) -> MessageKind {
        self.message
            .as_ref()
            .map_or(MessageKind::Request, Message::kind)
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let component = self
            .component
            .rsplit("::")
            .next()
            .unwrap_or(self.component);
        match &self.message {
            Some(message) => write!(f, "{} {component}({message})", self.kind),
            None => write!(f, "{} {component}()", self.kind),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationStackTrace
// ---------------------------------------------------------------------------

struct Node {
    frame: StackFrame,
    parent: Option<Arc<Node>>,
    depth: usize,
}

/// Immutable chain of frames, innermost first.
#[derive(Clone, Default)]
pub struct OperationStackTrace {
    head: Option<Arc<Node>>,
}

impl OperationStackTrace {
    /// An empty trace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new trace with `frame` on top of this one.
    #[must_use]
    pub fn push(&self, frame: StackFrame) -> Self {
        let depth = self.len() + 1;
        Self {
            head: Some(Arc::new(Node {
                frame,
                parent: self.head.clone(),
                depth,
            })),
        }
    }

    /// Returns the trace without its top frame.
    #[must_use]
    pub fn pop(&self) -> Self {
        Self {
            head: self.head.as_ref().and_then(|node| node.parent.clone()),
        }
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.head.as_ref().map_or(0, |node| node.depth)
    }

    /// Returns `true` if no frame has been pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// The innermost (current) frame.
    #[must_use]
    pub fn current(&self) -> Option<&StackFrame> {
        self.head.as_deref().map(|node| &node.frame)
    }

    /// The outermost (root) frame.
    #[must_use]
    pub fn root(&self) -> Option<&StackFrame> {
        self.iter().last()
    }

    /// Iterates frames from innermost to outermost.
    pub fn iter(&self) -> impl Iterator<Item = &StackFrame> {
        let mut next = self.head.as_deref();
        std::iter::from_fn(move || {
            let node = next?;
            next = node.parent.as_deref();
            Some(&node.frame)
        })
    }

    /// Frames from outermost to innermost.
    #[must_use]
    pub fn frames(&self) -> Vec<&StackFrame> {
        let mut frames: Vec<_> = self.iter().collect();
        frames.reverse();
        frames
    }

    /// Returns `true` if every frame processes a command or request, meaning
    /// the whole chain was started by a client asking for something. An
    /// empty trace is not a client chain.
    #[must_use]
    pub fn is_bad_request(&self) -> bool {
        !self.is_empty()
            && self
                .iter()
                .all(|frame| frame.message_kind().is_client_request())
    }

    /// Returns `true` if any frame processes an event.
    #[must_use]
    pub fn contains_event(&self) -> bool {
        self.iter()
            .any(|frame| frame.message_kind() == MessageKind::Event)
    }
}

impl fmt::Debug for OperationStackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames()).finish()
    }
}

impl fmt::Display for OperationStackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, frame) in self.frames().into_iter().enumerate() {
            if depth > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{:indent$}at {frame}", "", indent = depth * 2)?;
        }
        Ok(())
    }
}
