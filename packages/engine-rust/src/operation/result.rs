use opflow_core::{Message, MessageKind};

/// Outcome of a successful command or event operation.
#[derive(Debug, Clone)]
pub struct MessageHandlerOperationResult {
    input: Message,
    output: Vec<Message>,
    handler_count: usize,
}

impl MessageHandlerOperationResult {
    /// A result for `input` with no output and no invocations yet.
    #[must_use]
    pub fn empty(input: Message) -> Self {
        Self {
            input,
            output: Vec::new(),
            handler_count: 0,
        }
    }

    /// The message that started the operation.
    #[must_use]
    pub fn input(&self) -> &Message {
        &self.input
    }

    /// Every message produced, in depth-first production order.
    #[must_use]
    pub fn output(&self) -> &[Message] {
        &self.output
    }

    /// Output commands, in order.
    pub fn commands(&self) -> impl Iterator<Item = &Message> {
        self.output
            .iter()
            .filter(|m| m.kind() == MessageKind::Command)
    }

    /// Output events, in order.
    pub fn events(&self) -> impl Iterator<Item = &Message> {
        self.output.iter().filter(|m| m.kind() == MessageKind::Event)
    }

    /// Number of handler invocations, including internally handled events.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handler_count
    }

    pub(crate) fn record_invocation(&mut self) {
        self.handler_count += 1;
    }

    pub(crate) fn push_output(&mut self, message: Message) {
        self.output.push(message);
    }

    /// Concatenates `other` onto this result. The input is kept.
    pub fn append(&mut self, other: MessageHandlerOperationResult) {
        self.output.extend(other.output);
        self.handler_count += other.handler_count;
    }

    /// Consumes the result, returning its output.
    #[must_use]
    pub fn into_output(self) -> Vec<Message> {
        self.output
    }
}

/// Outcome of a successful query.
#[derive(Debug, Clone)]
pub struct QueryOperationResult<R: Send + Sync + 'static> {
    input: Option<Message>,
    output: Message<R>,
}

impl<R: Send + Sync + 'static> QueryOperationResult<R> {
    pub(crate) fn new(input: Option<Message>, output: Message<R>) -> Self {
        Self { input, output }
    }

    /// The request message, if the query had one.
    #[must_use]
    pub fn input(&self) -> Option<&Message> {
        self.input.as_ref()
    }

    /// The response envelope.
    #[must_use]
    pub fn output(&self) -> &Message<R> {
        &self.output
    }

    /// The response value.
    #[must_use]
    pub fn value(&self) -> &R {
        self.output.content()
    }
}
