//! Tower integration.
//!
//! [`ProcessorService`] exposes [`MicroProcessor::handle_message`] as a
//! `tower::Service` so the processor can sit behind the same middleware
//! stack as any other service. See [`middleware`] for the layers.

pub mod middleware;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use opflow_core::Message;
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::error::OperationError;
use crate::operation::MessageHandlerOperationResult;
use crate::processor::MicroProcessor;

pub use middleware::{build_processor_pipeline, LoadShedLayer};

/// A message to route through [`MicroProcessor::handle_message`].
#[derive(Debug, Clone)]
pub struct ProcessorRequest {
    pub message: Message,
    pub token: Option<CancellationToken>,
}

impl ProcessorRequest {
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message,
            token: None,
        }
    }

    /// Runs the request under `token`.
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl From<Message> for ProcessorRequest {
    fn from(message: Message) -> Self {
        Self::new(message)
    }
}

/// `tower::Service` adapter over a [`MicroProcessor`].
///
/// Always ready; concurrency limits belong to the layers wrapping it.
#[derive(Debug, Clone)]
pub struct ProcessorService {
    processor: MicroProcessor,
}

impl ProcessorService {
    #[must_use]
    pub fn new(processor: MicroProcessor) -> Self {
        Self { processor }
    }

    #[must_use]
    pub fn processor(&self) -> &MicroProcessor {
        &self.processor
    }
}

impl Service<ProcessorRequest> for ProcessorService {
    type Response = MessageHandlerOperationResult;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ProcessorRequest) -> Self::Future {
        let processor = self.processor.clone();
        Box::pin(async move { processor.handle_message(request.message, request.token).await })
    }
}
