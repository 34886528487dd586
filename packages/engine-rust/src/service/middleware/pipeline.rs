//! Pipeline composition.

use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use crate::config::ProcessorConfig;
use crate::error::OperationError;
use crate::operation::MessageHandlerOperationResult;
use crate::processor::MicroProcessor;
use crate::service::{ProcessorRequest, ProcessorService};

/// Wraps `processor` in the middleware stack.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` rejects requests beyond `config.max_concurrent_operations`
/// 2. `ProcessorService` routes the message through the processor
///
/// Outcome and duration are recorded by the processor itself.
#[must_use]
pub fn build_processor_pipeline(
    processor: MicroProcessor,
    config: &ProcessorConfig,
) -> impl tower::Service<
    ProcessorRequest,
    Response = MessageHandlerOperationResult,
    Error = OperationError,
> + Clone {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_operations))
        .service(ProcessorService::new(processor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
