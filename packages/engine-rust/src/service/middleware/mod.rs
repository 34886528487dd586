//! Tower middleware for the processor pipeline.
//!
//! - [`load_shed`]: semaphore-based concurrency limiting
//! - [`pipeline`]: composes the layers around a [`ProcessorService`](super::ProcessorService)

pub mod load_shed;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use pipeline::build_processor_pipeline;
