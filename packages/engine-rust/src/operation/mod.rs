//! Root and nested operations.
//!
//! - `handler`: command and event execution with depth-first event fan-out
//! - `query`: read-only query execution
//! - [`result`]: result types returned by the façade

pub(crate) mod handler;
pub(crate) mod query;
pub mod result;

pub use result::{MessageHandlerOperationResult, QueryOperationResult};
