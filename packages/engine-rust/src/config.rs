use opflow_core::MessageValidationOptions;
use serde::{Deserialize, Serialize};

/// How a unit of work flushes its change-tracker groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitOfWorkMode {
    /// Enlistment is rejected; nothing is buffered.
    Disabled,
    /// Groups flush one after another in enlistment order.
    #[default]
    SingleThreaded,
    /// Groups flush concurrently; trackers within a group flush serially.
    MultiThreaded,
}

/// Processor-level configuration.
///
/// Controls unit-of-work flushing, message validation, event recursion depth
/// and the concurrency limit enforced by the load-shedding layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessorConfig {
    /// Flush strategy for every root operation's unit of work.
    pub unit_of_work_mode: UnitOfWorkMode,
    /// Which messages are validated, and whether undefined kinds are accepted.
    pub message_validation: MessageValidationOptions,
    /// Maximum nesting of internally handled events below a root operation.
    pub max_event_depth: usize,
    /// Maximum number of concurrent operations before load shedding.
    pub max_concurrent_operations: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            unit_of_work_mode: UnitOfWorkMode::SingleThreaded,
            message_validation: MessageValidationOptions::default(),
            max_event_depth: 32,
            max_concurrent_operations: 1000,
        }
    }
}
