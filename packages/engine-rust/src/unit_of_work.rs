//! Unit of work: grouped, transactional flushing of change trackers.
//!
//! Trackers are enlisted under their group id. A group is the unit of
//! concurrency: trackers sharing a group are always flushed one after another,
//! separate groups may be flushed concurrently in
//! [`UnitOfWorkMode::MultiThreaded`]. A unit of work makes exactly one pass,
//! either [`save_changes`](UnitOfWork::save_changes) or
//! [`undo_changes`](UnitOfWork::undo_changes), and is closed afterwards.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::UnitOfWorkMode;
use crate::error::ExecutionError;

/// Unique identifier of a unit of work, passed to every tracker call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnitOfWorkId(uuid::Uuid);

impl UnitOfWorkId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for UnitOfWorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitOfWorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// ChangeTracker trait
// ---------------------------------------------------------------------------

/// A resource manager whose pending changes are flushed by a unit of work.
///
/// Identity within a unit of work is the pair (`group_id`, `resource_id`).
#[async_trait]
pub trait ChangeTracker: Send + Sync {
    /// Trackers sharing a group id are never flushed concurrently.
    fn group_id(&self) -> &str;

    /// Identifies the resource within its group.
    fn resource_id(&self) -> &str;

    /// Returns `true` if there is anything to save for `unit_of_work_id`.
    fn has_changes(&self, unit_of_work_id: UnitOfWorkId) -> bool;

    /// Persists pending changes.
    async fn save_changes(&self, unit_of_work_id: UnitOfWorkId) -> Result<(), ExecutionError>;

    /// Discards pending changes.
    async fn undo_changes(&self, unit_of_work_id: UnitOfWorkId);
}

/// Errors from enlisting into a [`UnitOfWork`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitOfWorkError {
    #[error("unit of work is disabled")]
    Disabled,
    #[error("unit of work {0} has already completed")]
    Completed(UnitOfWorkId),
}

impl From<UnitOfWorkError> for ExecutionError {
    fn from(error: UnitOfWorkError) -> Self {
        Self::Unexpected(anyhow::Error::new(error))
    }
}

// ---------------------------------------------------------------------------
// UnitOfWork
// ---------------------------------------------------------------------------

struct TrackerGroup {
    group_id: String,
    trackers: Vec<Arc<dyn ChangeTracker>>,
}

#[derive(Default)]
struct State {
    groups: Vec<TrackerGroup>,
    completed: bool,
}

/// Transactional buffer of change trackers for one root operation.
pub struct UnitOfWork {
    id: UnitOfWorkId,
    mode: UnitOfWorkMode,
    state: Mutex<State>,
}

impl UnitOfWork {
    #[must_use]
    pub fn new(mode: UnitOfWorkMode) -> Self {
        Self {
            id: UnitOfWorkId::new(),
            mode,
            state: Mutex::new(State::default()),
        }
    }

    #[must_use]
    pub fn id(&self) -> UnitOfWorkId {
        self.id
    }

    #[must_use]
    pub fn mode(&self) -> UnitOfWorkMode {
        self.mode
    }

    /// Enlists `tracker`. Returns `false` if a tracker with the same identity
    /// was already enlisted.
    ///
    /// # Errors
    ///
    /// Fails if the unit of work is disabled or has already completed.
    pub fn enlist(&self, tracker: Arc<dyn ChangeTracker>) -> Result<bool, UnitOfWorkError> {
        if self.mode == UnitOfWorkMode::Disabled {
            return Err(UnitOfWorkError::Disabled);
        }
        let mut state = self.state.lock();
        if state.completed {
            return Err(UnitOfWorkError::Completed(self.id));
        }
        let group_id = tracker.group_id();
        let position = state.groups.iter().position(|g| g.group_id == group_id);
        let group = match position {
            Some(index) => &mut state.groups[index],
            None => {
                state.groups.push(TrackerGroup {
                    group_id: group_id.to_string(),
                    trackers: Vec::new(),
                });
                let last = state.groups.len() - 1;
                &mut state.groups[last]
            }
        };
        let resource_id = tracker.resource_id();
        if group
            .trackers
            .iter()
            .any(|t| t.resource_id() == resource_id)
        {
            return Ok(false);
        }
        debug!(
            unit_of_work = %self.id,
            group = group_id,
            resource = resource_id,
            "enlisted change tracker"
        );
        group.trackers.push(tracker);
        Ok(true)
    }

    /// Number of distinct trackers currently enlisted.
    #[must_use]
    pub fn tracker_count(&self) -> usize {
        self.state
            .lock()
            .groups
            .iter()
            .map(|g| g.trackers.len())
            .sum()
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.lock().completed
    }

    fn take_groups(&self) -> Vec<TrackerGroup> {
        let mut state = self.state.lock();
        state.completed = true;
        std::mem::take(&mut state.groups)
    }

    /// Flushes every enlisted tracker that has changes.
    ///
    /// If any group fails, every group in the snapshot is rolled back and the
    /// error of the first failing group in enlistment order is returned.
    ///
    /// # Errors
    ///
    /// Returns the first tracker failure.
    pub async fn save_changes(&self) -> Result<(), ExecutionError> {
        let groups = self.take_groups();
        if groups.is_empty() {
            return Ok(());
        }
        debug!(unit_of_work = %self.id, groups = groups.len(), mode = ?self.mode, "flushing");

        let outcome = match self.mode {
            UnitOfWorkMode::Disabled => Ok(()),
            UnitOfWorkMode::SingleThreaded => {
                let mut outcome = Ok(());
                for group in &groups {
                    if let Err(e) = self.flush_group(group).await {
                        outcome = Err(e);
                        break;
                    }
                }
                outcome
            }
            UnitOfWorkMode::MultiThreaded => join_all(groups.iter().map(|g| self.flush_group(g)))
                .await
                .into_iter()
                .find(Result::is_err)
                .unwrap_or(Ok(())),
        };

        if let Err(e) = outcome {
            warn!(unit_of_work = %self.id, error = %e, "flush failed, rolling back");
            self.rollback(&groups).await;
            return Err(e);
        }
        Ok(())
    }

    /// Discards every enlisted tracker's changes and closes the unit of work.
    pub async fn undo_changes(&self) {
        let groups = self.take_groups();
        if !groups.is_empty() {
            debug!(unit_of_work = %self.id, groups = groups.len(), "rolling back");
            self.rollback(&groups).await;
        }
    }

    async fn flush_group(&self, group: &TrackerGroup) -> Result<(), ExecutionError> {
        for tracker in &group.trackers {
            if tracker.has_changes(self.id) {
                debug!(
                    unit_of_work = %self.id,
                    group = %group.group_id,
                    resource = tracker.resource_id(),
                    "saving changes"
                );
                tracker.save_changes(self.id).await?;
            }
        }
        Ok(())
    }

    async fn rollback(&self, groups: &[TrackerGroup]) {
        for tracker in groups.iter().flat_map(|g| &g.trackers) {
            tracker.undo_changes(self.id).await;
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("groups", &state.groups.len())
            .field("completed", &state.completed)
            .finish()
    }
}
