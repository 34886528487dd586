//! Cancellation tokens with identity.
//!
//! [`OperationToken`] wraps a `tokio_util` [`CancellationToken`] and adds the
//! two facts the classifier needs: *which* token was observed (tokens compare
//! by identity) and *why* it fired (explicit cancel vs. elapsed timeout).
//! Child tokens remember their parent so a cancellation observed deep in the
//! call tree can be related back to the root operation's token.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

struct TokenState {
    inner: CancellationToken,
    timed_out: AtomicBool,
    parent: Option<OperationToken>,
}

/// Cooperative cancellation token for an operation frame.
///
/// Clones share state; equality is identity.
#[derive(Clone)]
pub struct OperationToken {
    state: Arc<TokenState>,
}

impl OperationToken {
    /// Creates a new, independent token.
    #[must_use]
    pub fn new() -> Self {
        Self::from_cancellation_token(CancellationToken::new())
    }

    /// Wraps a caller-supplied token. Cancelling `token` cancels this one.
    #[must_use]
    pub fn from_cancellation_token(token: CancellationToken) -> Self {
        Self {
            state: Arc::new(TokenState {
                inner: token,
                timed_out: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Creates a descendant token that is cancelled whenever this one is.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            state: Arc::new(TokenState {
                inner: self.state.inner.child_token(),
                timed_out: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Creates a descendant token that cancels itself after `timeout`.
    ///
    /// The timer stops when the returned guard is dropped. Must be called
    /// from within a tokio runtime.
    #[must_use]
    pub fn child_with_timeout(&self, timeout: Duration) -> (Self, TimeoutGuard) {
        let child = self.child();
        let timer = child.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    timer.state.timed_out.store(true, Ordering::SeqCst);
                    timer.cancel();
                }
                () = timer.cancelled() => {}
            }
        });
        (
            child,
            TimeoutGuard {
                abort: handle.abort_handle(),
            },
        )
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.state.inner.cancel();
    }

    /// Returns `true` once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.inner.is_cancelled()
    }

    /// Returns `true` if this token was cancelled by its own timeout.
    #[must_use]
    pub fn is_timed_out(&self) -> bool {
        self.state.timed_out.load(Ordering::SeqCst)
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        self.state.inner.cancelled().await;
    }

    /// The token this one was derived from, if any.
    #[must_use]
    pub fn parent(&self) -> Option<&OperationToken> {
        self.state.parent.as_ref()
    }

    /// Returns `true` if `ancestor` is a (transitive) parent of this token.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &OperationToken) -> bool {
        let mut current = self.state.parent.as_ref();
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = parent.state.parent.as_ref();
        }
        false
    }

    /// The underlying `tokio_util` token, for passing to I/O libraries.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.inner.clone()
    }
}

impl Default for OperationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for OperationToken {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl Eq for OperationToken {}

impl fmt::Debug for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationToken")
            .field("cancelled", &self.is_cancelled())
            .field("timed_out", &self.is_timed_out())
            .field("has_parent", &self.state.parent.is_some())
            .finish()
    }
}

/// Stops a timeout timer when dropped.
#[derive(Debug)]
pub struct TimeoutGuard {
    abort: AbortHandle,
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_are_equal_distinct_tokens_are_not() {
        let a = OperationToken::new();
        let b = a.clone();
        let c = OperationToken::new();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let parent = OperationToken::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(!child.is_timed_out());
        assert!(child.is_descendant_of(&parent));
        assert!(!parent.is_descendant_of(&child));
    }

    #[test]
    fn cancelling_child_leaves_parent_running() {
        let parent = OperationToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn descendant_check_is_transitive() {
        let root = OperationToken::new();
        let grandchild = root.child().child();
        assert!(grandchild.is_descendant_of(&root));
        assert!(!grandchild.is_descendant_of(&OperationToken::new()));
    }

    #[test]
    fn wraps_caller_token() {
        let caller = CancellationToken::new();
        let token = OperationToken::from_cancellation_token(caller.clone());
        caller.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_and_marks_child() {
        let parent = OperationToken::new();
        let (child, _guard) = parent.child_with_timeout(Duration::from_millis(50));
        assert!(!child.is_cancelled());

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(child.is_cancelled());
        assert!(child.is_timed_out());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_guard_stops_timer() {
        let parent = OperationToken::new();
        let (child, guard) = parent.child_with_timeout(Duration::from_millis(50));
        drop(guard);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!child.is_cancelled());
        assert!(!child.is_timed_out());
    }
}
