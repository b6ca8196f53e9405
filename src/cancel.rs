use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation state shared by all clones of a token.
/// A child state also observes its parent.
struct CancelState {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelState>>,
}

impl CancelState {
    fn root() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: None,
        })
    }

    fn child_of(parent: Arc<CancelState>) -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            parent: Some(parent),
        })
    }

    #[inline]
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[inline]
    fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        match self.parent {
            Some(ref p) => p.is_cancelled(),
            None => false,
        }
    }
}

/// Cooperative stop signal passed to every stage of a pipeline.
///
/// Clones share state. Cancelling a token cancels all of its children,
/// cancelling a child leaves the parent untouched.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("is_cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// Create a new root token
    pub fn new() -> Self {
        Self {
            state: CancelState::root(),
        }
    }

    /// Cancel this token and every child derived from it
    #[inline]
    pub fn cancel(&self) {
        self.state.cancel();
    }

    /// Check if this token or any ancestor has been cancelled
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Create a child token linked to this one
    pub fn child(&self) -> Self {
        Self {
            state: CancelState::child_of(Arc::clone(&self.state)),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_parent_cancels_child() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn test_child_does_not_cancel_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
