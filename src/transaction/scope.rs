//! Handle given to a running unit of work.

use std::sync::Arc;

use crate::transaction::error::{PropagationViolation, TransactionResult};
use crate::transaction::frame::{Frame, FrameId, FrameInfo, FrameKind};
use crate::transaction::propagation::Propagation;

/// View of the frame a unit of work runs in.
///
/// Cheap to clone, so it can be moved into async blocks.
pub struct TransactionScope<S> {
    frame: Arc<Frame<S>>,
    depth: usize,
}

impl<S> TransactionScope<S> {
    pub(crate) fn new(frame: Arc<Frame<S>>, depth: usize) -> Self {
        Self { frame, depth }
    }

    /// Session of the active transaction; `None` when running without one.
    pub fn session(&self) -> Option<&Arc<S>> {
        self.frame.session()
    }

    /// Session of the active transaction, or a propagation violation.
    pub fn require_session(&self) -> TransactionResult<&Arc<S>> {
        self.frame
            .session()
            .ok_or_else(|| PropagationViolation::NoActiveTransaction.into())
    }

    pub fn propagation(&self) -> Propagation {
        self.frame.propagation()
    }

    pub fn kind(&self) -> FrameKind {
        self.frame.kind()
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame.id()
    }

    pub fn is_read_only(&self) -> bool {
        self.frame.is_read_only()
    }

    /// Position of this frame on the context's stack, starting at 1.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Force the transaction scope of this unit of work to roll back
    /// without returning an error.
    ///
    /// For a joined unit the enclosing transaction is doomed when this unit
    /// exits; for a savepoint only the savepoint is rolled back.
    pub fn set_rollback_only(&self) {
        log::debug!("frame {} set rollback-only", self.frame.id());
        self.frame.set_rollback_only();
    }

    pub fn is_rollback_only(&self) -> bool {
        self.frame.is_rollback_only()
    }

    pub fn info(&self) -> FrameInfo {
        self.frame.info()
    }
}

impl<S> Clone for TransactionScope<S> {
    fn clone(&self) -> Self {
        Self {
            frame: self.frame.clone(),
            depth: self.depth,
        }
    }
}

impl<S> std::fmt::Debug for TransactionScope<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("frame", &self.frame)
            .field("depth", &self.depth)
            .finish()
    }
}
