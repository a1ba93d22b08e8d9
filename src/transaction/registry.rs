//! Context-local frame registry.
//!
//! Maps each execution context to its stack of frames, most recent last.
//! A context only ever touches its own stack; the map lock is held for a
//! single push or pop and never across session I/O.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::transaction::context::ContextId;
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::frame::Frame;

/// Frame stacks keyed by execution context.
pub struct TransactionRegistry<S> {
    stacks: RwLock<HashMap<ContextId, Vec<Arc<Frame<S>>>>>,
}

impl<S> TransactionRegistry<S> {
    pub fn new() -> Self {
        Self {
            stacks: RwLock::new(HashMap::new()),
        }
    }

    /// Top of the context's stack.
    pub fn current(&self, ctx: ContextId) -> Option<Arc<Frame<S>>> {
        self.stacks
            .read()
            .get(&ctx)
            .and_then(|stack| stack.last().cloned())
    }

    /// Push a frame, creating the context's stack on first use.
    pub fn push(&self, ctx: ContextId, frame: Arc<Frame<S>>) {
        let mut stacks = self.stacks.write();
        let stack = stacks.entry(ctx).or_default();
        stack.push(frame);
        log::trace!("context {} push, depth {}", ctx, stack.len());
    }

    /// Pop the top frame. The stack is dropped once it is empty.
    pub fn pop(&self, ctx: ContextId) -> TransactionResult<Arc<Frame<S>>> {
        let mut stacks = self.stacks.write();
        let stack = stacks.get_mut(&ctx).ok_or_else(|| {
            TransactionError::integrity(format!("pop on empty frame stack of context {}", ctx))
        })?;

        let frame = stack.pop().ok_or_else(|| {
            TransactionError::integrity(format!("pop on empty frame stack of context {}", ctx))
        })?;
        let depth = stack.len();
        if depth == 0 {
            stacks.remove(&ctx);
        }

        log::trace!("context {} pop, depth {}", ctx, depth);
        Ok(frame)
    }

    /// Start `ctx` with the given stack, bottom first.
    pub(crate) fn install(&self, ctx: ContextId, frames: Vec<Arc<Frame<S>>>) {
        log::trace!("context {} installed, depth {}", ctx, frames.len());
        if frames.is_empty() {
            self.stacks.write().remove(&ctx);
        } else {
            self.stacks.write().insert(ctx, frames);
        }
    }

    /// Remove the whole stack of `ctx`.
    pub(crate) fn discard(&self, ctx: ContextId) -> Vec<Arc<Frame<S>>> {
        let frames = self.stacks.write().remove(&ctx).unwrap_or_default();
        log::trace!("context {} discarded, depth {}", ctx, frames.len());
        frames
    }

    /// Number of frames on the context's stack.
    pub fn depth(&self, ctx: ContextId) -> usize {
        self.stacks.read().get(&ctx).map_or(0, Vec::len)
    }

    /// The context's frames, bottom first.
    pub fn frames(&self, ctx: ContextId) -> Vec<Arc<Frame<S>>> {
        self.stacks.read().get(&ctx).cloned().unwrap_or_default()
    }

    /// Contexts that currently have at least one frame.
    pub fn active_contexts(&self) -> Vec<ContextId> {
        self.stacks.read().keys().copied().collect()
    }
}

impl<S> Default for TransactionRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> std::fmt::Debug for TransactionRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRegistry")
            .field("contexts", &self.stacks.read().len())
            .finish()
    }
}
