//! Propagation engine.
//!
//! The engine owns the decision table for entering a unit of work and the
//! finalization rules for leaving it, but performs no session I/O itself.
//! A boundary drives it in four steps:
//!
//! ```text
//!   plan_entry ──► (session I/O: open/begin or begin_nested) ──► activate
//!        unit of work runs, possibly entering nested boundaries
//!   plan_exit  ──► (session I/O: commit/rollback/release/close) ──► complete_exit
//! ```
//!
//! The blocking and the async boundary differ only in how they perform
//! the I/O between the steps, so the state machine exists once.
//!
//! Frames are activated in one of two ways. The blocking boundary pushes
//! onto the caller's stack and pops on exit, restoring any frame it
//! suspended. The async boundary forks: the unit of work gets a fresh
//! context whose stack is a copy of the caller's (minus a suspended top
//! frame) plus the new frame, and the whole stack is discarded on exit.
//! The caller's stack is never touched, so boundaries polled concurrently
//! by one task cannot interleave their pushes and pops.

use std::sync::Arc;

use crate::session::{SavepointToken, SessionError, SessionOp};
use crate::transaction::context::{ContextId, ContextIdentity};
use crate::transaction::error::{PropagationViolation, TransactionError, TransactionResult};
use crate::transaction::frame::{Frame, FrameInfo, FrameKind};
use crate::transaction::options::TransactionOptions;
use crate::transaction::propagation::Propagation;
use crate::transaction::registry::TransactionRegistry;
use crate::transaction::scope::TransactionScope;

/// What entering a unit of work requires.
pub(crate) enum EntryAction<S> {
    /// Open a session and begin a transaction on it.
    Begin,
    /// Participate in the given frame's transaction.
    Join(Arc<Frame<S>>),
    /// Create a savepoint on the given frame's session.
    Savepoint(Arc<Frame<S>>),
    /// Run without a session.
    Detached,
}

/// Entry decision, made before any side effect.
pub(crate) struct EntryPlan<S> {
    ctx: ContextId,
    propagation: Propagation,
    read_only: bool,
    suspend: bool,
    action: EntryAction<S>,
}

impl<S> EntryPlan<S> {
    pub(crate) fn action(&self) -> &EntryAction<S> {
        &self.action
    }
}

/// Result of the entry I/O.
pub(crate) enum Resolved<S> {
    Opened(Arc<S>),
    Savepoint(SavepointToken),
    Nothing,
}

/// An entered unit of work, to be exited exactly once.
pub(crate) struct Entered<S> {
    ctx: ContextId,
    frame: Arc<Frame<S>>,
    suspended: Option<Arc<Frame<S>>>,
    depth: usize,
    forked: bool,
}

impl<S> Entered<S> {
    pub(crate) fn scope(&self) -> TransactionScope<S> {
        TransactionScope::new(self.frame.clone(), self.depth)
    }

    pub(crate) fn frame(&self) -> &Arc<Frame<S>> {
        &self.frame
    }

    /// Context the unit of work must run in.
    pub(crate) fn context_id(&self) -> ContextId {
        self.ctx
    }
}

/// Session I/O needed to finalize a frame.
pub(crate) enum Finalize<S> {
    /// Roll back the `discard`ed savepoints, then commit and close. A
    /// read-only frame may skip the commit when the session supports it.
    Commit {
        session: Arc<S>,
        read_only: bool,
        discard: Vec<SavepointToken>,
    },
    /// Roll back and close.
    Rollback(Arc<S>),
    /// Roll back the `discard`ed savepoints, then release `token`.
    Release {
        session: Arc<S>,
        token: SavepointToken,
        discard: Vec<SavepointToken>,
    },
    /// Roll back to the savepoint, then release it.
    RollbackTo(Arc<S>, SavepointToken),
    Nothing,
}

impl<S> Finalize<S> {
    fn describe(&self) -> &'static str {
        match self {
            Finalize::Commit { .. } => "commit",
            Finalize::Rollback(_) => "rollback",
            Finalize::Release { .. } => "release savepoint",
            Finalize::RollbackTo(..) => "rollback to savepoint",
            Finalize::Nothing => "none",
        }
    }
}

/// Exit decision.
pub(crate) struct ExitPlan<S> {
    pub(crate) finalize: Finalize<S>,
    mark_parent: bool,
    unexpected_rollback: bool,
}

/// A session operation that failed during finalization.
#[derive(Debug)]
pub(crate) struct FinalizeFailure {
    op: SessionOp,
    source: SessionError,
    rolling_back: bool,
}

impl FinalizeFailure {
    /// Failure while keeping the unit's changes (commit or release).
    pub(crate) fn commit(op: SessionOp, source: SessionError) -> Self {
        Self {
            op,
            source,
            rolling_back: false,
        }
    }

    /// Failure while discarding changes.
    pub(crate) fn rollback(op: SessionOp, source: SessionError) -> Self {
        Self {
            op,
            source,
            rolling_back: true,
        }
    }

    pub(crate) fn into_error(self, original: Option<TransactionError>) -> TransactionError {
        let original = original.map(Box::new);
        let FinalizeFailure {
            op,
            source,
            rolling_back,
        } = self;
        match op {
            SessionOp::Close => TransactionError::Close { source, original },
            _ if rolling_back => TransactionError::Rollback {
                op,
                source,
                original,
            },
            _ => TransactionError::Commit {
                op,
                source,
                original,
            },
        }
    }
}

/// Frame bookkeeping shared by the blocking and async boundaries.
pub struct PropagationEngine<S> {
    registry: TransactionRegistry<S>,
    identity: Arc<dyn ContextIdentity>,
}

impl<S> PropagationEngine<S> {
    pub fn new(identity: Arc<dyn ContextIdentity>) -> Self {
        Self {
            registry: TransactionRegistry::new(),
            identity,
        }
    }

    pub fn registry(&self) -> &TransactionRegistry<S> {
        &self.registry
    }

    pub fn context_id(&self) -> ContextId {
        self.identity.current_context_id()
    }

    /// Whether async units of work get a forked context of their own.
    pub(crate) fn forks_per_unit(&self) -> bool {
        self.identity.follows_task_scope()
    }

    /// Top frame of the calling context.
    pub fn current_frame(&self) -> Option<Arc<Frame<S>>> {
        self.registry.current(self.context_id())
    }

    /// Session of the calling context's active transaction.
    pub fn current_session(&self) -> Option<Arc<S>> {
        self.current_frame().and_then(|f| f.session().cloned())
    }

    pub fn depth(&self) -> usize {
        self.registry.depth(self.context_id())
    }

    pub fn has_active_transaction(&self) -> bool {
        self.current_frame().is_some_and(|f| f.is_transactional())
    }

    /// Snapshot of the calling context's frames, bottom first.
    pub fn frames(&self) -> Vec<FrameInfo> {
        self.registry
            .frames(self.context_id())
            .iter()
            .map(|f| f.info())
            .collect()
    }

    /// Decide how to enter a unit of work. Fails without side effects.
    pub(crate) fn plan_entry(&self, options: &TransactionOptions) -> TransactionResult<EntryPlan<S>> {
        let ctx = self.context_id();
        let existing = self
            .registry
            .current(ctx)
            .filter(|frame| frame.is_transactional());
        let propagation = options.propagation;

        let action = match (propagation, existing.clone()) {
            (Propagation::Required | Propagation::Supports | Propagation::Mandatory, Some(parent)) => {
                EntryAction::Join(parent)
            }
            (Propagation::Nested, Some(parent)) => EntryAction::Savepoint(parent),
            (Propagation::Required | Propagation::Nested, None) | (Propagation::RequiresNew, _) => {
                EntryAction::Begin
            }
            (Propagation::Supports | Propagation::Never, None) | (Propagation::NotSupported, _) => {
                EntryAction::Detached
            }
            (Propagation::Mandatory, None) => {
                return Err(PropagationViolation::NoActiveTransaction.into());
            }
            (Propagation::Never, Some(_)) => {
                return Err(PropagationViolation::TransactionNotAllowed.into());
            }
        };

        let suspend = existing.is_some() && propagation.suspends_existing();
        log::debug!(
            "context {}: enter {} ({}{})",
            ctx,
            propagation,
            match &action {
                EntryAction::Begin => "begin",
                EntryAction::Join(_) => "join",
                EntryAction::Savepoint(_) => "savepoint",
                EntryAction::Detached => "no transaction",
            },
            if suspend { ", suspending current" } else { "" }
        );

        Ok(EntryPlan {
            ctx,
            propagation,
            read_only: options.read_only,
            suspend,
            action,
        })
    }

    /// Push the frame for a planned entry whose I/O has completed.
    pub(crate) fn activate(
        &self,
        plan: EntryPlan<S>,
        resolved: Resolved<S>,
    ) -> TransactionResult<Entered<S>> {
        let (ctx, suspend, frame) = Self::build_frame(plan, resolved)?;

        let suspended = if suspend {
            Some(self.registry.pop(ctx)?)
        } else {
            None
        };

        self.registry.push(ctx, frame.clone());
        let depth = self.registry.depth(ctx);

        Ok(Entered {
            ctx,
            frame,
            suspended,
            depth,
            forked: false,
        })
    }

    /// Install the frame for a planned entry in a fresh context that
    /// starts as a copy of the planning context's stack.
    pub(crate) fn activate_forked(
        &self,
        plan: EntryPlan<S>,
        resolved: Resolved<S>,
    ) -> TransactionResult<Entered<S>> {
        let (parent_ctx, suspend, frame) = Self::build_frame(plan, resolved)?;

        let mut stack = self.registry.frames(parent_ctx);
        if suspend {
            stack.pop();
        }
        stack.push(frame.clone());
        let depth = stack.len();

        let ctx = ContextId::generate();
        log::trace!("context {}: fork {} for frame {}", parent_ctx, ctx, frame.id());
        self.registry.install(ctx, stack);

        Ok(Entered {
            ctx,
            frame,
            suspended: None,
            depth,
            forked: true,
        })
    }

    fn build_frame(
        plan: EntryPlan<S>,
        resolved: Resolved<S>,
    ) -> TransactionResult<(ContextId, bool, Arc<Frame<S>>)> {
        let EntryPlan {
            ctx,
            propagation,
            read_only,
            suspend,
            action,
        } = plan;

        let frame = match (action, resolved) {
            (EntryAction::Begin, Resolved::Opened(session)) => {
                Frame::owner(propagation, session, read_only)
            }
            (EntryAction::Join(parent), Resolved::Nothing) => {
                Frame::joined(propagation, &parent, read_only)
            }
            (EntryAction::Savepoint(parent), Resolved::Savepoint(token)) => {
                Frame::nested(propagation, &parent, token, read_only)
            }
            (EntryAction::Detached, Resolved::Nothing) => Frame::detached(propagation, read_only),
            _ => {
                return Err(TransactionError::integrity(
                    "entry resolved with a session state its plan did not ask for",
                ));
            }
        };
        Ok((ctx, suspend, Arc::new(frame)))
    }

    /// Decide how to finalize a frame, given the unit of work's failure (if any).
    pub(crate) fn plan_exit(
        &self,
        entered: &Entered<S>,
        failure: Option<&TransactionError>,
        options: &TransactionOptions,
    ) -> ExitPlan<S> {
        let frame = &entered.frame;
        let failed = failure.is_some_and(|err| options.triggers_rollback(err));
        let doomed = frame.is_rollback_only();
        let rollback = failed || doomed;

        if doomed && !failed {
            log::warn!(
                "context {}: frame {} is rollback-only, rolling back",
                entered.ctx,
                frame.id()
            );
        }

        let mut mark_parent = false;
        let finalize = match (frame.kind(), frame.session().cloned()) {
            (FrameKind::Owner, Some(session)) if rollback => {
                frame.take_deferred_savepoints();
                Finalize::Rollback(session)
            }
            (FrameKind::Owner, Some(session)) => Finalize::Commit {
                session,
                read_only: frame.is_read_only(),
                discard: frame.take_deferred_savepoints(),
            },
            (FrameKind::Savepoint, Some(session)) => match frame.savepoint() {
                Some(token) if rollback => {
                    frame.take_deferred_savepoints();
                    Finalize::RollbackTo(session, token)
                }
                Some(token) => Finalize::Release {
                    session,
                    token,
                    discard: frame.take_deferred_savepoints(),
                },
                None => Finalize::Nothing,
            },
            // A doom inherited from the parent is already the parent's.
            (FrameKind::Joined, _) => {
                mark_parent = failed || frame.raised_rollback_only();
                Finalize::Nothing
            }
            _ => Finalize::Nothing,
        };

        let unexpected_rollback = matches!(finalize, Finalize::Rollback(_))
            && failure.is_none()
            && frame.marked_by_participant();

        log::debug!(
            "context {}: exit {} frame {} ({})",
            entered.ctx,
            frame.propagation(),
            frame.id(),
            finalize.describe()
        );

        ExitPlan {
            finalize,
            mark_parent,
            unexpected_rollback,
        }
    }

    /// Doom the parent of `frame` on behalf of `frame`.
    pub(crate) fn doom_parent(&self, frame: &Frame<S>) {
        if let Some(parent) = frame.parent() {
            log::debug!(
                "frame {} marks parent {} rollback-only",
                frame.id(),
                parent.id()
            );
            parent.mark_rollback_only_by_participant();
        }
    }

    /// Doom the transaction `frame` takes part in, on behalf of a
    /// participant whose savepoint bookkeeping failed.
    pub(crate) fn doom_transaction(&self, frame: &Arc<Frame<S>>) {
        let holder = frame.finalizing();
        log::debug!("frame {} marked rollback-only", holder.id());
        holder.mark_rollback_only_by_participant();
    }

    /// Take the savepoints abandoned below `parent` that must be rolled
    /// back before another savepoint is created on its session.
    pub(crate) fn take_deferred_savepoints(&self, parent: &Arc<Frame<S>>) -> Vec<SavepointToken> {
        parent.finalizing().take_deferred_savepoints()
    }

    /// Hand the savepoint of an abandoned frame to the frame that
    /// finalizes its session, to be rolled back at that frame's next
    /// savepoint entry or exit.
    pub(crate) fn defer_savepoint_rollback(&self, frame: &Frame<S>) {
        if let (Some(parent), Some(token)) = (frame.parent(), frame.savepoint()) {
            let holder = parent.finalizing();
            log::debug!(
                "savepoint {} of frame {} deferred to frame {}",
                token,
                frame.id(),
                holder.id()
            );
            holder.defer_savepoint_rollback(token);
        }
    }

    /// Remove the exited frame from its context.
    ///
    /// `savepoint_failed` dooms the enclosing transaction when a savepoint
    /// could not be released or rolled back.
    pub(crate) fn complete_exit(
        &self,
        entered: Entered<S>,
        mark_parent: bool,
        savepoint_failed: bool,
    ) -> TransactionResult<()> {
        let Entered {
            ctx,
            frame,
            suspended,
            forked,
            ..
        } = entered;

        if mark_parent || savepoint_failed {
            self.doom_parent(&frame);
        }

        if forked {
            let stack = self.registry.discard(ctx);
            return match stack.last() {
                Some(top) if Arc::ptr_eq(top, &frame) => Ok(()),
                _ => Err(TransactionError::integrity(format!(
                    "context {} of frame {} was left with {} frames and a different top",
                    ctx,
                    frame.id(),
                    stack.len()
                ))),
            };
        }

        let popped = self.registry.pop(ctx)?;
        if !Arc::ptr_eq(&popped, &frame) {
            let found = popped.id();
            self.registry.push(ctx, popped);
            return Err(TransactionError::integrity(format!(
                "exiting frame {} but frame {} is on top of context {}",
                frame.id(),
                found,
                ctx
            )));
        }

        if let Some(suspended) = suspended {
            log::trace!("context {}: resume frame {}", ctx, suspended.id());
            self.registry.push(ctx, suspended);
        }
        Ok(())
    }

    /// Exit a frame whose unit of work panicked or was cancelled.
    ///
    /// Bookkeeping completes immediately and a joined frame dooms its
    /// parent. Returns the I/O the caller should still attempt; a savepoint
    /// frame only dooms its parent if that I/O fails or cannot be run.
    pub(crate) fn abandon(&self, entered: Entered<S>) -> Finalize<S> {
        let frame = entered.frame.clone();
        log::warn!(
            "context {}: abandoning {} frame {}",
            entered.ctx,
            frame.propagation(),
            frame.id()
        );

        let joined = frame.kind() == FrameKind::Joined;
        if let Err(err) = self.complete_exit(entered, joined, false) {
            log::error!("abandoned frame {}: {}", frame.id(), err);
        }

        match (frame.kind(), frame.session().cloned(), frame.savepoint()) {
            (FrameKind::Owner, Some(session), _) => Finalize::Rollback(session),
            (FrameKind::Savepoint, Some(session), Some(token)) => {
                Finalize::RollbackTo(session, token)
            }
            _ => Finalize::Nothing,
        }
    }

    /// Combine the unit of work's result with the exit outcome.
    ///
    /// The unit's own error wins unless finalization failed, in which case
    /// the finalization error is returned with the unit's error attached.
    fn conclude<T>(
        &self,
        result: TransactionResult<T>,
        plan: &ExitPlan<S>,
        finalized: Result<(), FinalizeFailure>,
        bookkeeping: TransactionResult<()>,
    ) -> TransactionResult<T> {
        if let Err(failure) = finalized {
            if let Err(err) = bookkeeping {
                log::error!("{}", err);
            }
            let err = failure.into_error(result.err());
            log::error!("transaction finalization failed: {}", err);
            return Err(err);
        }

        bookkeeping?;
        match result {
            Ok(_) if plan.unexpected_rollback => Err(TransactionError::UnexpectedRollback),
            other => other,
        }
    }

    /// Exit with the given I/O outcome: bookkeeping, then result composition.
    pub(crate) fn finish<T>(
        &self,
        entered: Entered<S>,
        plan: ExitPlan<S>,
        result: TransactionResult<T>,
        finalized: Result<(), FinalizeFailure>,
    ) -> TransactionResult<T> {
        let savepoint_failed = finalized.is_err()
            && matches!(plan.finalize, Finalize::Release { .. } | Finalize::RollbackTo(..));
        let bookkeeping = self.complete_exit(entered, plan.mark_parent, savepoint_failed);
        self.conclude(result, &plan, finalized, bookkeeping)
    }
}

impl<S> std::fmt::Debug for PropagationEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropagationEngine")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::context::AmbientContext;

    struct FixedContext(ContextId);

    impl ContextIdentity for FixedContext {
        fn current_context_id(&self) -> ContextId {
            self.0
        }
    }

    fn setup() -> PropagationEngine<&'static str> {
        PropagationEngine::new(Arc::new(FixedContext(ContextId::generate())))
    }

    fn enter(
        engine: &PropagationEngine<&'static str>,
        propagation: Propagation,
    ) -> TransactionResult<Entered<&'static str>> {
        let plan = engine.plan_entry(&TransactionOptions::new(propagation))?;
        let resolved = match plan.action() {
            EntryAction::Begin => Resolved::Opened(Arc::new("session")),
            EntryAction::Savepoint(_) => Resolved::Savepoint(SavepointToken::new(1)),
            EntryAction::Join(_) | EntryAction::Detached => Resolved::Nothing,
        };
        engine.activate(plan, resolved)
    }

    fn exit(
        engine: &PropagationEngine<&'static str>,
        entered: Entered<&'static str>,
        failure: Option<TransactionError>,
    ) -> (&'static str, TransactionResult<()>) {
        let plan = engine.plan_exit(&entered, failure.as_ref(), &TransactionOptions::default());
        let action = plan.finalize.describe();
        let result = match failure {
            Some(err) => Err(err),
            None => Ok(()),
        };
        (action, engine.finish(entered, plan, result, Ok(())))
    }

    fn kind_for(propagation: Propagation, with_existing: bool) -> TransactionResult<FrameKind> {
        let engine = setup();
        let _outer = if with_existing {
            Some(enter(&engine, Propagation::Required)?)
        } else {
            None
        };
        let inner = enter(&engine, propagation)?;
        Ok(inner.frame().kind())
    }

    #[test]
    fn test_decision_table_without_transaction() {
        assert_eq!(kind_for(Propagation::Required, false).unwrap(), FrameKind::Owner);
        assert_eq!(kind_for(Propagation::RequiresNew, false).unwrap(), FrameKind::Owner);
        assert_eq!(kind_for(Propagation::Nested, false).unwrap(), FrameKind::Owner);
        assert_eq!(kind_for(Propagation::Supports, false).unwrap(), FrameKind::NoTransaction);
        assert_eq!(kind_for(Propagation::NotSupported, false).unwrap(), FrameKind::NoTransaction);
        assert_eq!(kind_for(Propagation::Never, false).unwrap(), FrameKind::NoTransaction);
        assert!(matches!(
            kind_for(Propagation::Mandatory, false),
            Err(TransactionError::Propagation(PropagationViolation::NoActiveTransaction))
        ));
    }

    #[test]
    fn test_decision_table_with_transaction() {
        assert_eq!(kind_for(Propagation::Required, true).unwrap(), FrameKind::Joined);
        assert_eq!(kind_for(Propagation::RequiresNew, true).unwrap(), FrameKind::Owner);
        assert_eq!(kind_for(Propagation::Nested, true).unwrap(), FrameKind::Savepoint);
        assert_eq!(kind_for(Propagation::Supports, true).unwrap(), FrameKind::Joined);
        assert_eq!(kind_for(Propagation::Mandatory, true).unwrap(), FrameKind::Joined);
        assert_eq!(kind_for(Propagation::NotSupported, true).unwrap(), FrameKind::NoTransaction);
        assert!(matches!(
            kind_for(Propagation::Never, true),
            Err(TransactionError::Propagation(PropagationViolation::TransactionNotAllowed))
        ));
    }

    #[test]
    fn test_every_mode_restores_stack() {
        for mode in Propagation::ALL {
            if mode == Propagation::Never {
                continue;
            }
            let engine = setup();
            let outer = enter(&engine, Propagation::Required).unwrap();
            let top = engine.current_frame().unwrap().id();

            let inner = enter(&engine, mode).unwrap();
            assert_eq!(engine.depth(), if mode.suspends_existing() { 1 } else { 2 });
            let (_, result) = exit(&engine, inner, None);
            result.unwrap();

            assert_eq!(engine.depth(), 1, "mode {}", mode);
            assert_eq!(engine.current_frame().unwrap().id(), top, "mode {}", mode);
            exit(&engine, outer, None).1.unwrap();
            assert_eq!(engine.depth(), 0);
        }
    }

    #[test]
    fn test_suspended_frame_is_hidden() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();
        let inner = enter(&engine, Propagation::NotSupported).unwrap();

        assert!(!engine.has_active_transaction());
        assert!(engine.current_session().is_none());

        exit(&engine, inner, None).1.unwrap();
        assert!(engine.has_active_transaction());
        exit(&engine, outer, None).1.unwrap();
    }

    #[test]
    fn test_exit_actions() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();

        let joined = enter(&engine, Propagation::Required).unwrap();
        assert_eq!(exit(&engine, joined, None).0, "none");

        let nested = enter(&engine, Propagation::Nested).unwrap();
        let (action, result) = exit(&engine, nested, Some(TransactionError::unit("boom")));
        assert_eq!(action, "rollback to savepoint");
        assert!(matches!(result, Err(TransactionError::Unit(_))));
        assert!(!outer.frame().is_rollback_only());

        assert_eq!(exit(&engine, outer, None).0, "commit");
    }

    #[test]
    fn test_joined_failure_dooms_owner() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();
        let middle = enter(&engine, Propagation::Mandatory).unwrap();
        let inner = enter(&engine, Propagation::Supports).unwrap();

        exit(&engine, inner, Some(TransactionError::unit("boom"))).1.unwrap_err();
        assert!(middle.frame().is_rollback_only());
        assert!(!outer.frame().is_rollback_only());

        // The middle frame succeeded, but it is doomed and passes that on.
        exit(&engine, middle, None).1.unwrap();
        assert!(outer.frame().is_rollback_only());

        let (action, result) = exit(&engine, outer, None);
        assert_eq!(action, "rollback");
        assert!(matches!(result, Err(TransactionError::UnexpectedRollback)));
    }

    #[test]
    fn test_owner_rollback_only_is_silent() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();
        outer.scope().set_rollback_only();

        let (action, result) = exit(&engine, outer, None);
        assert_eq!(action, "rollback");
        result.unwrap();
    }

    #[test]
    fn test_inherited_rollback_only_is_not_passed_back() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();
        outer.scope().set_rollback_only();

        let joined = enter(&engine, Propagation::Required).unwrap();
        assert!(joined.frame().is_rollback_only());
        exit(&engine, joined, None).1.unwrap();
        assert!(!outer.frame().marked_by_participant());

        let (action, result) = exit(&engine, outer, None);
        assert_eq!(action, "rollback");
        result.unwrap();
    }

    #[test]
    fn test_failure_path_decides_error_kind() {
        let on_rollback = FinalizeFailure::rollback(SessionOp::Release, SessionError::Closed);
        assert!(matches!(
            on_rollback.into_error(None),
            TransactionError::Rollback {
                op: SessionOp::Release,
                ..
            }
        ));

        let on_commit = FinalizeFailure::commit(SessionOp::Release, SessionError::Closed);
        assert!(matches!(
            on_commit.into_error(None),
            TransactionError::Commit {
                op: SessionOp::Release,
                ..
            }
        ));
    }

    #[test]
    fn test_finalization_failure_carries_original() {
        let engine = setup();
        let entered = enter(&engine, Propagation::Required).unwrap();
        let failure = TransactionError::unit("boom");
        let plan = engine.plan_exit(&entered, Some(&failure), &TransactionOptions::default());

        let result: TransactionResult<()> = engine.finish(
            entered,
            plan,
            Err(failure),
            Err(FinalizeFailure::rollback(SessionOp::Rollback, SessionError::Closed)),
        );

        let err = result.unwrap_err();
        assert!(matches!(err, TransactionError::Rollback { .. }));
        assert!(matches!(err.original(), Some(TransactionError::Unit(_))));
        assert_eq!(engine.depth(), 0);
    }

    #[test]
    fn test_out_of_order_exit_is_integrity_error() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();
        let _inner = enter(&engine, Propagation::Required).unwrap();

        let err = engine.complete_exit(outer, false, false).unwrap_err();
        assert!(matches!(err, TransactionError::Integrity(_)));
        assert_eq!(engine.depth(), 2);
    }

    #[test]
    fn test_abandon_restores_stack() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();
        let inner = enter(&engine, Propagation::RequiresNew).unwrap();

        assert!(matches!(engine.abandon(inner), Finalize::Rollback(_)));
        assert_eq!(engine.current_frame().unwrap().id(), outer.frame().id());

        let joined = enter(&engine, Propagation::Required).unwrap();
        assert!(matches!(engine.abandon(joined), Finalize::Nothing));
        assert!(outer.frame().is_rollback_only());
    }

    #[test]
    fn test_abandoned_savepoint_is_rolled_back_by_owner() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();
        let joined = enter(&engine, Propagation::Required).unwrap();
        let nested = enter(&engine, Propagation::Nested).unwrap();
        let nested_frame = nested.frame().clone();

        assert!(matches!(engine.abandon(nested), Finalize::RollbackTo(..)));
        engine.defer_savepoint_rollback(&nested_frame);
        assert!(!outer.frame().is_rollback_only());

        exit(&engine, joined, None).1.unwrap();
        let plan = engine.plan_exit(&outer, None, &TransactionOptions::default());
        match &plan.finalize {
            Finalize::Commit { discard, .. } => {
                assert_eq!(discard, &vec![nested_frame.savepoint().unwrap()]);
            }
            _ => panic!("expected commit"),
        }
        engine.finish(outer, plan, Ok(()), Ok(())).unwrap();
    }

    #[test]
    fn test_forked_units_do_not_interleave() {
        let engine = setup();
        let outer = enter(&engine, Propagation::Required).unwrap();

        // Two siblings planned from the same context, exited in entry order.
        let first = engine
            .activate_forked(
                engine.plan_entry(&TransactionOptions::default()).unwrap(),
                Resolved::Nothing,
            )
            .unwrap();
        let second = engine
            .activate_forked(
                engine.plan_entry(&TransactionOptions::new(Propagation::RequiresNew)).unwrap(),
                Resolved::Opened(Arc::new("other")),
            )
            .unwrap();

        assert_eq!(first.scope().depth(), 2);
        assert_eq!(second.scope().depth(), 1);
        assert_ne!(first.context_id(), second.context_id());
        assert_eq!(engine.depth(), 1);

        exit(&engine, first, None).1.unwrap();
        exit(&engine, second, None).1.unwrap();

        assert_eq!(engine.current_frame().unwrap().id(), outer.frame().id());
        assert_eq!(engine.registry().active_contexts().len(), 1);
        exit(&engine, outer, None).1.unwrap();
        assert!(engine.registry().active_contexts().is_empty());
    }

    #[test]
    fn test_contexts_do_not_share_frames() {
        let engine: PropagationEngine<()> = PropagationEngine::new(Arc::new(AmbientContext));
        let plan = engine
            .plan_entry(&TransactionOptions::new(Propagation::Supports))
            .unwrap();
        let _entered = engine.activate(plan, Resolved::Nothing).unwrap();
        assert_eq!(engine.depth(), 1);

        std::thread::scope(|s| {
            s.spawn(|| {
                assert_eq!(engine.depth(), 0);
                assert!(engine.current_frame().is_none());
            });
        });
    }
}
