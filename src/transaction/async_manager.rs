//! Async transaction manager - the unit-of-work boundary for async code.
//!
//! Mirrors [`TransactionManager`](crate::transaction::TransactionManager) on
//! top of [`AsyncSessionProvider`]. Every unit of work runs in a task-local
//! context of its own, forked from its caller's frame stack, so it may hop
//! between worker threads at every await point and still see its
//! transaction, and boundaries polled side by side in one task
//! (`tokio::join!`, `select!`) never disturb each other's frames.
//!
//! A boundary future that is dropped before it completes (timeout, select,
//! task abort) still leaves the frame stacks consistent: the unit's context
//! is discarded synchronously, the rollback of an owned session is handed
//! to the runtime as a detached task, and an abandoned savepoint is rolled
//! back by the enclosing transaction before it creates another savepoint
//! or finishes.

use std::future::Future;
use std::sync::Arc;

use crate::session::{AsyncSession, AsyncSessionProvider, SavepointToken, SessionOp};
use crate::transaction::context::{within_context, AmbientContext, ContextId, ContextIdentity};
use crate::transaction::engine::{
    Entered, EntryAction, EntryPlan, Finalize, FinalizeFailure, PropagationEngine, Resolved,
};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::frame::FrameInfo;
use crate::transaction::options::TransactionOptions;
use crate::transaction::propagation::Propagation;
use crate::transaction::scope::TransactionScope;

/// Async transaction boundary.
///
/// Clone is cheap; clones share provider and frame stacks.
pub struct AsyncTransactionManager<P: AsyncSessionProvider> {
    inner: Arc<AsyncTransactionManagerInner<P>>,
}

struct AsyncTransactionManagerInner<P: AsyncSessionProvider> {
    provider: P,
    engine: Arc<PropagationEngine<P::Session>>,
}

impl<P: AsyncSessionProvider> AsyncTransactionManager<P> {
    pub fn new(provider: P) -> Self {
        Self::with_identity(provider, Arc::new(AmbientContext))
    }

    /// Create a manager keyed by a host-supplied context identity.
    pub fn with_identity(provider: P, identity: Arc<dyn ContextIdentity>) -> Self {
        Self::with_engine(provider, Arc::new(PropagationEngine::new(identity)))
    }

    /// Create a manager sharing frame stacks with other boundaries on `engine`.
    pub fn with_engine(provider: P, engine: Arc<PropagationEngine<P::Session>>) -> Self {
        Self {
            inner: Arc::new(AsyncTransactionManagerInner { provider, engine }),
        }
    }

    pub fn provider(&self) -> &P {
        &self.inner.provider
    }

    pub fn engine(&self) -> &Arc<PropagationEngine<P::Session>> {
        &self.inner.engine
    }

    /// Number of frames in the calling context.
    pub fn depth(&self) -> usize {
        self.inner.engine.depth()
    }

    pub fn has_active_transaction(&self) -> bool {
        self.inner.engine.has_active_transaction()
    }

    pub fn current_session(&self) -> Option<Arc<P::Session>> {
        self.inner.engine.current_session()
    }

    /// Frames of the calling context, outermost first.
    pub fn frames(&self) -> Vec<FrameInfo> {
        self.inner.engine.frames()
    }

    pub fn active_contexts(&self) -> Vec<ContextId> {
        self.inner.engine.registry().active_contexts()
    }

    /// Run `f` in a `REQUIRED` transaction.
    pub async fn with_transaction<F, Fut, T>(&self, f: F) -> TransactionResult<T>
    where
        F: FnOnce(TransactionScope<P::Session>) -> Fut,
        Fut: Future<Output = TransactionResult<T>>,
    {
        self.execute(&TransactionOptions::default(), f).await
    }

    /// Run `f` with a specific propagation mode.
    pub async fn with_propagation<F, Fut, T>(
        &self,
        propagation: Propagation,
        f: F,
    ) -> TransactionResult<T>
    where
        F: FnOnce(TransactionScope<P::Session>) -> Fut,
        Fut: Future<Output = TransactionResult<T>>,
    {
        self.execute(&TransactionOptions::new(propagation), f).await
    }

    /// Run `f` as a unit of work configured by `options`.
    ///
    /// `f` runs in a context forked from the caller's, so boundaries
    /// awaited inside it nest in this unit's transaction.
    pub async fn execute<F, Fut, T>(&self, options: &TransactionOptions, f: F) -> TransactionResult<T>
    where
        F: FnOnce(TransactionScope<P::Session>) -> Fut,
        Fut: Future<Output = TransactionResult<T>>,
    {
        let engine = &self.inner.engine;
        let forked = engine.forks_per_unit();

        let plan = engine.plan_entry(options)?;
        let resolved = self.resolve(&plan).await?;
        let entered = if forked {
            engine.activate_forked(plan, resolved)?
        } else {
            engine.activate(plan, resolved)?
        };
        let ctx = entered.context_id();
        let scope = entered.scope();

        // Armed until the exit I/O is done, so dropping this future at any
        // await point below still removes the frame.
        let mut guard = ExitGuard {
            engine,
            entered: Some(entered),
        };

        let unit = f(scope);
        let result = if forked {
            within_context(ctx, unit).await
        } else {
            unit.await
        };

        let plan = engine.plan_exit(guard.entered()?, result.as_ref().err(), options);
        let finalized = finalize_async(&plan.finalize).await;
        let entered = guard.disarm()?;
        engine.finish(entered, plan, result, finalized)
    }

    /// Perform the session I/O an entry plan asks for.
    async fn resolve(
        &self,
        plan: &EntryPlan<P::Session>,
    ) -> TransactionResult<Resolved<P::Session>> {
        match plan.action() {
            EntryAction::Begin => {
                let session = self.inner.provider.open().await.map_err(|source| {
                    TransactionError::Begin {
                        op: SessionOp::Open,
                        source,
                    }
                })?;
                let session = Arc::new(session);
                let mut pending = PendingSession(Some(session.clone()));

                if let Err(source) = session.begin().await {
                    if let Err(err) = session.close().await {
                        log::warn!("closing session after failed begin: {}", err);
                    }
                    pending.disarm();
                    return Err(TransactionError::Begin {
                        op: SessionOp::Begin,
                        source,
                    });
                }
                pending.disarm();
                Ok(Resolved::Opened(session))
            }
            EntryAction::Savepoint(parent) => {
                let session = parent.session().ok_or_else(|| {
                    TransactionError::integrity("savepoint requested on a frame without session")
                })?;
                let deferred = self.inner.engine.take_deferred_savepoints(parent);
                if let Err(failure) = discard_savepoints(&**session, &deferred).await {
                    self.inner.engine.doom_transaction(parent);
                    return Err(failure.into_error(None));
                }
                let token = session.begin_nested().await.map_err(|source| {
                    TransactionError::Begin {
                        op: SessionOp::BeginNested,
                        source,
                    }
                })?;
                Ok(Resolved::Savepoint(token))
            }
            EntryAction::Join(_) | EntryAction::Detached => Ok(Resolved::Nothing),
        }
    }
}

/// Roll back and release savepoints left behind by abandoned units.
async fn discard_savepoints<S: AsyncSession>(
    session: &S,
    tokens: &[SavepointToken],
) -> Result<(), FinalizeFailure> {
    for token in tokens {
        log::debug!("discarding abandoned savepoint {}", token);
        session
            .rollback_to(*token)
            .await
            .map_err(|source| FinalizeFailure::rollback(SessionOp::RollbackTo, source))?;
        session
            .release(*token)
            .await
            .map_err(|source| FinalizeFailure::rollback(SessionOp::Release, source))?;
    }
    Ok(())
}

async fn commit<S: AsyncSession>(
    session: &S,
    read_only: bool,
    discard: &[SavepointToken],
) -> Result<(), FinalizeFailure> {
    discard_savepoints(session, discard).await?;
    if read_only && session.supports_read_only() {
        log::debug!("read-only transaction, skipping commit");
        return Ok(());
    }
    session
        .commit()
        .await
        .map_err(|source| FinalizeFailure::commit(SessionOp::Commit, source))
}

/// Run the finalization I/O of an exit plan on an async session.
async fn finalize_async<S: AsyncSession>(finalize: &Finalize<S>) -> Result<(), FinalizeFailure> {
    match finalize {
        Finalize::Commit {
            session,
            read_only,
            discard,
        } => {
            if let Err(failure) = commit(&**session, *read_only, discard).await {
                if let Err(err) = session.rollback().await {
                    log::warn!("rollback after failed commit: {}", err);
                }
                if let Err(err) = session.close().await {
                    log::warn!("close after failed commit: {}", err);
                }
                return Err(failure);
            }
            session
                .close()
                .await
                .map_err(|source| FinalizeFailure::commit(SessionOp::Close, source))
        }
        Finalize::Rollback(session) => {
            let rolled_back = session.rollback().await;
            let closed = session.close().await;
            match (rolled_back, closed) {
                (Err(source), closed) => {
                    if let Err(err) = closed {
                        log::warn!("close after failed rollback: {}", err);
                    }
                    Err(FinalizeFailure::rollback(SessionOp::Rollback, source))
                }
                (Ok(()), Err(source)) => Err(FinalizeFailure::rollback(SessionOp::Close, source)),
                (Ok(()), Ok(())) => Ok(()),
            }
        }
        Finalize::Release {
            session,
            token,
            discard,
        } => {
            discard_savepoints(&**session, discard).await?;
            session
                .release(*token)
                .await
                .map_err(|source| FinalizeFailure::commit(SessionOp::Release, source))
        }
        Finalize::RollbackTo(session, token) => {
            session
                .rollback_to(*token)
                .await
                .map_err(|source| FinalizeFailure::rollback(SessionOp::RollbackTo, source))?;
            session
                .release(*token)
                .await
                .map_err(|source| FinalizeFailure::rollback(SessionOp::Release, source))
        }
        Finalize::Nothing => Ok(()),
    }
}

/// Roll back and close `session` on the current runtime, detached from the
/// caller.
fn spawn_cleanup<S: AsyncSession>(session: Arc<S>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(err) = session.rollback().await {
                    log::warn!("rollback of abandoned session: {}", err);
                }
                if let Err(err) = session.close().await {
                    log::warn!("close of abandoned session: {}", err);
                }
            });
        }
        Err(_) => log::error!("no runtime to clean up abandoned session, leaving it open"),
    }
}

/// Exits the frame if the boundary future is dropped mid-flight.
struct ExitGuard<'a, S: AsyncSession> {
    engine: &'a PropagationEngine<S>,
    entered: Option<Entered<S>>,
}

impl<S: AsyncSession> ExitGuard<'_, S> {
    fn entered(&self) -> TransactionResult<&Entered<S>> {
        self.entered
            .as_ref()
            .ok_or_else(|| TransactionError::integrity("frame already exited"))
    }

    fn disarm(&mut self) -> TransactionResult<Entered<S>> {
        self.entered
            .take()
            .ok_or_else(|| TransactionError::integrity("frame already exited"))
    }
}

impl<S: AsyncSession> Drop for ExitGuard<'_, S> {
    fn drop(&mut self) {
        let Some(entered) = self.entered.take() else {
            return;
        };
        let frame = entered.frame().clone();
        match self.engine.abandon(entered) {
            Finalize::Rollback(session) => spawn_cleanup(session),
            Finalize::RollbackTo(..) => self.engine.defer_savepoint_rollback(&frame),
            _ => {}
        }
    }
}

/// Cleans up a session opened for a frame that was never activated.
struct PendingSession<S: AsyncSession>(Option<Arc<S>>);

impl<S: AsyncSession> PendingSession<S> {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl<S: AsyncSession> Drop for PendingSession<S> {
    fn drop(&mut self) {
        if let Some(session) = self.0.take() {
            log::warn!("boundary dropped while opening a transaction");
            spawn_cleanup(session);
        }
    }
}

impl<P: AsyncSessionProvider> Clone for AsyncTransactionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: AsyncSessionProvider> std::fmt::Debug for AsyncTransactionManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTransactionManager")
            .field("engine", &self.inner.engine)
            .finish()
    }
}
