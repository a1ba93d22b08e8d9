//! Transaction manager - the blocking unit-of-work boundary.
//!
//! The TransactionManager is the main entry point for blocking code.
//! It handles:
//! - Asking the propagation engine how to enter a unit of work
//! - Opening sessions, beginning transactions and creating savepoints
//! - Committing, rolling back and closing on exit
//! - Cleaning up when the unit of work panics

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::session::{SavepointToken, Session, SessionOp, SessionProvider};
use crate::transaction::context::{AmbientContext, ContextId, ContextIdentity};
use crate::transaction::engine::{
    EntryAction, EntryPlan, Finalize, FinalizeFailure, PropagationEngine, Resolved,
};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::frame::{FrameInfo, FrameKind};
use crate::transaction::options::TransactionOptions;
use crate::transaction::propagation::Propagation;
use crate::transaction::scope::TransactionScope;

/// Blocking transaction boundary.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
/// Each thread (or async call chain) sees only its own transactions.
pub struct TransactionManager<P: SessionProvider> {
    inner: Arc<TransactionManagerInner<P>>,
}

struct TransactionManagerInner<P: SessionProvider> {
    provider: P,
    engine: Arc<PropagationEngine<P::Session>>,
}

impl<P: SessionProvider> TransactionManager<P> {
    /// Create a manager keyed by the ambient thread or task identity.
    pub fn new(provider: P) -> Self {
        Self::with_identity(provider, Arc::new(AmbientContext))
    }

    /// Create a manager keyed by a host-supplied context identity.
    pub fn with_identity(provider: P, identity: Arc<dyn ContextIdentity>) -> Self {
        Self::with_engine(provider, Arc::new(PropagationEngine::new(identity)))
    }

    /// Create a manager that shares its frame stacks with other boundaries
    /// using the same engine, so blocking units of work can join
    /// transactions opened by an async boundary and vice versa.
    pub fn with_engine(provider: P, engine: Arc<PropagationEngine<P::Session>>) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner { provider, engine }),
        }
    }

    /// Get a reference to the session provider.
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

    /// Whether the calling context runs inside a transaction.
    pub fn has_active_transaction(&self) -> bool {
        self.inner.engine.has_active_transaction()
    }

    /// Session of the calling context's transaction.
    pub fn current_session(&self) -> Option<Arc<P::Session>> {
        self.inner.engine.current_session()
    }

    /// Frames of the calling context, outermost first.
    pub fn frames(&self) -> Vec<FrameInfo> {
        self.inner.engine.frames()
    }

    /// Contexts that currently hold frames.
    pub fn active_contexts(&self) -> Vec<ContextId> {
        self.inner.engine.registry().active_contexts()
    }

    /// Execute a function in a `REQUIRED` transaction.
    ///
    /// If the function returns Ok, the transaction is committed.
    /// If the function returns Err or panics, the transaction is rolled back.
    pub fn with_transaction<F, T>(&self, f: F) -> TransactionResult<T>
    where
        F: FnOnce(&TransactionScope<P::Session>) -> TransactionResult<T>,
    {
        self.execute(&TransactionOptions::default(), f)
    }

    /// Execute a function with a specific propagation mode.
    pub fn with_propagation<F, T>(&self, propagation: Propagation, f: F) -> TransactionResult<T>
    where
        F: FnOnce(&TransactionScope<P::Session>) -> TransactionResult<T>,
    {
        self.execute(&TransactionOptions::new(propagation), f)
    }

    /// Execute a function as a unit of work configured by `options`.
    pub fn execute<F, T>(&self, options: &TransactionOptions, f: F) -> TransactionResult<T>
    where
        F: FnOnce(&TransactionScope<P::Session>) -> TransactionResult<T>,
    {
        let engine = &self.inner.engine;

        let plan = engine.plan_entry(options)?;
        let resolved = self.resolve(&plan)?;
        let entered = engine.activate(plan, resolved)?;
        let scope = entered.scope();

        let result = match panic::catch_unwind(AssertUnwindSafe(|| f(&scope))) {
            Ok(result) => result,
            Err(payload) => {
                let frame = entered.frame().clone();
                if let Err(failure) = finalize_blocking(&engine.abandon(entered)) {
                    log::error!("cleanup of panicked frame {} failed: {:?}", frame.id(), failure);
                    if frame.kind() == FrameKind::Savepoint {
                        engine.doom_parent(&frame);
                    }
                }
                panic::resume_unwind(payload);
            }
        };

        let plan = engine.plan_exit(&entered, result.as_ref().err(), options);
        let finalized = finalize_blocking(&plan.finalize);
        engine.finish(entered, plan, result, finalized)
    }

    /// Perform the session I/O an entry plan asks for.
    fn resolve(&self, plan: &EntryPlan<P::Session>) -> TransactionResult<Resolved<P::Session>> {
        match plan.action() {
            EntryAction::Begin => {
                let session = self
                    .inner
                    .provider
                    .open()
                    .map_err(|source| TransactionError::Begin {
                        op: SessionOp::Open,
                        source,
                    })?;

                if let Err(source) = session.begin() {
                    if let Err(err) = session.close() {
                        log::warn!("closing session after failed begin: {}", err);
                    }
                    return Err(TransactionError::Begin {
                        op: SessionOp::Begin,
                        source,
                    });
                }
                Ok(Resolved::Opened(Arc::new(session)))
            }
            EntryAction::Savepoint(parent) => {
                let session = parent.session().ok_or_else(|| {
                    TransactionError::integrity("savepoint requested on a frame without session")
                })?;
                let deferred = self.inner.engine.take_deferred_savepoints(parent);
                if let Err(failure) = discard_savepoints(&**session, &deferred) {
                    self.inner.engine.doom_transaction(parent);
                    return Err(failure.into_error(None));
                }
                let token = session
                    .begin_nested()
                    .map_err(|source| TransactionError::Begin {
                        op: SessionOp::BeginNested,
                        source,
                    })?;
                Ok(Resolved::Savepoint(token))
            }
            EntryAction::Join(_) | EntryAction::Detached => Ok(Resolved::Nothing),
        }
    }
}

/// Roll back and release savepoints left behind by abandoned units.
fn discard_savepoints<S: Session>(
    session: &S,
    tokens: &[SavepointToken],
) -> Result<(), FinalizeFailure> {
    for token in tokens {
        log::debug!("discarding abandoned savepoint {}", token);
        session
            .rollback_to(*token)
            .map_err(|source| FinalizeFailure::rollback(SessionOp::RollbackTo, source))?;
        session
            .release(*token)
            .map_err(|source| FinalizeFailure::rollback(SessionOp::Release, source))?;
    }
    Ok(())
}

/// Run the finalization I/O of an exit plan on a blocking session.
pub(crate) fn finalize_blocking<S: Session>(finalize: &Finalize<S>) -> Result<(), FinalizeFailure> {
    match finalize {
        Finalize::Commit {
            session,
            read_only,
            discard,
        } => {
            let committed = discard_savepoints(&**session, discard).and_then(|()| {
                if *read_only && session.supports_read_only() {
                    log::debug!("read-only transaction, skipping commit");
                    Ok(())
                } else {
                    session
                        .commit()
                        .map_err(|source| FinalizeFailure::commit(SessionOp::Commit, source))
                }
            });
            if let Err(failure) = committed {
                if let Err(err) = session.rollback() {
                    log::warn!("rollback after failed commit: {}", err);
                }
                if let Err(err) = session.close() {
                    log::warn!("close after failed commit: {}", err);
                }
                return Err(failure);
            }
            session
                .close()
                .map_err(|source| FinalizeFailure::commit(SessionOp::Close, source))
        }
        Finalize::Rollback(session) => {
            let rolled_back = session.rollback();
            let closed = session.close();
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
            discard_savepoints(&**session, discard)?;
            session
                .release(*token)
                .map_err(|source| FinalizeFailure::commit(SessionOp::Release, source))
        }
        Finalize::RollbackTo(session, token) => {
            session
                .rollback_to(*token)
                .map_err(|source| FinalizeFailure::rollback(SessionOp::RollbackTo, source))?;
            session
                .release(*token)
                .map_err(|source| FinalizeFailure::rollback(SessionOp::Release, source))
        }
        Finalize::Nothing => Ok(()),
    }
}

impl<P: SessionProvider> Clone for TransactionManager<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: SessionProvider> std::fmt::Debug for TransactionManager<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("engine", &self.inner.engine)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use thiserror::Error;

    use crate::session::memory::{MemoryDatabase, MemorySession};
    use crate::session::SessionError;
    use crate::transaction::error::PropagationViolation;
    use crate::transaction::options::ErrorClassifier;

    #[derive(Debug, Error)]
    #[error("validation failed")]
    struct ValidationError;

    fn setup() -> (MemoryDatabase, TransactionManager<MemoryDatabase>) {
        let db = MemoryDatabase::new();
        let manager = TransactionManager::new(db.clone());
        (db, manager)
    }

    fn put(scope: &TransactionScope<MemorySession>, key: &str) -> TransactionResult<()> {
        scope.require_session()?.put(key, json!(true))?;
        Ok(())
    }

    fn boom<T>() -> TransactionResult<T> {
        Err(TransactionError::unit("boom"))
    }

    #[test]
    fn test_required_commits() {
        let (db, manager) = setup();

        let value = manager
            .with_transaction(|scope| {
                assert_eq!(scope.kind(), FrameKind::Owner);
                assert!(manager.has_active_transaction());
                put(scope, "a")?;
                Ok(42)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert!(db.contains("a"));
        assert_eq!(
            db.ops(),
            vec![SessionOp::Open, SessionOp::Begin, SessionOp::Commit, SessionOp::Close]
        );
        assert_eq!(db.open_sessions(), 0);
        assert_eq!(manager.depth(), 0);
    }

    #[test]
    fn test_required_rolls_back_on_error() {
        let (db, manager) = setup();

        let result: TransactionResult<()> = manager.with_transaction(|scope| {
            put(scope, "a")?;
            boom()
        });

        assert!(matches!(result, Err(TransactionError::Unit(_))));
        assert!(db.is_empty());
        assert_eq!(
            db.ops(),
            vec![SessionOp::Open, SessionOp::Begin, SessionOp::Rollback, SessionOp::Close]
        );
    }

    #[test]
    fn test_required_joins_outer_session() {
        let (db, manager) = setup();

        manager
            .with_transaction(|outer| {
                let outer_session = outer.session().unwrap().clone();
                manager.with_transaction(|inner| {
                    assert_eq!(inner.kind(), FrameKind::Joined);
                    assert_eq!(inner.depth(), 2);
                    assert!(Arc::ptr_eq(inner.session().unwrap(), &outer_session));
                    put(inner, "inner")
                })?;
                put(outer, "outer")
            })
            .unwrap();

        assert!(db.contains("inner") && db.contains("outer"));
        assert_eq!(db.ops().iter().filter(|op| **op == SessionOp::Open).count(), 1);
    }

    #[test]
    fn test_inner_required_failure_rolls_back_outer() {
        let (db, manager) = setup();

        let result = manager.with_transaction(|outer| {
            put(outer, "outer")?;
            let inner: TransactionResult<()> = manager.with_transaction(|inner| {
                put(inner, "inner")?;
                boom()
            });
            assert!(inner.is_err());
            assert!(outer.is_rollback_only());
            Ok(())
        });

        assert!(matches!(result, Err(TransactionError::UnexpectedRollback)));
        assert!(db.is_empty());
        assert!(db.ops().contains(&SessionOp::Rollback));
        assert!(!db.ops().contains(&SessionOp::Commit));
    }

    #[test]
    fn test_requires_new_is_independent() {
        let (db, manager) = setup();

        manager
            .with_transaction(|outer| {
                put(outer, "outer")?;
                let outer_session = outer.session().unwrap().clone();

                let inner: TransactionResult<()> =
                    manager.with_propagation(Propagation::RequiresNew, |inner| {
                        assert_eq!(inner.kind(), FrameKind::Owner);
                        assert!(!Arc::ptr_eq(inner.session().unwrap(), &outer_session));
                        assert_eq!(manager.depth(), 1);
                        put(inner, "inner")?;
                        boom()
                    });
                assert!(inner.is_err());

                let current = manager.current_session().unwrap();
                assert!(Arc::ptr_eq(&current, &outer_session));
                assert!(!outer.is_rollback_only());
                Ok(())
            })
            .unwrap();

        assert!(db.contains("outer"));
        assert!(!db.contains("inner"));
    }

    #[test]
    fn test_requires_new_survives_outer_rollback() {
        let (db, manager) = setup();

        let result: TransactionResult<()> = manager.with_transaction(|outer| {
            put(outer, "outer")?;
            manager.with_propagation(Propagation::RequiresNew, |inner| put(inner, "audit"))?;
            boom()
        });

        assert!(result.is_err());
        assert!(db.contains("audit"));
        assert!(!db.contains("outer"));
    }

    #[test]
    fn test_nested_rolls_back_to_savepoint_only() {
        let (db, manager) = setup();

        manager
            .with_transaction(|outer| {
                put(outer, "before")?;
                let inner: TransactionResult<()> =
                    manager.with_propagation(Propagation::Nested, |inner| {
                        assert_eq!(inner.kind(), FrameKind::Savepoint);
                        put(inner, "nested")?;
                        boom()
                    });
                assert!(inner.is_err());
                put(outer, "after")
            })
            .unwrap();

        assert!(db.contains("before"));
        assert!(db.contains("after"));
        assert!(!db.contains("nested"));
        let ops = db.ops();
        assert!(ops.contains(&SessionOp::RollbackTo));
        assert!(ops.contains(&SessionOp::Release));
        assert!(ops.contains(&SessionOp::Commit));
    }

    #[test]
    fn test_nested_success_releases_savepoint() {
        let (db, manager) = setup();

        manager
            .with_transaction(|_| {
                manager.with_propagation(Propagation::Nested, |inner| put(inner, "nested"))
            })
            .unwrap();

        assert!(db.contains("nested"));
        assert_eq!(
            db.ops(),
            vec![
                SessionOp::Open,
                SessionOp::Begin,
                SessionOp::BeginNested,
                SessionOp::Release,
                SessionOp::Commit,
                SessionOp::Close
            ]
        );
    }

    #[test]
    fn test_nested_without_outer_behaves_as_required() {
        let (db, manager) = setup();

        manager
            .with_propagation(Propagation::Nested, |scope| {
                assert_eq!(scope.kind(), FrameKind::Owner);
                put(scope, "a")
            })
            .unwrap();

        assert!(db.contains("a"));
        assert_eq!(
            db.ops(),
            vec![SessionOp::Open, SessionOp::Begin, SessionOp::Commit, SessionOp::Close]
        );
    }

    #[test]
    fn test_mandatory_without_transaction() {
        let (db, manager) = setup();
        let mut ran = false;

        let result = manager.with_propagation(Propagation::Mandatory, |_| {
            ran = true;
            Ok(())
        });

        assert!(matches!(
            result,
            Err(TransactionError::Propagation(PropagationViolation::NoActiveTransaction))
        ));
        assert!(!ran);
        assert!(db.journal().is_empty());
        assert_eq!(manager.depth(), 0);
    }

    #[test]
    fn test_mandatory_joins() {
        let (db, manager) = setup();

        manager
            .with_transaction(|_| {
                manager.with_propagation(Propagation::Mandatory, |inner| {
                    assert_eq!(inner.kind(), FrameKind::Joined);
                    put(inner, "a")
                })
            })
            .unwrap();

        assert!(db.contains("a"));
    }

    #[test]
    fn test_never() {
        let (db, manager) = setup();

        manager
            .with_propagation(Propagation::Never, |scope| {
                assert!(scope.session().is_none());
                assert!(manager.current_session().is_none());
                assert_eq!(manager.depth(), 1);
                Ok(())
            })
            .unwrap();
        assert!(db.journal().is_empty());

        let result = manager.with_transaction(|_| {
            let inner = manager.with_propagation(Propagation::Never, |_| Ok(()));
            assert!(matches!(
                inner,
                Err(TransactionError::Propagation(PropagationViolation::TransactionNotAllowed))
            ));
            Ok(())
        });
        result.unwrap();
    }

    #[test]
    fn test_supports() {
        let (db, manager) = setup();

        manager
            .with_propagation(Propagation::Supports, |scope| {
                assert_eq!(scope.kind(), FrameKind::NoTransaction);
                assert!(matches!(
                    put(scope, "a"),
                    Err(TransactionError::Propagation(_))
                ));
                Ok(())
            })
            .unwrap();
        assert!(db.journal().is_empty());

        manager
            .with_transaction(|_| {
                manager.with_propagation(Propagation::Supports, |inner| {
                    assert_eq!(inner.kind(), FrameKind::Joined);
                    put(inner, "b")
                })
            })
            .unwrap();
        assert!(db.contains("b"));
    }

    #[test]
    fn test_not_supported_suspends() {
        let (_db, manager) = setup();

        manager
            .with_transaction(|_| {
                manager.with_propagation(Propagation::NotSupported, |scope| {
                    assert!(scope.session().is_none());
                    assert!(!manager.has_active_transaction());

                    // A REQUIRED unit inside starts its own transaction.
                    manager.with_transaction(|inner| {
                        assert_eq!(inner.kind(), FrameKind::Owner);
                        Ok(())
                    })
                })?;
                assert!(manager.has_active_transaction());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_commit_failure_is_reported() {
        let (db, manager) = setup();
        db.fail_next(SessionOp::Commit);

        let result = manager.with_transaction(|scope| put(scope, "a"));

        let err = result.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Commit {
                op: SessionOp::Commit,
                ..
            }
        ));
        assert!(err.original().is_none());
        assert!(!db.contains("a"));
        assert_eq!(db.open_sessions(), 0);
        assert_eq!(manager.depth(), 0);
    }

    #[test]
    fn test_rollback_failure_chains_original() {
        let (db, manager) = setup();
        db.fail_next(SessionOp::Rollback);

        let result: TransactionResult<()> = manager.with_transaction(|_| {
            Err(TransactionError::unit(ValidationError))
        });

        let err = result.unwrap_err();
        assert!(matches!(err, TransactionError::Rollback { .. }));
        assert!(err.find_unit_error::<ValidationError>().is_some());
        assert_eq!(db.open_sessions(), 0);
    }

    #[test]
    fn test_release_failure_dooms_outer() {
        let (db, manager) = setup();

        let result = manager.with_transaction(|outer| {
            put(outer, "a")?;
            db.fail_next(SessionOp::Release);
            let inner = manager.with_propagation(Propagation::Nested, |inner| put(inner, "b"));
            assert!(matches!(
                inner,
                Err(TransactionError::Commit {
                    op: SessionOp::Release,
                    ..
                })
            ));
            Ok(())
        });

        assert!(matches!(result, Err(TransactionError::UnexpectedRollback)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_release_failure_after_savepoint_rollback() {
        let (db, manager) = setup();

        let result = manager.with_transaction(|outer| {
            put(outer, "a")?;
            db.fail_next(SessionOp::Release);
            let inner: TransactionResult<()> =
                manager.with_propagation(Propagation::Nested, |inner| {
                    put(inner, "b")?;
                    boom()
                });
            let err = inner.unwrap_err();
            assert!(matches!(
                err,
                TransactionError::Rollback {
                    op: SessionOp::Release,
                    ..
                }
            ));
            assert!(matches!(err.original(), Some(TransactionError::Unit(_))));
            Ok(())
        });

        assert!(matches!(result, Err(TransactionError::UnexpectedRollback)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_no_rollback_for_still_commits() {
        let (db, manager) = setup();
        let options = TransactionOptions::default()
            .no_rollback_for(ErrorClassifier::of::<ValidationError>());

        let result: TransactionResult<()> = manager.execute(&options, |scope| {
            put(scope, "a")?;
            Err(TransactionError::unit(ValidationError))
        });

        assert!(result.unwrap_err().find_unit_error::<ValidationError>().is_some());
        assert!(db.contains("a"));
    }

    #[test]
    fn test_set_rollback_only_in_owner() {
        let (db, manager) = setup();

        let value = manager
            .with_transaction(|scope| {
                put(scope, "a")?;
                scope.set_rollback_only();
                Ok("done")
            })
            .unwrap();

        assert_eq!(value, "done");
        assert!(db.is_empty());
    }

    #[test]
    fn test_owner_rollback_only_survives_successful_join() {
        let (db, manager) = setup();

        let value = manager
            .with_transaction(|outer| {
                put(outer, "a")?;
                outer.set_rollback_only();
                manager.with_transaction(|inner| {
                    assert!(inner.is_rollback_only());
                    put(inner, "b")
                })?;
                Ok("done")
            })
            .unwrap();

        assert_eq!(value, "done");
        assert!(db.is_empty());
        assert!(db.ops().contains(&SessionOp::Rollback));
    }

    #[test]
    fn test_triple_join_dooms_owner() {
        let (db, manager) = setup();

        let result = manager.with_transaction(|outer| {
            put(outer, "a")?;
            manager.with_transaction(|middle| {
                manager.with_transaction(|inner| {
                    inner.set_rollback_only();
                    Ok(())
                })?;
                assert!(middle.is_rollback_only());
                Ok(())
            })?;
            assert!(outer.is_rollback_only());
            Ok(())
        });

        assert!(matches!(result, Err(TransactionError::UnexpectedRollback)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_read_only_fast_path() {
        let (db, manager) = setup();
        db.set_read_only_fast_path(true);
        let options = TransactionOptions::default().read_only(true);

        manager
            .execute(&options, |scope| {
                assert!(scope.is_read_only());
                Ok(())
            })
            .unwrap();

        assert_eq!(
            db.ops(),
            vec![SessionOp::Open, SessionOp::Begin, SessionOp::Close]
        );
    }

    #[test]
    fn test_read_only_without_fast_path_commits() {
        let (db, manager) = setup();
        let options = TransactionOptions::default().read_only(true);

        manager.execute(&options, |_| Ok(())).unwrap();
        assert!(db.ops().contains(&SessionOp::Commit));
    }

    #[test]
    fn test_begin_failure_pushes_nothing() {
        let (db, manager) = setup();
        db.fail_next(SessionOp::Begin);

        let result = manager.with_transaction(|_| Ok(()));

        assert!(matches!(
            result,
            Err(TransactionError::Begin {
                op: SessionOp::Begin,
                ..
            })
        ));
        assert_eq!(manager.depth(), 0);
        assert_eq!(db.open_sessions(), 0);
    }

    #[test]
    fn test_open_failure_is_retryable_when_pool_says_so() {
        struct Exhausted;

        impl SessionProvider for Exhausted {
            type Session = MemorySession;

            fn open(&self) -> crate::session::SessionResult<MemorySession> {
                Err(SessionError::Unavailable("pool exhausted".to_string()))
            }
        }

        let manager = TransactionManager::new(Exhausted);
        let err = manager.with_transaction(|_| Ok(())).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_panic_cleans_up() {
        let (db, manager) = setup();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            manager.with_transaction(|scope| -> TransactionResult<()> {
                put(scope, "a")?;
                panic!("unit of work panicked");
            })
        }));

        assert!(outcome.is_err());
        assert_eq!(manager.depth(), 0);
        assert_eq!(db.open_sessions(), 0);
        assert!(db.is_empty());
        assert!(db.ops().contains(&SessionOp::Rollback));
    }

    #[test]
    fn test_concurrent_threads_are_isolated() {
        let (db, manager) = setup();

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager.with_propagation(Propagation::RequiresNew, |scope| {
                        assert_eq!(manager.depth(), 1);
                        put(scope, &format!("key{}", i))?;
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        if i == 1 {
                            return boom();
                        }
                        Ok(())
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(db.contains("key0"));
        assert!(!db.contains("key1"));
        assert!(manager.active_contexts().is_empty());
    }

    #[test]
    fn test_frames_snapshot() {
        let (_db, manager) = setup();

        manager
            .with_transaction(|_| {
                manager.with_propagation(Propagation::Nested, |_| {
                    let frames = manager.frames();
                    assert_eq!(frames.len(), 2);
                    assert_eq!(frames[0].kind, FrameKind::Owner);
                    assert_eq!(frames[1].kind, FrameKind::Savepoint);
                    assert!(frames[1].savepoint.is_some());

                    let json = serde_json::to_value(&frames).unwrap();
                    assert_eq!(json[1]["propagation"], "NESTED");
                    Ok(())
                })
            })
            .unwrap();
    }
}
