//! Execution-context identity.
//!
//! The frame registry is keyed by the identity of the logical call chain
//! that is running, not by a fixed thread. The host supplies that identity
//! through [`ContextIdentity`]; [`AmbientContext`] is the default and
//! resolves to:
//!
//! - the task-local id of the current async call chain, when one was
//!   established with [`scope_context`], so a chain keeps one identity
//!   while hopping between worker threads;
//! - otherwise a per-thread id.
//!
//! The async boundary runs every unit of work in a task scope of its own,
//! so units polled concurrently by one task (`join!`, `select!`) never
//! share a stack. Blocking boundaries called from inside an async unit
//! share that unit's stack.

use std::fmt;
use std::future::Future;

use ulid::Ulid;

/// Identity of one logical call chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(Ulid);

impl ContextId {
    /// A fresh identity, unique across all running chains.
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

/// Supplies the identity of the currently running call chain.
///
/// Implementations must return the same id for the whole duration of one
/// logical call chain, and different ids for chains that run concurrently.
pub trait ContextIdentity: Send + Sync {
    fn current_context_id(&self) -> ContextId;

    /// Whether ids honour task scopes opened by [`scope_context`]. When
    /// they do, each async unit of work runs in a context of its own that
    /// starts as a copy of its caller's stack. Otherwise the host must keep
    /// concurrently polled boundaries on distinct ids itself.
    fn follows_task_scope(&self) -> bool {
        false
    }
}

tokio::task_local! {
    static TASK_CONTEXT: ContextId;
}

thread_local! {
    static THREAD_CONTEXT: ContextId = ContextId::generate();
}

/// Task-local identity when inside [`scope_context`], thread identity otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmbientContext;

impl ContextIdentity for AmbientContext {
    fn current_context_id(&self) -> ContextId {
        task_context().unwrap_or_else(|| THREAD_CONTEXT.with(|id| *id))
    }

    fn follows_task_scope(&self) -> bool {
        true
    }
}

/// The id of the enclosing async call chain, if any.
pub fn task_context() -> Option<ContextId> {
    TASK_CONTEXT.try_with(|id| *id).ok()
}

/// Run `fut` as a new logical call chain with its own frame stack.
///
/// Use this when spawning work that must not see the transactions of the
/// spawning chain; tasks spawned with `tokio::spawn` never inherit the
/// task-local identity anyway.
pub async fn scope_context<F: Future>(fut: F) -> F::Output {
    within_context(ContextId::generate(), fut).await
}

/// Run `fut` with `ctx` as its task-local identity.
pub(crate) async fn within_context<F: Future>(ctx: ContextId, fut: F) -> F::Output {
    TASK_CONTEXT.scope(ctx, fut).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_identity_is_stable() {
        let a = AmbientContext.current_context_id();
        let b = AmbientContext.current_context_id();
        assert_eq!(a, b);
        assert!(task_context().is_none());
    }

    #[test]
    fn test_threads_have_distinct_identities() {
        let here = AmbientContext.current_context_id();
        let there = std::thread::spawn(|| AmbientContext.current_context_id())
            .join()
            .unwrap();
        assert_ne!(here, there);
    }

    #[tokio::test]
    async fn test_task_scope_overrides_thread() {
        let thread_id = AmbientContext.current_context_id();

        let (outer, again, inner) = scope_context(async {
            let outer = AmbientContext.current_context_id();
            tokio::task::yield_now().await;
            let again = AmbientContext.current_context_id();
            let inner = scope_context(async { AmbientContext.current_context_id() }).await;
            (outer, again, inner)
        })
        .await;

        assert_ne!(outer, thread_id);
        assert_eq!(outer, again);
        assert_ne!(outer, inner);
        assert!(AmbientContext.follows_task_scope());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_tasks_do_not_inherit_scope() {
        let parent = scope_context(async {
            let parent = AmbientContext.current_context_id();
            let child = tokio::spawn(async { task_context() }).await.unwrap();
            assert!(child.is_none());
            parent
        })
        .await;

        assert_eq!(parent.to_string().len(), 26);
    }
}
