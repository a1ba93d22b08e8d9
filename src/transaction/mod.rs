//! Declarative transaction propagation.
//!
//! A unit of work runs inside a boundary configured with a [`Propagation`]
//! mode. The boundary consults the frames already active in the calling
//! context and decides whether to begin a transaction, join the current
//! one, create a savepoint, suspend it, or refuse to run.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────┐   ┌─────────────────────────────────┐
//! │     TransactionManager     │   │     AsyncTransactionManager     │
//! │ (blocking boundary, panic  │   │ (async boundary, cleanup when   │
//! │  cleanup)                  │   │  the future is dropped)         │
//! └─────────────┬──────────────┘   └────────────────┬────────────────┘
//!               └────────────────┬──────────────────┘
//!                                ▼
//!                   ┌─────────────────────────┐
//!                   │    PropagationEngine    │
//!                   │ (entry / exit decisions)│
//!                   └────────────┬────────────┘
//!                                ▼
//!                   ┌─────────────────────────┐
//!                   │   TransactionRegistry   │
//!                   │ (frame stack per        │
//!                   │  execution context)     │
//!                   └─────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use txscope::session::memory::MemoryDatabase;
//! use txscope::transaction::{Propagation, TransactionManager};
//!
//! let db = MemoryDatabase::new();
//! let manager = TransactionManager::new(db.clone());
//!
//! manager
//!     .with_transaction(|outer| {
//!         outer.require_session()?.put("order", 1.into())?;
//!
//!         // Commits on its own, whatever happens to the outer transaction.
//!         manager.with_propagation(Propagation::RequiresNew, |audit| {
//!             audit.require_session()?.put("audit", "order placed".into())?;
//!             Ok(())
//!         })
//!     })
//!     .unwrap();
//!
//! assert!(db.contains("order") && db.contains("audit"));
//! ```

mod async_manager;
mod context;
mod engine;
mod error;
mod frame;
mod manager;
mod options;
mod propagation;
mod registry;
mod scope;

pub use async_manager::AsyncTransactionManager;
pub use context::{scope_context, task_context, AmbientContext, ContextId, ContextIdentity};
pub use engine::PropagationEngine;
pub use error::{PropagationViolation, TransactionError, TransactionResult};
pub use frame::{Frame, FrameId, FrameInfo, FrameKind};
pub use manager::TransactionManager;
pub use options::{ErrorClassifier, TransactionDefaults, TransactionOptions};
pub use propagation::Propagation;
pub use registry::TransactionRegistry;
pub use scope::TransactionScope;
