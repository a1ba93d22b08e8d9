//! txscope - declarative transaction propagation.
//!
//! Units of work declare how they relate to an already active transaction
//! (join it, suspend it, nest a savepoint in it, require it, forbid it) and
//! the boundary takes care of beginning, committing, rolling back and
//! closing sessions. Works for blocking code and for async code running on
//! tokio, including call chains that hop between worker threads.
//!
//! # Example
//!
//! ```
//! use txscope::session::memory::MemoryDatabase;
//! use txscope::transaction::{Propagation, TransactionError, TransactionManager};
//!
//! let db = MemoryDatabase::new();
//! let manager = TransactionManager::new(db.clone());
//!
//! let result: Result<(), TransactionError> = manager.with_transaction(|scope| {
//!     scope.require_session()?.put("kept", true.into())?;
//!
//!     // The savepoint rolls back alone; the outer transaction carries on.
//!     let _ = manager.with_propagation(Propagation::Nested, |nested| {
//!         nested.require_session()?.put("discarded", true.into())?;
//!         Err::<(), _>(TransactionError::unit("validation failed"))
//!     });
//!     Ok(())
//! });
//!
//! assert!(result.is_ok());
//! assert!(db.contains("kept") && !db.contains("discarded"));
//! ```

pub mod session;
pub mod transaction;
