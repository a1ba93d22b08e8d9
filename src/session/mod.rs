//! Session provider capability.
//!
//! The propagation engine never talks to a database driver directly. It
//! depends only on the small set of operations defined here, in a blocking
//! flavour ([`Session`]) and an async flavour ([`AsyncSession`]).
//!
//! # Usage
//!
//! ```ignore
//! use txscope::session::{Session, SessionProvider};
//!
//! let session = provider.open()?;
//! session.begin()?;
//! let sp = session.begin_nested()?;
//! session.rollback_to(sp)?;
//! session.release(sp)?;
//! session.commit()?;
//! session.close()?;
//! ```

mod error;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use error::{BoxError, SessionError, SessionResult};

/// Handle to a savepoint created by `begin_nested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SavepointToken(u64);

impl SavepointToken {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    /// SQL identifier for this savepoint.
    pub fn name(&self) -> String {
        format!("sp_{}", self.0)
    }
}

impl fmt::Display for SavepointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp_{}", self.0)
    }
}

/// The session operations the engine issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOp {
    Open,
    Begin,
    Commit,
    Rollback,
    Close,
    BeginNested,
    Release,
    RollbackTo,
}

impl fmt::Display for SessionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionOp::Open => "open",
            SessionOp::Begin => "begin",
            SessionOp::Commit => "commit",
            SessionOp::Rollback => "rollback",
            SessionOp::Close => "close",
            SessionOp::BeginNested => "begin_nested",
            SessionOp::Release => "release",
            SessionOp::RollbackTo => "rollback_to",
        };
        f.write_str(name)
    }
}

/// A blocking database session.
///
/// Sessions are shared between the frames that join them, so every
/// operation takes `&self`; implementations use interior mutability.
pub trait Session: Send + Sync + 'static {
    fn begin(&self) -> SessionResult<()>;

    fn commit(&self) -> SessionResult<()>;

    fn rollback(&self) -> SessionResult<()>;

    /// Return the session to its pool. Called exactly once, by the owning frame.
    fn close(&self) -> SessionResult<()>;

    /// Create a savepoint inside the active transaction.
    fn begin_nested(&self) -> SessionResult<SavepointToken>;

    /// Release a savepoint, keeping its changes in the enclosing transaction.
    fn release(&self, token: SavepointToken) -> SessionResult<()>;

    /// Discard every change made since the savepoint was created.
    fn rollback_to(&self, token: SavepointToken) -> SessionResult<()>;

    /// Whether a read-only transaction may be closed without a commit.
    fn supports_read_only(&self) -> bool {
        false
    }
}

/// Produces blocking sessions.
pub trait SessionProvider: Send + Sync {
    type Session: Session;

    fn open(&self) -> SessionResult<Self::Session>;
}

/// An async database session. Mirrors [`Session`] operation for operation.
#[async_trait]
pub trait AsyncSession: Send + Sync + 'static {
    async fn begin(&self) -> SessionResult<()>;

    async fn commit(&self) -> SessionResult<()>;

    async fn rollback(&self) -> SessionResult<()>;

    async fn close(&self) -> SessionResult<()>;

    async fn begin_nested(&self) -> SessionResult<SavepointToken>;

    async fn release(&self, token: SavepointToken) -> SessionResult<()>;

    async fn rollback_to(&self, token: SavepointToken) -> SessionResult<()>;

    fn supports_read_only(&self) -> bool {
        false
    }
}

/// Produces async sessions.
#[async_trait]
pub trait AsyncSessionProvider: Send + Sync {
    type Session: AsyncSession;

    async fn open(&self) -> SessionResult<Self::Session>;
}
