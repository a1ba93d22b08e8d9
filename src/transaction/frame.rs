//! Transaction frames.
//!
//! A frame is the bookkeeping record of one entered unit of work. Frames
//! are immutable except for their rollback-only marker and the savepoints
//! left behind by cancelled nested units, and are shared through `Arc`
//! between the registry, the boundary that created them and the frames
//! nested inside them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::session::SavepointToken;
use crate::transaction::propagation::Propagation;

/// Unique frame identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(Ulid);

impl FrameId {
    fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

/// How a frame relates to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Opened the session and will commit or roll back and close it.
    Owner,
    /// Participates in the parent's transaction.
    Joined,
    /// Runs inside a savepoint of the parent's transaction.
    Savepoint,
    /// Runs without a transaction.
    NoTransaction,
}

/// One entry of a context's frame stack.
pub struct Frame<S> {
    id: FrameId,
    propagation: Propagation,
    session: Option<Arc<S>>,
    owns_session: bool,
    savepoint: Option<SavepointToken>,
    parent: Option<Arc<Frame<S>>>,
    read_only: bool,
    /// Doom carried over from the parent when this frame was created.
    inherited_rollback_only: bool,
    /// Doom raised inside this frame's own scope.
    rollback_only: AtomicBool,
    marked_by_participant: AtomicBool,
    /// Savepoints of abandoned nested units still to be rolled back.
    deferred_savepoints: Mutex<Vec<SavepointToken>>,
    started_at: DateTime<Utc>,
}

impl<S> Frame<S> {
    fn build(
        propagation: Propagation,
        session: Option<Arc<S>>,
        owns_session: bool,
        savepoint: Option<SavepointToken>,
        parent: Option<Arc<Frame<S>>>,
        read_only: bool,
    ) -> Self {
        // Participants start out doomed if the transaction they join already is.
        let inherited = parent.as_ref().is_some_and(|p| p.is_rollback_only());
        Self {
            id: FrameId::generate(),
            propagation,
            session,
            owns_session,
            savepoint,
            parent,
            read_only,
            inherited_rollback_only: inherited,
            rollback_only: AtomicBool::new(false),
            marked_by_participant: AtomicBool::new(false),
            deferred_savepoints: Mutex::new(Vec::new()),
            started_at: Utc::now(),
        }
    }

    /// A frame that opened `session` and is responsible for closing it.
    pub(crate) fn owner(propagation: Propagation, session: Arc<S>, read_only: bool) -> Self {
        Self::build(propagation, Some(session), true, None, None, read_only)
    }

    /// A frame participating in `parent`'s transaction.
    pub(crate) fn joined(propagation: Propagation, parent: &Arc<Frame<S>>, read_only: bool) -> Self {
        Self::build(
            propagation,
            parent.session.clone(),
            false,
            None,
            Some(parent.clone()),
            read_only,
        )
    }

    /// A frame running inside savepoint `token` of `parent`'s transaction.
    pub(crate) fn nested(
        propagation: Propagation,
        parent: &Arc<Frame<S>>,
        token: SavepointToken,
        read_only: bool,
    ) -> Self {
        Self::build(
            propagation,
            parent.session.clone(),
            false,
            Some(token),
            Some(parent.clone()),
            read_only,
        )
    }

    /// A frame with no session.
    pub(crate) fn detached(propagation: Propagation, read_only: bool) -> Self {
        Self::build(propagation, None, false, None, None, read_only)
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn session(&self) -> Option<&Arc<S>> {
        self.session.as_ref()
    }

    pub fn owns_session(&self) -> bool {
        self.owns_session
    }

    pub fn savepoint(&self) -> Option<SavepointToken> {
        self.savepoint
    }

    pub fn parent(&self) -> Option<&Arc<Frame<S>>> {
        self.parent.as_ref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether a transaction is active in this frame.
    pub fn is_transactional(&self) -> bool {
        self.session.is_some()
    }

    pub fn kind(&self) -> FrameKind {
        if self.owns_session {
            FrameKind::Owner
        } else if self.savepoint.is_some() {
            FrameKind::Savepoint
        } else if self.session.is_some() {
            FrameKind::Joined
        } else {
            FrameKind::NoTransaction
        }
    }

    /// Whether this frame's transaction scope will roll back, either
    /// because it was doomed when the frame was entered or since.
    pub fn is_rollback_only(&self) -> bool {
        self.inherited_rollback_only || self.raised_rollback_only()
    }

    /// Whether rollback-only was raised in this frame's own scope, by its
    /// unit of work or by a participant exiting inside it.
    pub fn raised_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Doom this frame's transaction scope. Only the code running in the
    /// frame (or a participant finishing inside it) calls this.
    pub(crate) fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    /// Doom this frame on behalf of a participant that exited with a rollback.
    pub(crate) fn mark_rollback_only_by_participant(&self) {
        self.marked_by_participant.store(true, Ordering::SeqCst);
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    /// Whether the rollback-only marker came from a participant.
    pub fn marked_by_participant(&self) -> bool {
        self.marked_by_participant.load(Ordering::SeqCst)
    }

    /// The frame that finalizes this frame's session: the nearest frame,
    /// starting here, that is not a plain join.
    pub(crate) fn finalizing(self: &Arc<Self>) -> &Arc<Self> {
        let mut current = self;
        while current.kind() == FrameKind::Joined {
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    /// Remember a savepoint whose unit was abandoned before it could roll
    /// back to it.
    pub(crate) fn defer_savepoint_rollback(&self, token: SavepointToken) {
        self.deferred_savepoints.lock().push(token);
    }

    /// Deferred savepoints, most recent first.
    pub(crate) fn take_deferred_savepoints(&self) -> Vec<SavepointToken> {
        let mut tokens = std::mem::take(&mut *self.deferred_savepoints.lock());
        tokens.reverse();
        tokens
    }

    /// Serializable snapshot.
    pub fn info(&self) -> FrameInfo {
        FrameInfo {
            id: self.id.to_string(),
            propagation: self.propagation,
            kind: self.kind(),
            owns_session: self.owns_session,
            rollback_only: self.is_rollback_only(),
            read_only: self.read_only,
            savepoint: self.savepoint,
            started_at: self.started_at,
        }
    }
}

impl<S> fmt::Debug for Frame<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id)
            .field("propagation", &self.propagation)
            .field("kind", &self.kind())
            .field("rollback_only", &self.is_rollback_only())
            .finish()
    }
}

/// Snapshot of a frame for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub id: String,
    pub propagation: Propagation,
    pub kind: FrameKind,
    pub owns_session: bool,
    pub rollback_only: bool,
    pub read_only: bool,
    pub savepoint: Option<SavepointToken>,
    pub started_at: DateTime<Utc>,
}
