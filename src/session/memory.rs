//! In-memory session provider.
//!
//! `MemoryDatabase` is a tiny key/value store with real transaction
//! semantics: each session buffers its writes, savepoints snapshot the
//! buffer, and only `commit` publishes to the shared committed state.
//! Every attempted session operation is journaled, and single operations
//! can be made to fail, which makes it suitable for exercising the
//! propagation engine without a database server.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::{
    AsyncSession, AsyncSessionProvider, SavepointToken, Session, SessionError, SessionOp,
    SessionProvider, SessionResult,
};

/// Pending writes of one session. `None` marks a deletion.
type WriteSet = BTreeMap<String, Option<Value>>;

/// One attempted session operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub session: u64,
    pub op: SessionOp,
}

/// Shared in-memory database. Cloning yields another handle to the same store.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<MemoryDatabaseInner>,
}

#[derive(Default)]
struct MemoryDatabaseInner {
    committed: RwLock<BTreeMap<String, Value>>,
    journal: Mutex<Vec<JournalEntry>>,
    failures: Mutex<Vec<SessionOp>>,
    read_only_fast_path: AtomicBool,
    latency_ms: AtomicU64,
    next_session: AtomicU64,
    open_sessions: AtomicUsize,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a committed value.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.committed.read().get(key).cloned()
    }

    /// Whether a committed value exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.committed.read().contains_key(key)
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.inner.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All attempted operations, in order.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.inner.journal.lock().clone()
    }

    /// Attempted operations without session ids.
    pub fn ops(&self) -> Vec<SessionOp> {
        self.inner.journal.lock().iter().map(|e| e.op).collect()
    }

    /// Attempted operations of a single session.
    pub fn ops_for(&self, session: u64) -> Vec<SessionOp> {
        self.inner
            .journal
            .lock()
            .iter()
            .filter(|e| e.session == session)
            .map(|e| e.op)
            .collect()
    }

    pub fn clear_journal(&self) {
        self.inner.journal.lock().clear();
    }

    /// Make the next attempt of `op` fail with a backend error.
    pub fn fail_next(&self, op: SessionOp) {
        self.inner.failures.lock().push(op);
    }

    /// Let read-only transactions skip their commit.
    pub fn set_read_only_fast_path(&self, enabled: bool) {
        self.inner
            .read_only_fast_path
            .store(enabled, Ordering::SeqCst);
    }

    /// Delay every async session operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sessions opened and not yet closed.
    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// Open a session directly, outside of any transaction boundary.
    pub fn session(&self) -> SessionResult<MemorySession> {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.record(id, SessionOp::Open)?;
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            id,
            db: self.inner.clone(),
            state: Mutex::new(SessionState::default()),
        })
    }

    fn latency(&self) -> Duration {
        Duration::from_millis(self.inner.latency_ms.load(Ordering::SeqCst))
    }
}

impl MemoryDatabaseInner {
    fn record(&self, session: u64, op: SessionOp) -> SessionResult<()> {
        self.journal.lock().push(JournalEntry { session, op });

        let mut failures = self.failures.lock();
        if let Some(pos) = failures.iter().position(|f| *f == op) {
            failures.remove(pos);
            return Err(SessionError::backend(format!("injected {} failure", op)));
        }
        Ok(())
    }
}

#[derive(Default)]
struct SessionState {
    active: bool,
    closed: bool,
    pending: WriteSet,
    savepoints: Vec<(SavepointToken, WriteSet)>,
    next_savepoint: u64,
}

/// A session on a [`MemoryDatabase`].
pub struct MemorySession {
    id: u64,
    db: Arc<MemoryDatabaseInner>,
    state: Mutex<SessionState>,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a transaction is open on this session.
    pub fn in_transaction(&self) -> bool {
        self.state.lock().active
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Buffer a write in the current transaction.
    pub fn put(&self, key: impl Into<String>, value: Value) -> SessionResult<()> {
        let mut state = self.writable()?;
        state.pending.insert(key.into(), Some(value));
        Ok(())
    }

    /// Buffer a deletion in the current transaction.
    pub fn delete(&self, key: impl Into<String>) -> SessionResult<()> {
        let mut state = self.writable()?;
        state.pending.insert(key.into(), None);
        Ok(())
    }

    /// Read through pending writes to committed state.
    pub fn get(&self, key: &str) -> SessionResult<Option<Value>> {
        let state = self.state.lock();
        if state.closed {
            return Err(SessionError::Closed);
        }
        if let Some(pending) = state.pending.get(key) {
            return Ok(pending.clone());
        }
        Ok(self.db.committed.read().get(key).cloned())
    }

    fn writable(&self) -> SessionResult<parking_lot::MutexGuard<'_, SessionState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(SessionError::Closed);
        }
        if !state.active {
            return Err(SessionError::backend("no active transaction"));
        }
        Ok(state)
    }

    fn open_state(&self) -> SessionResult<parking_lot::MutexGuard<'_, SessionState>> {
        let state = self.state.lock();
        if state.closed {
            return Err(SessionError::Closed);
        }
        Ok(state)
    }
}

impl Session for MemorySession {
    fn begin(&self) -> SessionResult<()> {
        self.db.record(self.id, SessionOp::Begin)?;
        let mut state = self.open_state()?;
        if state.active {
            return Err(SessionError::backend("transaction already begun"));
        }
        state.active = true;
        Ok(())
    }

    fn commit(&self) -> SessionResult<()> {
        self.db.record(self.id, SessionOp::Commit)?;
        let mut state = self.writable()?;
        let pending = std::mem::take(&mut state.pending);
        state.savepoints.clear();
        state.active = false;

        let mut committed = self.db.committed.write();
        for (key, value) in pending {
            match value {
                Some(value) => {
                    committed.insert(key, value);
                }
                None => {
                    committed.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn rollback(&self) -> SessionResult<()> {
        self.db.record(self.id, SessionOp::Rollback)?;
        let mut state = self.open_state()?;
        state.pending.clear();
        state.savepoints.clear();
        state.active = false;
        Ok(())
    }

    fn close(&self) -> SessionResult<()> {
        let mut state = self.open_state()?;
        state.pending.clear();
        state.savepoints.clear();
        state.active = false;
        state.closed = true;
        self.db.open_sessions.fetch_sub(1, Ordering::SeqCst);
        drop(state);
        self.db.record(self.id, SessionOp::Close)
    }

    fn begin_nested(&self) -> SessionResult<SavepointToken> {
        self.db.record(self.id, SessionOp::BeginNested)?;
        let mut state = self.writable()?;
        state.next_savepoint += 1;
        let token = SavepointToken::new(state.next_savepoint);
        let snapshot = state.pending.clone();
        state.savepoints.push((token, snapshot));
        Ok(token)
    }

    fn release(&self, token: SavepointToken) -> SessionResult<()> {
        self.db.record(self.id, SessionOp::Release)?;
        let mut state = self.writable()?;
        let pos = state
            .savepoints
            .iter()
            .position(|(t, _)| *t == token)
            .ok_or(SessionError::UnknownSavepoint(token))?;
        state.savepoints.truncate(pos);
        Ok(())
    }

    fn rollback_to(&self, token: SavepointToken) -> SessionResult<()> {
        self.db.record(self.id, SessionOp::RollbackTo)?;
        let mut state = self.writable()?;
        let pos = state
            .savepoints
            .iter()
            .position(|(t, _)| *t == token)
            .ok_or(SessionError::UnknownSavepoint(token))?;
        let snapshot = state.savepoints[pos].1.clone();
        state.savepoints.truncate(pos + 1);
        state.pending = snapshot;
        Ok(())
    }

    fn supports_read_only(&self) -> bool {
        self.db.read_only_fast_path.load(Ordering::SeqCst)
    }
}

impl SessionProvider for MemoryDatabase {
    type Session = MemorySession;

    fn open(&self) -> SessionResult<MemorySession> {
        self.session()
    }
}

impl MemorySession {
    async fn pause(&self) {
        let latency = Duration::from_millis(self.db.latency_ms.load(Ordering::SeqCst));
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl AsyncSession for MemorySession {
    async fn begin(&self) -> SessionResult<()> {
        self.pause().await;
        Session::begin(self)
    }

    async fn commit(&self) -> SessionResult<()> {
        self.pause().await;
        Session::commit(self)
    }

    async fn rollback(&self) -> SessionResult<()> {
        self.pause().await;
        Session::rollback(self)
    }

    async fn close(&self) -> SessionResult<()> {
        self.pause().await;
        Session::close(self)
    }

    async fn begin_nested(&self) -> SessionResult<SavepointToken> {
        self.pause().await;
        Session::begin_nested(self)
    }

    async fn release(&self, token: SavepointToken) -> SessionResult<()> {
        self.pause().await;
        Session::release(self, token)
    }

    async fn rollback_to(&self, token: SavepointToken) -> SessionResult<()> {
        self.pause().await;
        Session::rollback_to(self, token)
    }

    fn supports_read_only(&self) -> bool {
        Session::supports_read_only(self)
    }
}

#[async_trait]
impl AsyncSessionProvider for MemoryDatabase {
    type Session = MemorySession;

    async fn open(&self) -> SessionResult<MemorySession> {
        let latency = self.latency();
        if latency.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(latency).await;
        }
        self.session()
    }
}
