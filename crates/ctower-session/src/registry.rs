//! Durable record of open tabs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ctower_db::{sessions, SessionRecord};
use rusqlite::Connection;
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::error::EngineError;

/// Where session records are kept. Calls may block.
pub trait RegistryStore: Send + Sync + 'static {
    /// Replace all records. Returns how many were written.
    fn save(&self, records: &[SessionRecord]) -> Result<usize, EngineError>;

    fn restore(&self) -> Result<Vec<SessionRecord>, EngineError>;
}

/// Registry backed by the `terminal_sessions` table.
pub struct SqliteRegistry {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistry {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }
}

impl RegistryStore for SqliteRegistry {
    fn save(&self, records: &[SessionRecord]) -> Result<usize, EngineError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions::replace_all(&mut conn, records)?)
    }

    fn restore(&self) -> Result<Vec<SessionRecord>, EngineError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions::list_all(&conn)?)
    }
}

/// Async front of a [`RegistryStore`] with a dirty signal for the autosaver.
pub(crate) struct Registry {
    store: Arc<dyn RegistryStore>,
    dirty: Arc<Notify>,
    restored: AtomicBool,
    /// Held for a whole save, snapshot included, so writes land in snapshot order.
    writing: AsyncMutex<()>,
}

impl Registry {
    pub(crate) fn new(store: Arc<dyn RegistryStore>) -> Self {
        Self {
            store,
            dirty: Arc::new(Notify::new()),
            restored: AtomicBool::new(false),
            writing: AsyncMutex::new(()),
        }
    }

    pub(crate) fn dirty_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.dirty)
    }

    /// Note that tab state changed and a save is due.
    pub(crate) fn mark_dirty(&self) {
        self.dirty.notify_one();
    }

    pub(crate) fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    /// Write the records `snapshot` returns. The snapshot is taken after any
    /// earlier save has finished, so an older tab set never overwrites a newer one.
    pub(crate) async fn save(
        &self,
        snapshot: impl FnOnce() -> Vec<SessionRecord>,
    ) -> Result<usize, EngineError> {
        let _writing = self.writing.lock().await;
        let records = snapshot();
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&records))
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))?
    }

    /// Read the saved records. Only the first call succeeds.
    pub(crate) async fn restore_once(&self) -> Result<Vec<SessionRecord>, EngineError> {
        if self.restored.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyRestored);
        }
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.restore())
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))?
    }
}
