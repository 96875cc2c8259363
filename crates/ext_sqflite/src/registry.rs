//! Table of open sessions, keyed by id and (for single instances) by path.
//!
//! The registry is an explicit object owned by the plugin. Its tables sit
//! behind one mutex; each session sits behind its own so that a long
//! statement on one database does not hold up lookups for another.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::SqfliteConfig;
use crate::error::DatabaseError;
use crate::session::{is_in_memory_path, DatabaseSession};

/// Shared handle to an open session.
pub type SessionHandle = Arc<Mutex<DatabaseSession>>;

/// Result of [`SessionRegistry::open_or_reuse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    pub id: i64,
    /// An existing single-instance session was returned.
    pub reused_existing: bool,
}

/// Summary of one open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub path: String,
    pub single_instance: bool,
    pub read_only: bool,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<i64, SessionHandle>,
    ids_by_path: HashMap<String, i64>,
    next_id: i64,
}

pub struct SessionRegistry {
    config: SqfliteConfig,
    state: Mutex<RegistryState>,
}

fn lock_session(handle: &SessionHandle) -> Result<MutexGuard<'_, DatabaseSession>, DatabaseError> {
    handle
        .lock()
        .map_err(|_| DatabaseError::generic("session lock poisoned"))
}

impl SessionRegistry {
    pub fn new(config: SqfliteConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn config(&self) -> &SqfliteConfig {
        &self.config
    }

    fn state(&self) -> Result<MutexGuard<'_, RegistryState>, DatabaseError> {
        self.state
            .lock()
            .map_err(|_| DatabaseError::generic("session registry lock poisoned"))
    }

    /// Opens a session, or returns the live single-instance session for `path`.
    ///
    /// In-memory paths are never single-instance, whatever the caller asks.
    pub fn open_or_reuse(
        &self,
        path: &str,
        read_only: bool,
        single_instance: bool,
    ) -> Result<OpenOutcome, DatabaseError> {
        let single_instance = single_instance && !is_in_memory_path(path);
        let mut state = self.state()?;

        if single_instance {
            if let Some(&id) = state.ids_by_path.get(path) {
                if state.sessions.contains_key(&id) {
                    debug!(id = id, path = %path, "sqflite.open_reuse");
                    return Ok(OpenOutcome {
                        id,
                        reused_existing: true,
                    });
                }
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        let session = DatabaseSession::open(
            id,
            path,
            read_only,
            single_instance,
            self.config.busy_timeout(),
        )?;

        debug!(id = id, path = %path, single_instance = single_instance, "sqflite.open");
        if single_instance {
            state.ids_by_path.insert(path.to_string(), id);
        }
        state.sessions.insert(id, Arc::new(Mutex::new(session)));

        Ok(OpenOutcome {
            id,
            reused_existing: false,
        })
    }

    /// Looks up an open session.
    pub fn get(&self, id: i64) -> Result<SessionHandle, DatabaseError> {
        self.state()?
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| DatabaseError::closed(id))
    }

    /// Runs `f` with exclusive access to session `id`.
    ///
    /// The registry lock is released before `f` runs.
    pub fn with_session<T, E>(
        &self,
        id: i64,
        f: impl FnOnce(&mut DatabaseSession) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<DatabaseError>,
    {
        let handle = self.get(id)?;
        let mut session = lock_session(&handle)?;
        f(&mut *session)
    }

    /// Closes session `id` and forgets it.
    ///
    /// Both tables are updated before the session lock is taken, so a close
    /// waiting on a busy session does not hold up other lookups.
    pub fn close(&self, id: i64) -> Result<(), DatabaseError> {
        let handle = {
            let mut state = self.state()?;
            let handle = state
                .sessions
                .remove(&id)
                .ok_or_else(|| DatabaseError::closed(id))?;
            state.ids_by_path.retain(|_, mapped| *mapped != id);
            handle
        };

        let mut session = lock_session(&handle)?;
        debug!(id = id, path = %session.path(), "sqflite.close");
        session.close()
    }

    /// Closes the single-instance session open on `path`, if any, then
    /// removes the database file and its journal companions.
    pub fn delete_database(&self, path: &str) -> Result<(), DatabaseError> {
        let existing = {
            let mut state = self.state()?;
            state
                .ids_by_path
                .remove(path)
                .and_then(|id| state.sessions.remove(&id).map(|handle| (id, handle)))
        };
        if let Some((id, handle)) = existing {
            debug!(id = id, path = %path, "sqflite.delete_close");
            let mut session = lock_session(&handle)?;
            if let Err(err) = session.close() {
                warn!(id = id, error = %err, "sqflite.delete_close_failed");
            }
        }

        if is_in_memory_path(path) {
            return Ok(());
        }

        debug!(path = %path, "sqflite.delete");
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path, "sqflite.delete_missing");
            }
            Err(err) => return Err(err.into()),
        }
        for suffix in ["-wal", "-shm", "-journal"] {
            let companion = format!("{}{}", path, suffix);
            match std::fs::remove_file(&companion) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(path = %companion, error = %err, "sqflite.delete_companion_failed");
                }
            }
        }
        Ok(())
    }

    /// Directory applications should place their databases in.
    pub fn databases_path(&self) -> Result<PathBuf, DatabaseError> {
        let path = self.config.databases_path();
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Id of the live single-instance session for `path`.
    pub fn id_for_path(&self, path: &str) -> Option<i64> {
        self.state().ok()?.ids_by_path.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.state().map(|state| state.sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every open session, ordered by id.
    pub fn describe(&self) -> Result<BTreeMap<i64, SessionInfo>, DatabaseError> {
        let handles: Vec<(i64, SessionHandle)> = self
            .state()?
            .sessions
            .iter()
            .map(|(id, handle)| (*id, handle.clone()))
            .collect();

        let mut out = BTreeMap::new();
        for (id, handle) in handles {
            let session = lock_session(&handle)?;
            out.insert(
                id,
                SessionInfo {
                    path: session.path().to_string(),
                    single_instance: session.is_single_instance(),
                    read_only: session.is_read_only(),
                },
            );
        }
        Ok(out)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SqfliteConfig::default())
    }
}

/// Whether `path` names an existing on-disk database file.
pub fn database_exists(path: &str) -> bool {
    !is_in_memory_path(path) && Path::new(path).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::SqlValue;

    fn temp_db(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_string_lossy().to_string()
    }

    #[test]
    fn test_single_instance_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db(&dir, "a.db");
        let registry = SessionRegistry::default();

        let first = registry.open_or_reuse(&path, false, true).unwrap();
        let second = registry.open_or_reuse(&path, false, true).unwrap();
        assert!(!first.reused_existing);
        assert!(second.reused_existing);
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.id_for_path(&path), Some(first.id));
    }

    #[test]
    fn test_memory_is_never_single_instance() {
        let registry = SessionRegistry::default();
        let first = registry.open_or_reuse(":memory:", false, true).unwrap();
        let second = registry.open_or_reuse(":memory:", false, true).unwrap();
        assert_ne!(first.id, second.id);
        assert!(!second.reused_existing);
        assert_eq!(registry.id_for_path(":memory:"), None);

        let empty = registry.open_or_reuse("", false, true).unwrap();
        assert!(!empty.reused_existing);
        assert!(!registry.describe().unwrap()[&empty.id].single_instance);
    }

    #[test]
    fn test_ids_increase() {
        let registry = SessionRegistry::default();
        let a = registry.open_or_reuse("", false, false).unwrap().id;
        let b = registry.open_or_reuse("", false, false).unwrap().id;
        registry.close(a).unwrap();
        let c = registry.open_or_reuse("", false, false).unwrap().id;
        assert_eq!(a, 1);
        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn test_close_removes_both_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db(&dir, "b.db");
        let registry = SessionRegistry::default();
        let id = registry.open_or_reuse(&path, false, true).unwrap().id;

        registry.close(id).unwrap();
        assert!(registry.is_empty());
        assert_eq!(registry.id_for_path(&path), None);
        assert!(matches!(registry.close(id), Err(DatabaseError::Closed { id: closed }) if closed == id));

        let reopened = registry.open_or_reuse(&path, false, true).unwrap();
        assert!(!reopened.reused_existing);
        assert_ne!(reopened.id, id);
    }

    #[test]
    fn test_closed_session_is_not_found_and_file_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db(&dir, "c.db");
        let registry = SessionRegistry::default();
        let id = registry.open_or_reuse(&path, false, false).unwrap().id;
        registry
            .with_session(id, |s| {
                s.execute("CREATE TABLE t (v INTEGER)", &[])?;
                s.execute("BEGIN", &[])?;
                s.execute("INSERT INTO t VALUES (?)", &[SqlValue::Int64(1)])?;
                s.execute("COMMIT", &[])
            })
            .unwrap();
        registry.close(id).unwrap();

        let err = registry
            .with_session(id, |s| s.execute("SELECT 1", &[]))
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Closed { .. }));

        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("BEGIN EXCLUSIVE; INSERT INTO t VALUES (2); COMMIT;")
            .unwrap();
    }

    #[test]
    fn test_failed_open_registers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db(&dir, "missing.db");
        let registry = SessionRegistry::default();
        assert!(registry.open_or_reuse(&path, true, true).is_err());
        assert!(registry.is_empty());
        assert_eq!(registry.id_for_path(&path), None);
    }

    #[test]
    fn test_delete_database_closes_single_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db(&dir, "d.db");
        let registry = SessionRegistry::default();
        let id = registry.open_or_reuse(&path, false, true).unwrap().id;
        registry
            .with_session(id, |s| s.execute("CREATE TABLE t (v INTEGER)", &[]))
            .unwrap();
        assert!(database_exists(&path));

        registry.delete_database(&path).unwrap();
        assert!(!database_exists(&path));
        assert!(registry.is_empty());
        assert!(matches!(registry.get(id), Err(DatabaseError::Closed { .. })));

        registry.delete_database(&path).unwrap();
    }

    #[test]
    fn test_delete_database_tolerates_stuck_companion() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db(&dir, "e.db");
        std::fs::write(&path, b"").unwrap();
        let wal = format!("{}-wal", path);
        std::fs::create_dir(&wal).unwrap();
        std::fs::write(std::path::Path::new(&wal).join("keep"), b"x").unwrap();

        let registry = SessionRegistry::default();
        registry.delete_database(&path).unwrap();
        assert!(!database_exists(&path));
        assert!(std::path::Path::new(&wal).is_dir());
    }

    #[test]
    fn test_close_waiting_on_busy_session_leaves_registry_usable() {
        let dir = tempfile::tempdir().unwrap();
        let path = temp_db(&dir, "f.db");
        let registry = SessionRegistry::default();
        let busy = registry.open_or_reuse(&path, false, true).unwrap().id;
        let other = registry.open_or_reuse("", false, false).unwrap().id;

        let handle = registry.get(busy).unwrap();
        let guard = handle.lock().unwrap();
        std::thread::scope(|scope| {
            let closer = scope.spawn(|| registry.close(busy));
            while registry.get(busy).is_ok() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }

            let path_entry = registry.id_for_path(&path);
            let other_found = registry.get(other).is_ok();
            let live = registry.len();
            let fresh = registry.open_or_reuse("", false, false);

            drop(guard);
            assert!(closer.join().unwrap().is_ok());
            assert_eq!(path_entry, None);
            assert!(other_found);
            assert_eq!(live, 1);
            assert!(fresh.unwrap().id > other);
        });
        assert!(!handle.lock().unwrap().is_open());
    }

    #[test]
    fn test_databases_path_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SessionRegistry::new(SqfliteConfig {
            databases_path: Some(dir.path().join("nested").join("databases")),
            busy_timeout_ms: None,
        });
        let path = registry.databases_path().unwrap();
        assert!(path.is_dir());
    }
}
