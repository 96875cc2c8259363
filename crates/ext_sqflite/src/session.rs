//! One open database connection with its statement cache.

use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use crate::cache::StatementCache;
use crate::error::DatabaseError;
use crate::value::{bind_parameters, decode_row, ResultSet, SqlValue};

/// Path value naming an in-memory database.
pub const MEMORY_DATABASE_PATH: &str = ":memory:";

/// Default time a connection waits on a lock held by another connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(2500);

const INSERT_CHANGES_SQL: &str = "SELECT changes(), last_insert_rowid();";
const UPDATE_CHANGES_SQL: &str = "SELECT changes();";

/// `""` and `":memory:"` both denote an in-memory database.
pub fn is_in_memory_path(path: &str) -> bool {
    path.is_empty() || path == MEMORY_DATABASE_PATH
}

/// An open database and the statements compiled against it.
///
/// Operations take `&mut self`: a session is used from one thread at a time.
#[derive(Debug)]
pub struct DatabaseSession {
    id: i64,
    path: String,
    single_instance: bool,
    read_only: bool,
    connection: Option<Connection>,
    cache: StatementCache,
}

impl DatabaseSession {
    /// Opens (or, unless `read_only`, creates) the database at `path`.
    pub fn open(
        id: i64,
        path: &str,
        read_only: bool,
        single_instance: bool,
        busy_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
        };
        let target = if is_in_memory_path(path) {
            MEMORY_DATABASE_PATH
        } else {
            path
        };

        debug!(id = id, path = %path, read_only = read_only, "sqflite.session_open");
        let connection = Connection::open_with_flags(target, flags)?;
        connection.busy_timeout(busy_timeout)?;
        StatementCache::configure(&connection);

        Ok(Self {
            id,
            path: path.to_string(),
            single_instance,
            read_only,
            connection: Some(connection),
            cache: StatementCache::new(),
        })
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_single_instance(&self) -> bool {
        self.single_instance
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.cache
    }

    fn parts(&mut self) -> Result<(&Connection, &mut StatementCache), DatabaseError> {
        let id = self.id;
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| DatabaseError::closed(id))?;
        Ok((connection, &mut self.cache))
    }

    /// Runs `sql` to completion, discarding any rows it produces.
    pub fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<(), DatabaseError> {
        let (connection, cache) = self.parts()?;
        let mut stmt = cache.prepare(connection, sql)?;
        bind_parameters(&mut stmt, params)?;
        let mut rows = stmt.raw_query();
        while rows.next()?.is_some() {}
        Ok(())
    }

    /// Runs `sql` and collects every row.
    pub fn query(&mut self, sql: &str, params: &[SqlValue]) -> Result<ResultSet, DatabaseError> {
        let (connection, cache) = self.parts()?;
        let mut stmt = cache.prepare(connection, sql)?;
        bind_parameters(&mut stmt, params)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let column_count = columns.len();

        let mut out = Vec::new();
        let mut rows = stmt.raw_query();
        while let Some(row) = rows.next()? {
            out.push(decode_row(row, column_count)?);
        }
        Ok(ResultSet { columns, rows: out })
    }

    /// Executes an insert and reports the new row id.
    ///
    /// Returns `None` when `no_result` is set or when the statement changed
    /// no row (e.g. `INSERT OR IGNORE` hitting a conflict).
    pub fn insert(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        no_result: bool,
    ) -> Result<Option<i64>, DatabaseError> {
        self.execute(sql, params)?;
        if no_result {
            debug!(id = self.id, "ignoring insert result, 'noResult' is turned on");
            return Ok(None);
        }

        let changes = self.query(INSERT_CHANGES_SQL, &[])?;
        match changes.rows.first().map(Vec::as_slice) {
            Some([SqlValue::Int64(0), ..]) => Ok(None),
            Some([SqlValue::Int64(_), SqlValue::Int64(last_id)]) => Ok(Some(*last_id)),
            _ => Err(DatabaseError::generic("unexpected result from changes()")),
        }
    }

    /// Executes an update/delete and reports the number of changed rows.
    ///
    /// With `no_result` the follow-up `changes()` query is skipped.
    pub fn update(
        &mut self,
        sql: &str,
        params: &[SqlValue],
        no_result: bool,
    ) -> Result<Option<i64>, DatabaseError> {
        self.execute(sql, params)?;
        if no_result {
            debug!(id = self.id, "ignoring update result, 'noResult' is turned on");
            return Ok(None);
        }

        let changes = self.query(UPDATE_CHANGES_SQL, &[])?;
        match changes.rows.first().map(Vec::as_slice) {
            Some([SqlValue::Int64(count)]) => Ok(Some(*count)),
            _ => Err(DatabaseError::generic("unexpected result from changes()")),
        }
    }

    /// Finalizes every cached statement, then closes the connection.
    pub fn close(&mut self) -> Result<(), DatabaseError> {
        let connection = self
            .connection
            .take()
            .ok_or_else(|| DatabaseError::closed(self.id))?;
        self.cache.finalize_all(&connection);
        debug!(id = self.id, path = %self.path, "sqflite.session_close");
        connection.close().map_err(|(_, err)| err.into())
    }
}

impl Drop for DatabaseSession {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.cache.finalize_all(&connection);
            if let Err((_, err)) = connection.close() {
                warn!(id = self.id, error = %err, "sqflite.session_drop_close_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_session() -> DatabaseSession {
        let mut session =
            DatabaseSession::open(1, MEMORY_DATABASE_PATH, false, false, DEFAULT_BUSY_TIMEOUT).unwrap();
        session
            .execute(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT UNIQUE, data BLOB)",
                &[],
            )
            .unwrap();
        session
    }

    #[test]
    fn test_in_memory_paths() {
        assert!(is_in_memory_path(""));
        assert!(is_in_memory_path(":memory:"));
        assert!(!is_in_memory_path("/tmp/a.db"));
    }

    #[test]
    fn test_query_columns_and_rows() {
        let mut session = memory_session();
        session
            .execute("INSERT INTO items (name) VALUES (?)", &["a".into()])
            .unwrap();
        let set = session.query("SELECT id, name, data FROM items", &[]).unwrap();
        assert_eq!(set.columns, vec!["id", "name", "data"]);
        assert_eq!(
            set.rows,
            vec![vec![SqlValue::Int64(1), SqlValue::Text("a".into()), SqlValue::Null]]
        );
    }

    #[test]
    fn test_reused_statement_has_no_stale_bindings() {
        let mut session = memory_session();
        let first = session
            .query("SELECT ?, ?", &[SqlValue::Int64(1), SqlValue::Int64(2)])
            .unwrap();
        assert_eq!(first.rows[0], vec![SqlValue::Int64(1), SqlValue::Int64(2)]);

        let second = session.query("SELECT ?, ?", &[SqlValue::Int64(9)]).unwrap();
        assert_eq!(second.rows[0], vec![SqlValue::Int64(9), SqlValue::Null]);
        assert_eq!(session.statement_cache().get("SELECT ?, ?").unwrap().hits, 1);
    }

    #[test]
    fn test_execute_discards_rows() {
        let mut session = memory_session();
        session.execute("SELECT 1 UNION SELECT 2", &[]).unwrap();
    }

    #[test]
    fn test_round_trip_text_and_blob() {
        let mut session = memory_session();
        let text = "emoji \u{1F600} and nul-free text";
        let blob: Vec<u8> = (0..=255).collect();
        session
            .execute(
                "INSERT INTO items (name, data) VALUES (?, ?)",
                &[text.into(), SqlValue::Blob(blob.clone())],
            )
            .unwrap();
        let set = session.query("SELECT name, data FROM items", &[]).unwrap();
        assert_eq!(set.rows[0], vec![SqlValue::Text(text.into()), SqlValue::Blob(blob)]);
    }

    #[test]
    fn test_insert_reports_row_id() {
        let mut session = memory_session();
        let id = session
            .insert("INSERT INTO items (name) VALUES (?)", &["a".into()], false)
            .unwrap();
        assert_eq!(id, Some(1));
        let id = session
            .insert("INSERT INTO items (name) VALUES (?)", &["b".into()], false)
            .unwrap();
        assert_eq!(id, Some(2));
    }

    #[test]
    fn test_ignored_insert_reports_nothing() {
        let mut session = memory_session();
        session
            .insert("INSERT INTO items (name) VALUES (?)", &["a".into()], false)
            .unwrap();
        let id = session
            .insert("INSERT OR IGNORE INTO items (name) VALUES (?)", &["a".into()], false)
            .unwrap();
        assert_eq!(id, None);
    }

    #[test]
    fn test_update_counts_and_no_result() {
        let mut session = memory_session();
        for name in ["a", "b", "c"] {
            session
                .insert("INSERT INTO items (name) VALUES (?)", &[name.into()], true)
                .unwrap();
        }
        let count = session
            .update("UPDATE items SET data = x'00' WHERE name != ?", &["a".into()], false)
            .unwrap();
        assert_eq!(count, Some(2));

        let count = session.update("DELETE FROM items", &[], true).unwrap();
        assert_eq!(count, None);
        let set = session.query("SELECT count(*) FROM items", &[]).unwrap();
        assert_eq!(set.rows[0], vec![SqlValue::Int64(0)]);
    }

    #[test]
    fn test_close_then_use_fails() {
        let mut session = memory_session();
        session.query("SELECT 1", &[]).unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert!(session.statement_cache().is_empty());
        assert!(matches!(
            session.execute("SELECT 1", &[]),
            Err(DatabaseError::Closed { id: 1 })
        ));
        assert!(matches!(session.close(), Err(DatabaseError::Closed { .. })));
    }

    #[test]
    fn test_read_only_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let err = DatabaseSession::open(1, path.to_str().unwrap(), true, false, DEFAULT_BUSY_TIMEOUT)
            .unwrap_err();
        assert!(err.is_engine_error());
        assert!(!path.exists());
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.db");
        let path = path.to_str().unwrap();
        {
            let mut writer = DatabaseSession::open(1, path, false, false, DEFAULT_BUSY_TIMEOUT).unwrap();
            writer.execute("CREATE TABLE t (v INTEGER)", &[]).unwrap();
            writer.close().unwrap();
        }
        let mut reader = DatabaseSession::open(2, path, true, false, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert!(reader.query("SELECT * FROM t", &[]).unwrap().is_empty());
        let err = reader.execute("INSERT INTO t VALUES (1)", &[]).unwrap_err();
        assert_eq!(err.code() & 0xff, rusqlite::ffi::SQLITE_READONLY);
    }
}
