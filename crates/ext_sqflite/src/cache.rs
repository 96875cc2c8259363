//! Per-session prepared statement cache keyed by exact SQL text.
//!
//! The compiled handles themselves live in the connection's statement cache
//! (rusqlite hands them out as [`CachedStatement`]s and takes them back,
//! reset and with cleared bindings, when they are dropped). This type owns
//! the bookkeeping on top: which SQL strings this session has compiled, how
//! many placeholders each has and how often it was reused. It never evicts.

use std::collections::HashMap;

use rusqlite::{CachedStatement, Connection};
use tracing::trace;

use crate::error::DatabaseError;

/// Capacity handed to the connection-level cache so that it never evicts.
pub const UNBOUNDED_CAPACITY: usize = usize::MAX;

/// Bookkeeping for one cached statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub parameter_count: usize,
    /// Times the statement was served from the cache after compilation.
    pub hits: u64,
}

#[derive(Debug, Default)]
pub struct StatementCache {
    entries: HashMap<String, CacheEntry>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `conn` keep every compiled statement until [`finalize_all`](Self::finalize_all).
    pub fn configure(conn: &Connection) {
        conn.set_prepared_statement_cache_capacity(UNBOUNDED_CAPACITY);
    }

    /// Returns the statement for `sql`, compiling it on first use.
    ///
    /// A compilation failure leaves the cache untouched.
    pub fn prepare<'conn>(
        &mut self,
        conn: &'conn Connection,
        sql: &str,
    ) -> Result<CachedStatement<'conn>, DatabaseError> {
        let stmt = conn.prepare_cached(sql)?;
        match self.entries.get_mut(sql) {
            Some(entry) => {
                entry.hits += 1;
                trace!(sql = %sql, hits = entry.hits, "sqflite.statement_cache_hit");
            }
            None => {
                trace!(sql = %sql, "sqflite.statement_prepare");
                self.entries.insert(
                    sql.to_string(),
                    CacheEntry {
                        parameter_count: stmt.parameter_count(),
                        hits: 0,
                    },
                );
            }
        }
        Ok(stmt)
    }

    /// Finalizes every cached statement. Must run before the connection closes.
    pub fn finalize_all(&mut self, conn: &Connection) {
        conn.flush_prepared_statement_cache();
        self.entries.clear();
    }

    pub fn get(&self, sql: &str) -> Option<&CacheEntry> {
        self.entries.get(sql)
    }

    pub fn contains(&self, sql: &str) -> bool {
        self.entries.contains_key(sql)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sql_keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
