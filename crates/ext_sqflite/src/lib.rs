//! # `sqflite` - SQLite Statement and Batch Engine
//!
//! Executes SQL against SQLite databases on behalf of a method-call channel.
//! Arguments arrive as JSON-like values, are bound to cached prepared
//! statements, and results come back as column/row tables or row maps.
//!
//! ## Overview
//!
//! Each `openDatabase` call creates a session with its own connection and
//! statement cache. Sessions are addressed by integer id. A session opened
//! with `singleInstance` is shared: reopening the same path returns the live
//! session instead of a second connection.
//!
//! **Key Features:**
//! - **Typed binding**: null, bool, 32/64-bit integers, doubles, text, blobs and typed numeric arrays
//! - **Statement cache**: each distinct SQL text is compiled once per session
//! - **Batches**: ordered execute/insert/update/query lists with abort or continue-on-error
//! - **Result shaping**: `{columns, rows}` tables or one map per row
//!
//! ## Methods
//!
//! | Method | Arguments | Reply |
//! |--------|-----------|-------|
//! | `openDatabase` | `path, readOnly?, singleInstance?` | `{id, recoveredInTransaction?}` |
//! | `closeDatabase` | `id` | null |
//! | `deleteDatabase` | `path` | null |
//! | `getDatabasesPath` | none | path string |
//! | `options` | `queryAsMapList?, logLevel?` | null |
//! | `execute` | `id, sql, arguments?` | null |
//! | `query` | `id, sql, arguments?` | result set |
//! | `insert` | `id, sql, arguments?, noResult?` | row id or null |
//! | `update` | `id, sql, arguments?, noResult?` | change count or null |
//! | `batch` | `id, operations, continueOnError?, noResult?` | records or null |
//! | `debug` | `cmd` | session summary |
//!
//! ## Error Codes
//!
//! | Code | Kind | Meaning |
//! |------|------|---------|
//! | -1 | Generic | Lock poisoning and other internal failures |
//! | -2 | UnsupportedType | Argument that cannot be bound |
//! | -3 | DatabaseClosed | Unknown or closed session id |
//! | -4 | BadParam | Malformed call arguments |
//! | -5 | IoError | Filesystem failure |
//!
//! Engine failures keep SQLite's extended result code.
//!
//! ## Logging
//!
//! Events are emitted through `tracing` under `sqflite.*` names; install a
//! subscriber in the host to see them.

mod batch;
mod cache;
mod config;
mod error;
mod plugin;
mod registry;
mod session;
mod value;

pub use batch::{
    apply_operation, run_batch, BatchError, BatchMethod, BatchOperation, BatchOptions, BatchRecord,
    OperationOutput, UnknownMethod,
};
pub use cache::{CacheEntry, StatementCache};
pub use config::{OpenOptions, PluginOptions, SqfliteConfig};
pub use error::{DatabaseError, SqfliteErrorCode};
pub use plugin::{encode_result_set, MethodError, MethodResult, SqflitePlugin};
pub use registry::{database_exists, OpenOutcome, SessionHandle, SessionInfo, SessionRegistry};
pub use session::{DatabaseSession, DEFAULT_BUSY_TIMEOUT, MEMORY_DATABASE_PATH};
pub use value::{ResultSet, SqlValue};

/// Routes test logs through the test harness. `SQFLITE_LOG` sets the filter.
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("SQFLITE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
