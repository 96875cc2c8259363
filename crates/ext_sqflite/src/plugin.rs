//! Method-call dispatcher: decodes channel arguments, routes them to the
//! registry/session/batch layers and encodes the replies.

use std::sync::Mutex;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::batch::{run_batch, BatchError, BatchOperation, BatchOptions, BatchRecord, OperationOutput};
use crate::config::{OpenOptions, PluginOptions, SqfliteConfig};
use crate::error::DatabaseError;
use crate::registry::SessionRegistry;
use crate::session::DatabaseSession;
use crate::value::{ResultSet, SqlValue};

// =============================================================================
// Channel names
// =============================================================================

pub const METHOD_GET_DATABASES_PATH: &str = "getDatabasesPath";
pub const METHOD_DEBUG: &str = "debug";
pub const METHOD_OPTIONS: &str = "options";
pub const METHOD_OPEN_DATABASE: &str = "openDatabase";
pub const METHOD_CLOSE_DATABASE: &str = "closeDatabase";
pub const METHOD_INSERT: &str = "insert";
pub const METHOD_EXECUTE: &str = "execute";
pub const METHOD_QUERY: &str = "query";
pub const METHOD_UPDATE: &str = "update";
pub const METHOD_BATCH: &str = "batch";
pub const METHOD_DELETE_DATABASE: &str = "deleteDatabase";

pub const PARAM_ID: &str = "id";
pub const PARAM_PATH: &str = "path";
pub const PARAM_SINGLE_INSTANCE: &str = "singleInstance";
pub const PARAM_READ_ONLY: &str = "readOnly";
pub const PARAM_LOG_LEVEL: &str = "logLevel";
pub const PARAM_RECOVERED_IN_TRANSACTION: &str = "recoveredInTransaction";
pub const PARAM_SQL: &str = "sql";
pub const PARAM_SQL_ARGUMENTS: &str = "arguments";
pub const PARAM_COLUMNS: &str = "columns";
pub const PARAM_ROWS: &str = "rows";
pub const PARAM_RESULT: &str = "result";
pub const PARAM_ERROR: &str = "error";
pub const PARAM_ERROR_CODE: &str = "code";
pub const PARAM_ERROR_MESSAGE: &str = "message";
pub const PARAM_ERROR_DATA: &str = "data";

pub const CMD_GET: &str = "get";

pub const ERROR_DATABASE: &str = "sqlite_error";
pub const ERROR_BAD_PARAM: &str = "bad_param";
pub const ERROR_OPEN_FAILED: &str = "open_failed";
pub const ERROR_STORAGE: &str = "storage_error";

// =============================================================================
// Replies
// =============================================================================

/// Error reply sent back over the channel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MethodError {
    #[error("{code}: {message}")]
    Failure {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("method not implemented")]
    NotImplemented,
}

impl MethodError {
    fn database(message: impl Into<String>, details: Option<Value>) -> Self {
        Self::Failure {
            code: ERROR_DATABASE.to_string(),
            message: message.into(),
            details,
        }
    }

    /// Statement-level failure with the offending SQL attached.
    fn statement(err: &DatabaseError, sql: &str, arguments: &[Value]) -> Self {
        Self::database(
            err.to_string(),
            Some(json!({ PARAM_SQL: sql, PARAM_SQL_ARGUMENTS: arguments })),
        )
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Failure { code, .. } => Some(code),
            Self::NotImplemented => None,
        }
    }
}

impl From<DatabaseError> for MethodError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::BadParam { message, .. } => Self::Failure {
                code: ERROR_BAD_PARAM.to_string(),
                message,
                details: None,
            },
            other => Self::database(other.to_string(), None),
        }
    }
}

pub type MethodResult = Result<Value, MethodError>;

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdArgs {
    id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqlArgs {
    id: i64,
    #[serde(default)]
    sql: String,
    #[serde(default)]
    arguments: Option<Vec<Value>>,
    #[serde(default)]
    no_result: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathArgs {
    #[serde(default)]
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugArgs {
    #[serde(default)]
    cmd: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchArgs {
    id: i64,
    #[serde(default)]
    operations: Vec<BatchOperation>,
    #[serde(default)]
    continue_on_error: Option<bool>,
    #[serde(default)]
    no_result: Option<bool>,
}

fn decode_args<'a, T: Deserialize<'a>>(arguments: &'a Value) -> Result<T, MethodError> {
    T::deserialize(arguments).map_err(|err| DatabaseError::from(err).into())
}

// =============================================================================
// Encoding
// =============================================================================

/// Shapes a result set for the channel.
///
/// Column mode: `{columns, rows}`, or `{}` when there are no rows.
/// Map-list mode: one map per row; the first of several same-named columns wins.
pub fn encode_result_set(set: &ResultSet, as_map_list: bool) -> Value {
    if as_map_list {
        let rows = set
            .rows
            .iter()
            .map(|row| {
                let mut map = Map::new();
                for (name, cell) in set.columns.iter().zip(row) {
                    map.entry(name.clone()).or_insert_with(|| cell.to_json());
                }
                Value::Object(map)
            })
            .collect();
        return Value::Array(rows);
    }

    if set.is_empty() {
        return Value::Object(Map::new());
    }
    json!({
        PARAM_COLUMNS: set.columns,
        PARAM_ROWS: set
            .rows
            .iter()
            .map(|row| row.iter().map(SqlValue::to_json).collect::<Vec<_>>())
            .collect::<Vec<_>>(),
    })
}

fn encode_output(output: &OperationOutput, as_map_list: bool) -> Value {
    match output {
        OperationOutput::Executed => Value::Null,
        OperationOutput::Inserted(id) | OperationOutput::Updated(id) => {
            id.map(Value::from).unwrap_or(Value::Null)
        }
        OperationOutput::Queried(set) => encode_result_set(set, as_map_list),
    }
}

fn encode_record(record: &BatchRecord, as_map_list: bool) -> Value {
    match record {
        BatchRecord::Success(output) => json!({ PARAM_RESULT: encode_output(output, as_map_list) }),
        BatchRecord::Failure { error, sql, arguments } => json!({
            PARAM_ERROR: {
                PARAM_ERROR_CODE: ERROR_DATABASE,
                PARAM_ERROR_MESSAGE: error.to_string(),
                PARAM_ERROR_DATA: {
                    PARAM_SQL: sql,
                    PARAM_SQL_ARGUMENTS: arguments,
                },
            }
        }),
    }
}

// =============================================================================
// Plugin
// =============================================================================

/// Dispatcher state: the session registry plus the process-wide options.
pub struct SqflitePlugin {
    registry: SessionRegistry,
    options: Mutex<PluginOptions>,
}

impl SqflitePlugin {
    pub fn new(config: SqfliteConfig) -> Self {
        Self {
            registry: SessionRegistry::new(config),
            options: Mutex::new(PluginOptions::default()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    fn options(&self) -> Result<PluginOptions, DatabaseError> {
        self.options
            .lock()
            .map(|opts| opts.clone())
            .map_err(|_| DatabaseError::generic("options lock poisoned"))
    }

    fn query_as_map_list(&self) -> Result<bool, DatabaseError> {
        Ok(self.options()?.query_as_map_list.unwrap_or(false))
    }

    /// Routes one method call. `arguments` is the call's argument map.
    pub fn handle_method_call(&self, method: &str, arguments: &Value) -> MethodResult {
        debug!(method = %method, "sqflite.method_call");
        match method {
            METHOD_OPEN_DATABASE => self.on_open_database(arguments),
            METHOD_CLOSE_DATABASE => self.on_close_database(arguments),
            METHOD_DELETE_DATABASE => self.on_delete_database(arguments),
            METHOD_GET_DATABASES_PATH => self.on_get_databases_path(),
            METHOD_OPTIONS => self.on_options(arguments),
            METHOD_EXECUTE => self.on_execute(arguments),
            METHOD_QUERY => self.on_query(arguments),
            METHOD_INSERT => self.on_insert(arguments),
            METHOD_UPDATE => self.on_update(arguments),
            METHOD_BATCH => self.on_batch(arguments),
            METHOD_DEBUG => self.on_debug(arguments),
            _ => Err(MethodError::NotImplemented),
        }
    }

    fn on_open_database(&self, arguments: &Value) -> MethodResult {
        let opts: OpenOptions = decode_args(arguments)?;
        let read_only = opts.read_only.unwrap_or(false);
        let single_instance = opts.single_instance.unwrap_or(false);

        let outcome = self
            .registry
            .open_or_reuse(&opts.path, read_only, single_instance)
            .map_err(|err| {
                warn!(path = %opts.path, error = %err, "sqflite.open_failed");
                MethodError::database(format!("{} {}", ERROR_OPEN_FAILED, opts.path), None)
            })?;

        let mut response = Map::new();
        response.insert(PARAM_ID.to_string(), Value::from(outcome.id));
        if outcome.reused_existing {
            response.insert(PARAM_RECOVERED_IN_TRANSACTION.to_string(), Value::Bool(true));
        }
        Ok(Value::Object(response))
    }

    fn on_close_database(&self, arguments: &Value) -> MethodResult {
        let args: IdArgs = decode_args(arguments)?;
        self.registry.close(args.id)?;
        Ok(Value::Null)
    }

    fn on_delete_database(&self, arguments: &Value) -> MethodResult {
        let args: PathArgs = decode_args(arguments)?;
        self.registry.delete_database(&args.path)?;
        Ok(Value::Null)
    }

    fn on_get_databases_path(&self) -> MethodResult {
        let path = self.registry.databases_path().map_err(|err| MethodError::Failure {
            code: ERROR_STORAGE.to_string(),
            message: err.to_string(),
            details: None,
        })?;
        Ok(Value::String(path.to_string_lossy().to_string()))
    }

    fn on_options(&self, arguments: &Value) -> MethodResult {
        let opts: PluginOptions = decode_args(arguments)?;
        debug!(
            query_as_map_list = ?opts.query_as_map_list,
            log_level = ?opts.log_level,
            "sqflite.options"
        );
        let mut current = self
            .options
            .lock()
            .map_err(|_| DatabaseError::generic("options lock poisoned"))?;
        *current = opts;
        Ok(Value::Null)
    }

    /// Runs a statement-level call, attaching `{sql, arguments}` to failures.
    fn with_statement<T>(
        &self,
        args: &SqlArgs,
        f: impl FnOnce(&mut DatabaseSession, &[SqlValue]) -> Result<T, DatabaseError>,
    ) -> Result<T, MethodError> {
        let raw = args.arguments.as_deref().unwrap_or(&[]);
        self.registry.with_session(args.id, |session| {
            let params = SqlValue::list_from_json(raw)
                .map_err(|err| MethodError::statement(&err, &args.sql, raw))?;
            f(session, params.as_slice()).map_err(|err| MethodError::statement(&err, &args.sql, raw))
        })
    }

    fn on_execute(&self, arguments: &Value) -> MethodResult {
        let args: SqlArgs = decode_args(arguments)?;
        self.with_statement(&args, |session, params| session.execute(&args.sql, params))?;
        Ok(Value::Null)
    }

    fn on_query(&self, arguments: &Value) -> MethodResult {
        let args: SqlArgs = decode_args(arguments)?;
        let set = self.with_statement(&args, |session, params| session.query(&args.sql, params))?;
        Ok(encode_result_set(&set, self.query_as_map_list()?))
    }

    fn on_insert(&self, arguments: &Value) -> MethodResult {
        let args: SqlArgs = decode_args(arguments)?;
        let no_result = args.no_result.unwrap_or(false);
        let id = self.with_statement(&args, |session, params| {
            session.insert(&args.sql, params, no_result)
        })?;
        Ok(id.map(Value::from).unwrap_or(Value::Null))
    }

    fn on_update(&self, arguments: &Value) -> MethodResult {
        let args: SqlArgs = decode_args(arguments)?;
        let no_result = args.no_result.unwrap_or(false);
        let count = self.with_statement(&args, |session, params| {
            session.update(&args.sql, params, no_result)
        })?;
        Ok(count.map(Value::from).unwrap_or(Value::Null))
    }

    fn on_batch(&self, arguments: &Value) -> MethodResult {
        let args: BatchArgs = decode_args(arguments)?;
        let options = BatchOptions {
            continue_on_error: args.continue_on_error.unwrap_or(false),
            no_result: args.no_result.unwrap_or(false),
        };

        let as_map_list = self.query_as_map_list()?;
        let records = self.registry.with_session(args.id, |session| {
            run_batch(session, args.operations, options).map_err(|err| match err {
                BatchError::Failed {
                    sql,
                    arguments,
                    source,
                    ..
                } => MethodError::statement(&source, &sql, &arguments),
                BatchError::UnknownMethod { index, source } => {
                    warn!(index = index, error = %source, "sqflite.batch_unknown_method");
                    MethodError::NotImplemented
                }
            })
        })?;

        Ok(match records {
            Some(records) => Value::Array(
                records
                    .iter()
                    .map(|record| encode_record(record, as_map_list))
                    .collect(),
            ),
            None => Value::Null,
        })
    }

    fn on_debug(&self, arguments: &Value) -> MethodResult {
        let args: DebugArgs = decode_args(arguments)?;
        let mut response = Map::new();
        if args.cmd.as_deref() != Some(CMD_GET) {
            return Ok(Value::Object(response));
        }

        if let Some(level) = self.options()?.log_level {
            response.insert(PARAM_LOG_LEVEL.to_string(), Value::from(level));
        }
        let sessions = self.registry.describe()?;
        if !sessions.is_empty() {
            let databases: Map<String, Value> = sessions
                .into_iter()
                .map(|(id, info)| {
                    (
                        id.to_string(),
                        json!({
                            PARAM_PATH: info.path,
                            PARAM_SINGLE_INSTANCE: info.single_instance,
                            PARAM_READ_ONLY: info.read_only,
                        }),
                    )
                })
                .collect();
            response.insert("databases".to_string(), Value::Object(databases));
        }
        Ok(Value::Object(response))
    }
}

impl Default for SqflitePlugin {
    fn default() -> Self {
        Self::new(SqfliteConfig::default())
    }
}
