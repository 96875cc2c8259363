//! Sequential execution of a list of operations against one session.
//!
//! Each operation produces one record unless `no_result` is set. A failure
//! either aborts the whole batch (default) or, with `continue_on_error`,
//! becomes an error record and the next operation runs. Arguments are
//! converted when their operation runs, so an unbindable argument fails only
//! that operation. An unknown method name always ends the batch; operations
//! before it keep their effects.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::DatabaseError;
use crate::session::DatabaseSession;
use crate::value::{ResultSet, SqlValue};

/// Method names accepted inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMethod {
    Execute,
    Insert,
    Update,
    Query,
}

impl BatchMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchMethod::Execute => "execute",
            BatchMethod::Insert => "insert",
            BatchMethod::Update => "update",
            BatchMethod::Query => "query",
        }
    }
}

impl fmt::Display for BatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method name that is not one of [`BatchMethod`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown batch method: {0}")]
pub struct UnknownMethod(pub String);

impl FromStr for BatchMethod {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execute" => Ok(BatchMethod::Execute),
            "insert" => Ok(BatchMethod::Insert),
            "update" => Ok(BatchMethod::Update),
            "query" => Ok(BatchMethod::Query),
            other => Err(UnknownMethod(other.to_string())),
        }
    }
}

/// One entry of a batch, as received over the channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub method: String,
    #[serde(default)]
    pub sql: String,
    /// Raw channel arguments; converted to [`SqlValue`]s when the operation runs.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub arguments: Vec<Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default())
}

impl BatchOperation {
    pub fn new(method: BatchMethod, sql: impl Into<String>, arguments: Vec<Value>) -> Self {
        Self {
            method: method.as_str().to_string(),
            sql: sql.into(),
            arguments,
        }
    }
}

/// Flags controlling a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub continue_on_error: bool,
    pub no_result: bool,
}

/// Value produced by one successful operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutput {
    Executed,
    /// Inserted row id; `None` when nothing was inserted.
    Inserted(Option<i64>),
    /// Changed row count.
    Updated(Option<i64>),
    Queried(ResultSet),
}

/// Per-operation record.
#[derive(Debug)]
pub enum BatchRecord {
    Success(OperationOutput),
    Failure {
        error: DatabaseError,
        sql: String,
        arguments: Vec<Value>,
    },
}

impl BatchRecord {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchRecord::Success(_))
    }
}

/// Error that ended a batch run.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    /// Operation failure without `continue_on_error`.
    #[error("batch operation {index} failed: {source}")]
    Failed {
        index: usize,
        sql: String,
        arguments: Vec<Value>,
        #[source]
        source: DatabaseError,
    },

    /// Ends the run whatever `continue_on_error` says.
    #[error("batch operation {index}: {source}")]
    UnknownMethod {
        index: usize,
        #[source]
        source: UnknownMethod,
    },
}

/// Converts the arguments of `op` and runs it as `method`.
pub fn apply_operation(
    session: &mut DatabaseSession,
    method: BatchMethod,
    op: &BatchOperation,
    no_result: bool,
) -> Result<OperationOutput, DatabaseError> {
    let params = SqlValue::list_from_json(&op.arguments)?;
    match method {
        BatchMethod::Execute => session
            .execute(&op.sql, &params)
            .map(|()| OperationOutput::Executed),
        BatchMethod::Insert => session
            .insert(&op.sql, &params, no_result)
            .map(OperationOutput::Inserted),
        BatchMethod::Update => session
            .update(&op.sql, &params, no_result)
            .map(OperationOutput::Updated),
        BatchMethod::Query => session.query(&op.sql, &params).map(OperationOutput::Queried),
    }
}

/// Applies `operations` in order.
///
/// Returns `Ok(None)` when `no_result` is set, otherwise one record per
/// operation. Without `continue_on_error` the first failure ends the run and
/// no records are returned.
pub fn run_batch(
    session: &mut DatabaseSession,
    operations: Vec<BatchOperation>,
    options: BatchOptions,
) -> Result<Option<Vec<BatchRecord>>, BatchError> {
    debug!(
        id = session.id(),
        count = operations.len(),
        continue_on_error = options.continue_on_error,
        no_result = options.no_result,
        "sqflite.batch"
    );

    let mut records = Vec::new();
    for (index, op) in operations.into_iter().enumerate() {
        let method = op
            .method
            .parse::<BatchMethod>()
            .map_err(|source| BatchError::UnknownMethod { index, source })?;

        match apply_operation(session, method, &op, options.no_result) {
            Ok(output) => {
                if !options.no_result {
                    records.push(BatchRecord::Success(output));
                }
            }
            Err(error) if options.continue_on_error => {
                debug!(index = index, method = %method, error = %error, "sqflite.batch_continue");
                if !options.no_result {
                    records.push(BatchRecord::Failure {
                        error,
                        sql: op.sql,
                        arguments: op.arguments,
                    });
                }
            }
            Err(error) => {
                return Err(BatchError::Failed {
                    index,
                    sql: op.sql,
                    arguments: op.arguments,
                    source: error,
                });
            }
        }
    }

    Ok((!options.no_result).then_some(records))
}
