//! Error types shared by every layer of the extension.
//!
//! Engine failures keep the SQLite extended result code. Failures that never
//! reach the engine use the negative codes of [`SqfliteErrorCode`].

/// Codes for failures that do not originate in the SQLite engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SqfliteErrorCode {
    Generic = -1,
    UnsupportedType = -2,
    DatabaseClosed = -3,
    BadParam = -4,
    IoError = -5,
}

/// Database operation errors
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("[{code}] Database error: {message}")]
    Engine { code: i32, message: String },

    #[error("[{code}] Unsupported parameter type: {message}")]
    UnsupportedType { code: i32, message: String },

    #[error("database_closed {id}")]
    Closed { id: i64 },

    #[error("[{code}] Invalid parameter: {message}")]
    BadParam { code: i32, message: String },

    #[error("[{code}] IO error: {message}")]
    IoError { code: i32, message: String },
}

impl DatabaseError {
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        Self::Engine {
            code,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::engine(SqfliteErrorCode::Generic as i32, message)
    }

    pub fn unsupported_type(message: impl Into<String>) -> Self {
        Self::UnsupportedType {
            code: SqfliteErrorCode::UnsupportedType as i32,
            message: message.into(),
        }
    }

    pub fn closed(id: i64) -> Self {
        Self::Closed { id }
    }

    pub fn bad_param(message: impl Into<String>) -> Self {
        Self::BadParam {
            code: SqfliteErrorCode::BadParam as i32,
            message: message.into(),
        }
    }

    pub fn io_error(message: impl Into<String>) -> Self {
        Self::IoError {
            code: SqfliteErrorCode::IoError as i32,
            message: message.into(),
        }
    }

    /// Numeric code carried by the error.
    pub fn code(&self) -> i32 {
        match self {
            Self::Engine { code, .. }
            | Self::UnsupportedType { code, .. }
            | Self::BadParam { code, .. }
            | Self::IoError { code, .. } => *code,
            Self::Closed { .. } => SqfliteErrorCode::DatabaseClosed as i32,
        }
    }

    /// Whether the error came from (or is reported as coming from) the engine.
    ///
    /// Unsupported parameter kinds count as engine errors: they are raised
    /// while binding, at the same point the engine would reject a value.
    pub fn is_engine_error(&self) -> bool {
        matches!(self, Self::Engine { .. } | Self::UnsupportedType { .. })
    }
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::Error::*;
        match &err {
            SqliteFailure(ffi_err, msg) => {
                let message = msg.clone().unwrap_or_else(|| err.to_string());
                DatabaseError::engine(ffi_err.extended_code, message)
            }
            SqlInputError { error, msg, .. } => DatabaseError::engine(error.extended_code, msg.clone()),
            _ => DatabaseError::generic(err.to_string()),
        }
    }
}

impl From<std::io::Error> for DatabaseError {
    fn from(err: std::io::Error) -> Self {
        DatabaseError::io_error(err.to_string())
    }
}

impl From<serde_json::Error> for DatabaseError {
    fn from(err: serde_json::Error) -> Self {
        DatabaseError::bad_param(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = DatabaseError::unsupported_type("map");
        match err {
            DatabaseError::UnsupportedType { code, .. } => {
                assert_eq!(code, SqfliteErrorCode::UnsupportedType as i32);
            }
            _ => panic!("Wrong error type"),
        }

        assert_eq!(
            DatabaseError::closed(4).code(),
            SqfliteErrorCode::DatabaseClosed as i32
        );
    }

    #[test]
    fn test_closed_message_names_id() {
        let err = DatabaseError::closed(12);
        assert_eq!(err.to_string(), "database_closed 12");
        assert!(!err.is_engine_error());
    }

    #[test]
    fn test_rusqlite_error_keeps_engine_code() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err: DatabaseError = conn.prepare("SELEC 1").unwrap_err().into();
        assert!(err.is_engine_error());
        assert_eq!(err.code(), rusqlite::ffi::SQLITE_ERROR);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DatabaseError = io_err.into();
        match err {
            DatabaseError::IoError { code, message } => {
                assert_eq!(code, SqfliteErrorCode::IoError as i32);
                assert!(message.contains("file not found"));
            }
            _ => panic!("Wrong error type"),
        }
    }
}
