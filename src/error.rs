//! Error types for the driver core
//!
//! Errors fall into four groups: request errors detected before any engine
//! call is made, engine errors reported by the native client, streaming
//! errors raised by a LOB source or sink, and internal invariant violations.

use std::io;
use thiserror::Error;

use crate::constants::EXCEPTION_CODE_SIZE;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the driver core
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    // =========================================================================
    // Request Errors
    // =========================================================================
    /// Positional bind below 1
    #[error("invalid positional variable `:{0}', valid values start with 1")]
    InvalidPositional(usize),

    /// Positional bind past the end of the supplied values
    #[error("not enough arguments for positional variable ':{0}'")]
    NotEnoughArguments(usize),

    /// Named bind missing from a variable store
    #[error("undefined variable `{0}'")]
    UndefinedVariable(String),

    /// Named bind missing from a key-value set
    #[error("undefined set element `{0}'")]
    UndefinedSetElement(String),

    /// Array binds with differing row counts
    #[error("non-matching numbers of rows: `{name}' has {actual}, expected {expected}")]
    ArrayRowMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    /// Array DML issued without any bind variables
    #[error("array DML requires at least one bind variable")]
    NoArrayBinds,

    /// A second REF CURSOR bind in one statement
    #[error("you can only have a single ref cursors (`{0}' bound more than once)")]
    DuplicateCursor(String),

    /// Return variable of a PL/SQL call not among the binds
    #[error("return variable '{0}' not found in statement bind variables")]
    ReturnVariableNotFound(String),

    /// Data-at-execute value above the dynamic buffer ceiling
    #[error("value for `{name}' is {len} bytes, exceeding the {max} byte limit")]
    ValueTooLarge { name: String, len: usize, max: usize },

    /// LOB binds and LOB sources do not pair up
    #[error("statement has {binds} LOB bind variables but {sources} values were supplied")]
    LobCountMismatch { binds: usize, sources: usize },

    /// LOB source file missing or unreadable
    #[error("could not access file {0}")]
    CannotAccessFile(String),

    /// Statement does not return rows
    #[error("Query was not a statement returning rows.")]
    NotAQuery,

    /// Statement is not DML
    #[error("Query was not a DML statement.")]
    NotDml,

    /// Single-row query returned nothing
    #[error("Query did not return a row.")]
    NoRows,

    /// Single-row query returned more than one row
    #[error("Query returned more than one row.")]
    TooManyRows,

    // =========================================================================
    // Connection and Configuration Errors
    // =========================================================================
    /// Operation on a closed connection
    #[error("connection is not open")]
    NotConnected,

    /// No statement has been executed on this connection
    #[error("no active statement")]
    NoStatement,

    /// Invalid configuration key or value
    #[error("configuration error: {0}")]
    Config(String),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// Error reported by the native client, with a formatted diagnostic
    #[error("{message}")]
    OracleError { code: Option<u32>, message: String },

    /// Invalid Oracle type number
    #[error("invalid Oracle type: {0}")]
    InvalidOracleType(u8),

    // =========================================================================
    // Streaming Errors
    // =========================================================================
    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// LOB sink accepted fewer bytes than offered
    #[error("short write to LOB sink: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new Oracle database error
    pub fn oracle(code: u32, message: impl Into<String>) -> Self {
        Error::OracleError {
            code: Some(code),
            message: message.into(),
        }
    }

    /// Short engine error code surfaced alongside the message
    pub fn code(&self) -> Option<String> {
        match self {
            Error::OracleError { code: Some(code), .. } => {
                let mut code = code.to_string();
                code.truncate(EXCEPTION_CODE_SIZE);
                Some(code)
            }
            _ => None,
        }
    }

    /// Check if this error was detected before any engine call
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidPositional(_)
                | Error::NotEnoughArguments(_)
                | Error::UndefinedVariable(_)
                | Error::UndefinedSetElement(_)
                | Error::ArrayRowMismatch { .. }
                | Error::NoArrayBinds
                | Error::DuplicateCursor(_)
                | Error::ReturnVariableNotFound(_)
                | Error::ValueTooLarge { .. }
                | Error::LobCountMismatch { .. }
                | Error::CannotAccessFile(_)
        )
    }

    /// Check if this error came from the native client
    pub fn is_engine_error(&self) -> bool {
        matches!(self, Error::OracleError { .. })
    }

    /// Check if this error came from a LOB source or sink
    pub fn is_streaming_error(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ShortWrite { .. })
    }
}
