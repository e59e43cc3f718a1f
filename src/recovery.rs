//! Engine error classification and recovery policy
//!
//! Every native call result is checked. Failures are classified into a
//! [`Recovery`] action which the connection applies before the error is
//! surfaced: reconnect errors tear the session down and reopen it, fatal
//! server errors close it. Nothing is retried; the caller re-issues.

use crate::constants::{error_code, Status, PARSE_ERROR_MARKER};
use crate::engine::EngineError;

/// Which error check a call goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPath {
    /// Statement preparation, binding, defines and row fetching
    Driver,
    /// The query, DML, PL/SQL and LOB command surface
    Script,
}

/// Action to take for a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Treat the call as successful
    Ignore,
    /// Flush, close and reopen the session, then surface the error
    Reconnect,
    /// Close the session without reopening, then surface the error
    Disconnect,
    /// Surface the error
    Surface,
}

/// Classify a native status and error code.
///
/// Success and success-with-info are never errors. Reading past the end of
/// a LONG (1405) is only ignored on the script path.
pub fn classify(status: Status, code: Option<u32>, path: ErrorPath) -> Recovery {
    if status.is_success() {
        return Recovery::Ignore;
    }

    match code {
        Some(
            error_code::HOSTDEF_EXTENSION_MISSING
            | error_code::END_OF_CHANNEL
            | error_code::PACKET_WRITER_FAILURE,
        ) => Recovery::Reconnect,
        Some(error_code::MAX_PROCESSES_EXCEEDED | error_code::ORACLE_NOT_AVAILABLE) => {
            Recovery::Disconnect
        }
        Some(error_code::FETCHED_COLUMN_NULL) if path == ErrorPath::Script => Recovery::Ignore,
        _ => Recovery::Surface,
    }
}

/// Classify an engine error
pub fn classify_error(error: &EngineError, path: ErrorPath) -> Recovery {
    classify(error.status, error.code, path)
}

/// SQL text as it appears in diagnostics
pub fn loggable_sql(sql: Option<&str>, max_len: i64) -> &str {
    match sql {
        None => "[nil]",
        Some(sql) => match usize::try_from(max_len) {
            Ok(max) if sql.len() > max => "[too long]",
            _ => sql,
        },
    }
}

fn status_message(error: &EngineError) -> String {
    match error.status {
        Status::Error => match error.code {
            Some(_) => error.to_string(),
            None => error.message.clone(),
        },
        Status::NeedData => "Error - need data".to_string(),
        Status::NoData => "Error - no data".to_string(),
        Status::InvalidHandle => "Error - invalid handle".to_string(),
        Status::StillExecuting => "Error - still executing".to_string(),
        Status::Success | Status::SuccessWithInfo => error.message.clone(),
    }
}

/// Build the diagnostic for a failed call.
///
/// For parse errors (code 900, or any error with a positive parse offset
/// inside the query) the SQL is split at the offset with a marker.
pub fn format_diagnostic(
    context: &str,
    call: &str,
    error: &EngineError,
    sql: Option<&str>,
    max_log_len: i64,
) -> String {
    let query = loggable_sql(sql, max_log_len);
    let message = status_message(error);
    let offset = error.parse_offset.unwrap_or(0);
    let is_parse_error = error.code == Some(error_code::INVALID_SQL_STATEMENT) || offset > 0;

    let shown = match query.get(..offset).zip(query.get(offset..)) {
        Some((head, tail)) if is_parse_error => {
            format!("{}{}{}", head, PARSE_ERROR_MARKER, tail)
        }
        _ => query.to_string(),
    };

    format!("{}: error in `{} ()': {}\nSQL: {}", context, call, message, shown)
}
