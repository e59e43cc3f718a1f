//! Driver constants
//!
//! Type numbers, piece markers, status codes and the sizing constants used
//! by the buffer pool and the piecewise transfer engine.

// =============================================================================
// Oracle Data Types
// =============================================================================

/// Oracle data type numbers, as reported by column describes and used as
/// external bind/define representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OracleType {
    /// VARCHAR2 / character string (SQLT_CHR)
    Varchar = 1,
    /// NUMBER type
    Number = 2,
    /// Null-terminated string (SQLT_STR)
    Str = 5,
    /// LONG string type
    Long = 8,
    /// ROWID
    Rowid = 11,
    /// DATE type
    Date = 12,
    /// RAW binary type
    Raw = 23,
    /// LONG RAW binary type
    LongRaw = 24,
    /// CHAR fixed-length string
    Char = 96,
    /// REF CURSOR
    Cursor = 102,
    /// ROWID descriptor
    RowidDescriptor = 104,
    /// CLOB
    Clob = 112,
    /// BLOB
    Blob = 113,
    /// TIMESTAMP
    Timestamp = 180,
}

impl OracleType {
    /// Check if this type is a LOB addressed through a locator
    pub fn is_lob(&self) -> bool {
        matches!(self, OracleType::Clob | OracleType::Blob)
    }

    /// Check if this type is fetched piecewise into a growing buffer
    pub fn is_long(&self) -> bool {
        matches!(self, OracleType::Long | OracleType::LongRaw)
    }

    /// Check if this type is reported as hex text when converted to a string
    pub fn is_binary(&self) -> bool {
        matches!(self, OracleType::Raw)
    }
}

impl TryFrom<u8> for OracleType {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(OracleType::Varchar),
            2 => Ok(OracleType::Number),
            5 => Ok(OracleType::Str),
            8 => Ok(OracleType::Long),
            11 => Ok(OracleType::Rowid),
            12 => Ok(OracleType::Date),
            23 => Ok(OracleType::Raw),
            24 => Ok(OracleType::LongRaw),
            96 => Ok(OracleType::Char),
            102 => Ok(OracleType::Cursor),
            104 => Ok(OracleType::RowidDescriptor),
            112 => Ok(OracleType::Clob),
            113 => Ok(OracleType::Blob),
            180 => Ok(OracleType::Timestamp),
            _ => Err(crate::error::Error::InvalidOracleType(value)),
        }
    }
}

// =============================================================================
// Piecewise Protocol
// =============================================================================

/// Piece marker attached to every piecewise transfer and LOB chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Piece {
    /// The whole value in a single transfer
    One,
    /// First of several pieces
    First,
    /// A middle piece
    Next,
    /// Final piece
    Last,
}

impl Piece {
    /// Whether this piece closes the transfer
    pub fn is_final(&self) -> bool {
        matches!(self, Piece::One | Piece::Last)
    }

    /// Whether this piece opens the transfer
    pub fn is_initial(&self) -> bool {
        matches!(self, Piece::One | Piece::First)
    }
}

/// Direction of a data-at-execute request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The engine wants a value from the driver
    In,
    /// The engine has a value for the driver
    Out,
}

// =============================================================================
// Native Status
// =============================================================================

/// Status returned by every native client call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Call succeeded
    Success,
    /// Call succeeded with diagnostic information attached
    SuccessWithInfo,
    /// Engine needs a piece of data (data-at-execute)
    NeedData,
    /// No more rows
    NoData,
    /// Call failed
    Error,
    /// A handle passed to the call was invalid
    InvalidHandle,
    /// Non-blocking call still running
    StillExecuting,
}

impl Status {
    /// Success and success-with-info are both non-errors
    pub fn is_success(&self) -> bool {
        matches!(self, Status::Success | Status::SuccessWithInfo)
    }
}

// =============================================================================
// Error Codes
// =============================================================================

/// Oracle error codes the recovery policy acts on
pub mod error_code {
    /// Maximum number of server processes exceeded
    pub const MAX_PROCESSES_EXCEEDED: u32 = 20;
    /// Invalid SQL statement
    pub const INVALID_SQL_STATEMENT: u32 = 900;
    /// Oracle not available
    pub const ORACLE_NOT_AVAILABLE: u32 = 1034;
    /// Internal error, hostdef extension does not exist
    pub const HOSTDEF_EXTENSION_MISSING: u32 = 1041;
    /// Fetched column value is NULL; raised when reading past the end of a LONG
    pub const FETCHED_COLUMN_NULL: u32 = 1405;
    /// End-of-file on communication channel
    pub const END_OF_CHANNEL: u32 = 3113;
    /// TNS packet writer failure
    pub const PACKET_WRITER_FAILURE: u32 = 12571;
}

// =============================================================================
// Buffer Sizing
// =============================================================================

/// Slack added to every fixed-width slot for termination and charset growth
pub const SLOT_SLACK: usize = 8;

/// Width of the string form of a maximum-precision NUMBER
pub const NUMBER_STRING_SIZE: usize = 41;

/// Width of the string form of a ROWID
pub const ROWID_STRING_SIZE: usize = 18;

/// Growth step and initial size for PL/SQL OUT buffers
pub const PLSQL_BUFFER_SIZE: usize = 4096;

/// Ceiling for any data-at-execute value, in either direction
pub const MAX_DYNAMIC_BUFFER: usize = 5_000_000;

/// Maximum length of the exception code string surfaced with engine errors
pub const EXCEPTION_CODE_SIZE: usize = 5;

/// Marker inserted into logged SQL at the parse error offset
pub const PARSE_ERROR_MARKER: &str = " !>>>!";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oracle_type_conversion() {
        assert_eq!(OracleType::try_from(2).unwrap(), OracleType::Number);
        assert_eq!(OracleType::try_from(112).unwrap(), OracleType::Clob);
        assert!(OracleType::try_from(250).is_err());
    }

    #[test]
    fn test_type_classes() {
        assert!(OracleType::Clob.is_lob());
        assert!(OracleType::Blob.is_lob());
        assert!(!OracleType::Long.is_lob());
        assert!(OracleType::Long.is_long());
        assert!(OracleType::Raw.is_binary());
    }

    #[test]
    fn test_piece_markers() {
        assert!(Piece::One.is_final() && Piece::One.is_initial());
        assert!(Piece::Last.is_final());
        assert!(!Piece::Next.is_final() && !Piece::Next.is_initial());
    }

    #[test]
    fn test_status_success() {
        assert!(Status::Success.is_success());
        assert!(Status::SuccessWithInfo.is_success());
        assert!(!Status::Error.is_success());
        assert!(!Status::NoData.is_success());
    }
}
