//! The native client seam
//!
//! [`Engine`] is the boundary between the driver core and the database
//! client library that owns the wire protocol. Handles are opaque ids issued
//! by the engine. Calls that may need data the driver has not supplied yet
//! return [`Step::NeedData`]; the driver answers each request through
//! [`Engine::respond`] until the engine reports completion.
//!
//! [`MemoryEngine`] is a scripted in-process implementation used by the test
//! suite and for exercising the driver without a database.

mod memory;

pub use memory::{Call, Cell, ExecutionRecord, MemoryEngine, Scripted};

use std::fmt;

use async_trait::async_trait;

use crate::constants::{Direction, OracleType, Piece, Status};
use crate::statement::StatementType;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Wrap a raw engine id
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            /// Raw engine id
            pub fn id(&self) -> u64 {
                self.0
            }
        }
    };
}

handle_type!(
    /// A prepared statement or cursor owned by the engine
    StatementHandle
);
handle_type!(
    /// A bind registration on a statement
    BindHandle
);
handle_type!(
    /// A LOB locator (descriptor) owned by the engine
    LobLocator
);

/// Failure reported by a native call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    /// Native status of the failed call
    pub status: Status,
    /// Oracle error code, when the engine could retrieve one
    pub code: Option<u32>,
    /// Engine message text
    pub message: String,
    /// Parse error offset into the statement text, when reported
    pub parse_offset: Option<usize>,
}

impl EngineError {
    /// An error with an Oracle code
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            code: Some(code),
            message: message.into(),
            parse_offset: None,
        }
    }

    /// An error with a bare status and no retrievable code
    pub fn status(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            parse_offset: None,
        }
    }

    /// Attach a parse error offset
    pub fn with_parse_offset(mut self, offset: usize) -> Self {
        self.parse_offset = Some(offset);
        self
    }

    /// Whether this reports success with extra information, not a failure
    pub fn is_info(&self) -> bool {
        self.status.is_success()
    }
}

/// Accept a success-with-info report from a call that returns no value.
pub fn completed(result: EngineResult<()>) -> EngineResult<()> {
    match result {
        Err(e) if e.is_info() => Ok(()),
        other => other,
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "ORA-{:05}: {}", code, self.message),
            None => write!(f, "{:?}: {}", self.status, self.message),
        }
    }
}

impl std::error::Error for EngineError {}

/// Result of a native call
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Outcome of execute, fetch and piece responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The call finished (for fetch: a row is available)
    Complete,
    /// No (more) rows
    NoData,
    /// The engine needs the driver to answer a piece request
    NeedData(PieceRequest),
}

/// What a data-at-execute or dynamic define request is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceTarget {
    /// A data-at-execute bind
    Bind(BindHandle),
    /// A dynamically defined column (1-based position)
    Define(usize),
}

/// A single piece request from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRequest {
    /// Bind or define the request belongs to
    pub target: PieceTarget,
    /// Whether the engine wants data or is handing data over
    pub direction: Direction,
    /// Iteration (row of an array execute)
    pub iteration: u32,
    /// Row index within a returning bind
    pub index: u32,
    /// Piece the engine is asking for
    pub piece: Piece,
}

/// The driver's answer to a [`PieceRequest`]
#[derive(Debug)]
pub enum PieceResponse<'a> {
    /// IN data; `None` binds NULL
    Supply {
        /// Value bytes for this piece
        data: Option<&'a [u8]>,
        /// Piece marker
        piece: Piece,
    },
    /// A descriptor for a returning LOB; `None` reports NULL
    Descriptor {
        /// Descriptor the engine should point at the returned LOB
        lob: Option<LobLocator>,
        /// Piece marker
        piece: Piece,
    },
    /// Buffer space for OUT data
    Receive {
        /// Space the engine may fill
        buf: &'a mut [u8],
        /// Piece marker
        piece: Piece,
    },
}

/// Result of [`Engine::respond`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumed {
    /// Bytes the engine wrote into a `Receive` buffer
    pub written: usize,
    /// Indicator for received data (0 not null, -1 null)
    pub indicator: i16,
    /// What happens next
    pub step: Step,
}

/// How a bind value is transferred
#[derive(Debug, Clone, Copy)]
pub enum BindValue<'a> {
    /// Value copied at bind time; `None` binds NULL
    Inline(Option<&'a [u8]>),
    /// Value produced on request during execute
    DataAtExec,
    /// A REF CURSOR filled in by the statement
    Cursor(StatementHandle),
}

/// A bind registration request
#[derive(Debug, Clone)]
pub struct BindSpec<'a> {
    /// Bind name without the leading colon
    pub name: String,
    /// External representation
    pub ty: OracleType,
    /// Largest value the bind will carry
    pub max_len: usize,
    /// Transfer mode
    pub value: BindValue<'a>,
}

/// Column metadata from a describe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescribe {
    /// Column name as reported by the engine
    pub name: String,
    /// Column type
    pub ty: OracleType,
    /// Declared size in bytes
    pub size: usize,
}

impl ColumnDescribe {
    /// Create a column describe
    pub fn new(name: impl Into<String>, ty: OracleType, size: usize) -> Self {
        Self {
            name: name.into(),
            ty,
            size,
        }
    }
}

/// How a column is defined for fetching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Define {
    /// Copied into a fixed buffer of the given capacity on every fetch
    Buffer {
        /// External representation
        ty: OracleType,
        /// Buffer capacity
        capacity: usize,
    },
    /// Delivered piecewise through [`Step::NeedData`] during fetch
    Dynamic {
        /// External representation
        ty: OracleType,
    },
    /// Fetched into a LOB descriptor
    Locator(LobLocator),
}

/// Result of reading a fetched column out of its define
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRead {
    /// Raw indicator (0 not null, -1 null, anything else an error)
    pub indicator: i16,
    /// Bytes copied
    pub len: usize,
}

/// One unit of a LOB transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LobChunk {
    /// 1-based offset of the first byte
    pub offset: u64,
    /// Byte count
    pub amount: usize,
    /// Position in the transfer
    pub piece: Piece,
}

/// Native client operations used by the driver core.
///
/// Implementations are driven by exactly one caller at a time; the
/// connection holds the engine by `&mut`.
///
/// A call that completes with extra information is not a failure. Calls
/// that return a value report it by returning the value; calls without one
/// (and execute and fetch) may return an [`EngineError`] whose status is
/// [`Status::SuccessWithInfo`], which the driver treats as success.
#[async_trait]
pub trait Engine: Send {
    /// Open a session
    async fn open(&mut self, datasource: &str, user: &str, password: &str) -> EngineResult<()>;

    /// Close the session, freeing anything it still owns
    async fn close(&mut self) -> EngineResult<()>;

    /// Prepare SQL text
    async fn prepare(&mut self, sql: &str) -> EngineResult<StatementHandle>;

    /// Allocate an unprepared statement to receive a REF CURSOR
    async fn alloc_cursor(&mut self) -> EngineResult<StatementHandle>;

    /// Free a statement or cursor
    async fn free_statement(&mut self, stmt: StatementHandle) -> EngineResult<()>;

    /// Statement type as classified by the engine
    async fn statement_type(&mut self, stmt: StatementHandle) -> EngineResult<StatementType>;

    /// Apply prefetch hints (0 leaves the engine default)
    async fn set_prefetch(&mut self, stmt: StatementHandle, rows: u32, memory: u32) -> EngineResult<()>;

    /// Register a bind
    async fn bind(&mut self, stmt: StatementHandle, spec: BindSpec<'_>) -> EngineResult<BindHandle>;

    /// Execute `iters` times (0 for queries)
    async fn execute(
        &mut self,
        stmt: StatementHandle,
        iters: u32,
        commit_on_success: bool,
    ) -> EngineResult<Step>;

    /// Answer the outstanding piece request
    async fn respond(
        &mut self,
        stmt: StatementHandle,
        response: PieceResponse<'_>,
    ) -> EngineResult<Resumed>;

    /// Rows returned through a returning bind in the current execution
    async fn rows_returned(&mut self, bind: BindHandle) -> EngineResult<usize>;

    /// Rows processed by the last execute or fetched so far
    async fn row_count(&mut self, stmt: StatementHandle) -> EngineResult<u64>;

    /// Number of select-list columns
    async fn column_count(&mut self, stmt: StatementHandle) -> EngineResult<usize>;

    /// Describe a select-list column (1-based)
    async fn describe_column(&mut self, stmt: StatementHandle, pos: usize) -> EngineResult<ColumnDescribe>;

    /// Define a select-list column (1-based)
    async fn define(&mut self, stmt: StatementHandle, pos: usize, define: Define) -> EngineResult<()>;

    /// Fetch the next row
    async fn fetch(&mut self, stmt: StatementHandle) -> EngineResult<Step>;

    /// Copy a buffer-defined column of the current row; LOB defines report
    /// only their indicator
    async fn column_value(
        &mut self,
        stmt: StatementHandle,
        pos: usize,
        buf: &mut [u8],
    ) -> EngineResult<ColumnRead>;

    /// Allocate a LOB descriptor
    async fn alloc_lob(&mut self) -> EngineResult<LobLocator>;

    /// Free a LOB descriptor
    async fn free_lob(&mut self, lob: LobLocator) -> EngineResult<()>;

    /// Length in bytes of the LOB a descriptor points at
    async fn lob_length(&mut self, lob: LobLocator) -> EngineResult<u64>;

    /// Read one chunk; returns bytes copied
    async fn lob_read(&mut self, lob: LobLocator, chunk: LobChunk, buf: &mut [u8]) -> EngineResult<usize>;

    /// Write one chunk
    async fn lob_write(&mut self, lob: LobLocator, chunk: LobChunk, data: &[u8]) -> EngineResult<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> EngineResult<()>;

    /// Roll back the current transaction
    async fn rollback(&mut self) -> EngineResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        assert_eq!(
            EngineError::new(3113, "end-of-file on communication channel").to_string(),
            "ORA-03113: end-of-file on communication channel"
        );
        assert_eq!(
            EngineError::status(Status::InvalidHandle, "bad handle").to_string(),
            "InvalidHandle: bad handle"
        );
    }

    #[test]
    fn test_completed_accepts_info() {
        let info = EngineError::status(Status::SuccessWithInfo, "ORA-24347");
        assert!(info.is_info());
        assert_eq!(completed(Err(info)), Ok(()));

        let failure = EngineError::new(942, "table or view does not exist");
        assert!(!failure.is_info());
        assert_eq!(completed(Err(failure.clone())), Err(failure));
    }

    #[test]
    fn test_handles() {
        let stmt = StatementHandle::new(7);
        assert_eq!(stmt.id(), 7);
        assert_ne!(LobLocator::new(1), LobLocator::new(2));
    }
}
