//! Scripted in-memory engine
//!
//! [`MemoryEngine`] answers every [`Engine`] call from scripts registered per
//! SQL text. It speaks the full piecewise protocol (data-at-execute binds,
//! returning LOB descriptors, LONG columns delivered in pieces), keeps LOB
//! content in memory, validates LOB chunk ordering, and counts every call and
//! every live handle so tests can check that nothing leaks.
//!
//! # Example
//!
//! ```rust
//! use ora_piecewise::constants::OracleType;
//! use ora_piecewise::engine::{Cell, ColumnDescribe, MemoryEngine, Scripted};
//!
//! let mut engine = MemoryEngine::new();
//! engine.script(
//!     "select name from users",
//!     Scripted::query(
//!         vec![ColumnDescribe::new("NAME", OracleType::Varchar, 30)],
//!         vec![vec![Cell::text("alice")], vec![Cell::Null]],
//!     ),
//! );
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::trace;

use crate::constants::{Direction, OracleType, Piece, Status};
use crate::statement::StatementType;

use super::{
    BindHandle, BindSpec, BindValue, ColumnDescribe, ColumnRead, Define, Engine, EngineError,
    EngineResult, LobChunk, LobLocator, PieceRequest, PieceResponse, PieceTarget, Resumed,
    StatementHandle, Step,
};

const NOT_CONNECTED: u32 = 3114;
const FETCH_OUT_OF_SEQUENCE: u32 = 1002;
const NOT_IN_SELECT_LIST: u32 = 1007;
const LOB_OPERATION_OUT_OF_ORDER: u32 = 24804;
const VALUE_TOO_LARGE: u32 = 1406;

/// Engine calls, for counting and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Call {
    Open,
    Close,
    Prepare,
    AllocCursor,
    FreeStatement,
    StatementType,
    SetPrefetch,
    Bind,
    Execute,
    Respond,
    RowsReturned,
    RowCount,
    ColumnCount,
    DescribeColumn,
    Define,
    Fetch,
    ColumnValue,
    AllocLob,
    FreeLob,
    LobLength,
    LobRead,
    LobWrite,
    Commit,
    Rollback,
}

impl Call {
    /// Calls whose result carries a value other than a [`Step`]
    pub fn returns_value(self) -> bool {
        matches!(
            self,
            Call::Prepare
                | Call::AllocCursor
                | Call::StatementType
                | Call::Bind
                | Call::Respond
                | Call::RowsReturned
                | Call::RowCount
                | Call::ColumnCount
                | Call::DescribeColumn
                | Call::ColumnValue
                | Call::AllocLob
                | Call::LobLength
                | Call::LobRead
        )
    }
}

/// One value of a scripted result row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cell {
    /// NULL
    Null,
    /// Character data
    Text(String),
    /// LOB content, reached through a locator
    Lob(Vec<u8>),
}

impl Cell {
    /// Character cell
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// LOB cell
    pub fn lob(content: impl Into<Vec<u8>>) -> Self {
        Cell::Lob(content.into())
    }

    fn bytes(&self) -> Option<&[u8]> {
        match self {
            Cell::Null => None,
            Cell::Text(text) => Some(text.as_bytes()),
            Cell::Lob(content) => Some(content),
        }
    }
}

/// Scripted behaviour of one SQL text
#[derive(Debug, Clone)]
pub enum Scripted {
    /// A query returning these rows
    Query {
        /// Select-list describes
        columns: Vec<ColumnDescribe>,
        /// Rows, one cell per column
        rows: Vec<Vec<Cell>>,
    },
    /// DML affecting `rows_per_iter` rows per execution iteration
    Dml {
        /// Rows processed per iteration
        rows_per_iter: u64,
    },
    /// DML whose LOB binds each return `rows` fresh LOBs
    ReturningLobs {
        /// Rows returned per LOB bind
        rows: usize,
    },
    /// A PL/SQL block
    Plsql {
        /// OUT values by bind name; binds not listed echo their IN value
        outputs: IndexMap<String, Option<String>>,
        /// Rows opened on any REF CURSOR bind
        cursor: Option<(Vec<ColumnDescribe>, Vec<Vec<Cell>>)>,
    },
    /// Execution fails with this error
    Fail(EngineError),
}

impl Scripted {
    /// Query script
    pub fn query(columns: Vec<ColumnDescribe>, rows: Vec<Vec<Cell>>) -> Self {
        Scripted::Query { columns, rows }
    }

    /// DML script
    pub fn dml(rows_per_iter: u64) -> Self {
        Scripted::Dml { rows_per_iter }
    }

    /// PL/SQL script with no outputs
    pub fn plsql() -> Self {
        Scripted::Plsql {
            outputs: IndexMap::new(),
            cursor: None,
        }
    }

    /// Add an OUT value to a PL/SQL script
    pub fn with_output(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        if let Scripted::Plsql { outputs, .. } = &mut self {
            outputs.insert(name.into(), value.map(str::to_string));
        }
        self
    }

    /// Open a REF CURSOR from a PL/SQL script
    pub fn with_cursor(mut self, columns: Vec<ColumnDescribe>, rows: Vec<Vec<Cell>>) -> Self {
        if let Scripted::Plsql { cursor, .. } = &mut self {
            *cursor = Some((columns, rows));
        }
        self
    }

    fn statement_type(&self, sql: &str) -> StatementType {
        match self {
            Scripted::Query { .. } => StatementType::Query,
            Scripted::Dml { .. } | Scripted::ReturningLobs { .. } => StatementType::Dml,
            Scripted::Plsql { .. } => StatementType::PlSql,
            Scripted::Fail(_) => StatementType::from_sql(sql),
        }
    }
}

/// Values one execution received, per iteration and bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Statement text
    pub sql: String,
    /// Iteration count passed to execute
    pub iters: u32,
    /// Whether the execution committed on success
    pub commit_on_success: bool,
    /// `rows[iteration][bind]`, inline and data-at-execute values alike
    pub rows: Vec<Vec<Option<String>>>,
}

#[derive(Debug)]
enum BoundMode {
    Inline(Option<Vec<u8>>),
    DataAtExec,
    Cursor(StatementHandle),
}

#[derive(Debug)]
struct BoundVar {
    handle: BindHandle,
    name: String,
    ty: OracleType,
    mode: BoundMode,
}

#[derive(Debug, Clone, Copy)]
enum Pending {
    In { bind: usize, iteration: u32 },
    OutValue { bind: usize },
    OutDescriptor { bind: usize, index: u32 },
    LongColumn { pos: usize },
}

#[derive(Debug)]
struct Outstanding {
    pending: Pending,
    request: PieceRequest,
    data: Option<Vec<u8>>,
    offset: usize,
}

#[derive(Debug, Default)]
struct ResultRows {
    columns: Vec<ColumnDescribe>,
    rows: VecDeque<Vec<Cell>>,
    current: Option<Vec<Cell>>,
    fetched: u64,
}

impl ResultRows {
    fn new(columns: Vec<ColumnDescribe>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            current: None,
            fetched: 0,
        }
    }
}

#[derive(Debug)]
struct StatementState {
    sql: String,
    script: Option<Scripted>,
    kind: StatementType,
    binds: Vec<BoundVar>,
    defines: BTreeMap<usize, Define>,
    results: Option<ResultRows>,
    queue: VecDeque<Pending>,
    outstanding: Option<Outstanding>,
    record: Option<ExecutionRecord>,
    supplied: HashMap<usize, Option<Vec<u8>>>,
    returning_rows: usize,
    row_count: u64,
}

impl StatementState {
    fn new(sql: String, script: Option<Scripted>, kind: StatementType) -> Self {
        Self {
            sql,
            script,
            kind,
            binds: Vec::new(),
            defines: BTreeMap::new(),
            results: None,
            queue: VecDeque::new(),
            outstanding: None,
            record: None,
            supplied: HashMap::new(),
            returning_rows: 0,
            row_count: 0,
        }
    }

    fn columns(&self) -> &[ColumnDescribe] {
        match (&self.results, &self.script) {
            (Some(results), _) => &results.columns,
            (None, Some(Scripted::Query { columns, .. })) => columns,
            _ => &[],
        }
    }

    fn output_for(&self, bind: usize) -> Option<Vec<u8>> {
        let name = self.binds.get(bind).map(|b| b.name.as_str())?;
        if let Some(Scripted::Plsql { outputs, .. }) = &self.script {
            if let Some(value) = outputs.get(name) {
                return value.as_ref().map(|v| v.as_bytes().to_vec());
            }
        }
        self.supplied.get(&bind).cloned().flatten()
    }

    fn current_cell(&self, pos: usize) -> EngineResult<&Cell> {
        self.results
            .as_ref()
            .and_then(|r| r.current.as_ref())
            .ok_or_else(|| EngineError::new(FETCH_OUT_OF_SEQUENCE, "fetch out of sequence"))?
            .get(pos.wrapping_sub(1))
            .ok_or_else(|| EngineError::new(NOT_IN_SELECT_LIST, "variable not in select list"))
    }

    /// Make `pending` the outstanding request
    fn activate(&mut self, pending: Pending) -> EngineResult<PieceRequest> {
        let handle = |bind: usize| {
            self.binds
                .get(bind)
                .map(|b| PieceTarget::Bind(b.handle))
                .ok_or_else(|| invalid_handle("bind"))
        };
        let (target, direction, iteration, index, piece, data) = match pending {
            Pending::In { bind, iteration } => {
                (handle(bind)?, Direction::In, iteration, 0, Piece::One, None)
            }
            Pending::OutValue { bind } => (
                handle(bind)?,
                Direction::Out,
                0,
                0,
                Piece::First,
                self.output_for(bind),
            ),
            Pending::OutDescriptor { bind, index } => {
                (handle(bind)?, Direction::Out, 0, index, Piece::One, None)
            }
            Pending::LongColumn { pos } => (
                PieceTarget::Define(pos),
                Direction::Out,
                0,
                0,
                Piece::First,
                self.current_cell(pos)?.bytes().map(<[u8]>::to_vec),
            ),
        };
        let request = PieceRequest {
            target,
            direction,
            iteration,
            index,
            piece,
        };
        self.outstanding = Some(Outstanding {
            pending,
            request,
            data,
            offset: 0,
        });
        Ok(request)
    }
}

#[derive(Debug)]
struct Injected {
    call: Call,
    skip: usize,
    error: EngineError,
}

/// Scripted in-process [`Engine`]
#[derive(Debug, Default)]
pub struct MemoryEngine {
    scripts: HashMap<String, Scripted>,
    connected: bool,
    next_id: u64,
    statements: HashMap<u64, StatementState>,
    lobs: HashMap<u64, Option<usize>>,
    contents: Vec<Option<Vec<u8>>>,
    created: Vec<usize>,
    streams: HashMap<u64, u64>,
    lob_writes: Vec<LobChunk>,
    failures: Vec<Injected>,
    counts: HashMap<Call, usize>,
    executions: Vec<ExecutionRecord>,
    prefetch: Option<(u32, u32)>,
    opens: usize,
    closes: usize,
    commits: usize,
    rollbacks: usize,
}

fn invalid_handle(what: &str) -> EngineError {
    EngineError::status(Status::InvalidHandle, format!("invalid {} handle", what))
}

fn statement(
    statements: &mut HashMap<u64, StatementState>,
    stmt: StatementHandle,
) -> EngineResult<&mut StatementState> {
    statements
        .get_mut(&stmt.id())
        .ok_or_else(|| invalid_handle("statement"))
}

impl MemoryEngine {
    /// Create an engine with no scripts
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the behaviour of a SQL text (matched after trimming)
    pub fn script(&mut self, sql: impl Into<String>, scripted: Scripted) -> &mut Self {
        self.scripts.insert(sql.into().trim().to_string(), scripted);
        self
    }

    /// Fail the next call of the given kind.
    ///
    /// A success-with-info status makes calls without a value report it;
    /// value-returning calls complete normally.
    pub fn fail_on(&mut self, call: Call, error: EngineError) -> &mut Self {
        self.fail_on_nth(call, 1, error)
    }

    /// Fail the `n`th (1-based) upcoming call of the given kind
    pub fn fail_on_nth(&mut self, call: Call, n: usize, error: EngineError) -> &mut Self {
        self.failures.push(Injected {
            call,
            skip: n.saturating_sub(1),
            error,
        });
        self
    }

    /// Allocate a locator already pointing at `content` (`None` is NULL)
    pub fn create_lob(&mut self, content: Option<Vec<u8>>) -> LobLocator {
        let lob = LobLocator::new(self.issue());
        self.point(lob, content);
        lob
    }

    /// Current content of a LOB; `None` for NULL or an unknown locator
    pub fn lob_content(&self, lob: LobLocator) -> Option<&[u8]> {
        self.lobs
            .get(&lob.id())
            .copied()
            .flatten()
            .and_then(|idx| self.contents.get(idx))
            .and_then(|c| c.as_deref())
    }

    /// Whether a session is open
    pub fn is_open(&self) -> bool {
        self.connected
    }

    /// Number of successful opens
    pub fn opens(&self) -> usize {
        self.opens
    }

    /// Number of closes
    pub fn closes(&self) -> usize {
        self.closes
    }

    /// Number of explicit commits
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// Number of rollbacks
    pub fn rollbacks(&self) -> usize {
        self.rollbacks
    }

    /// Times a call was made, failed or not
    pub fn calls(&self, call: Call) -> usize {
        self.counts.get(&call).copied().unwrap_or(0)
    }

    /// Total number of calls made
    pub fn total_calls(&self) -> usize {
        self.counts.values().sum()
    }

    /// Statements and cursors not yet freed
    pub fn live_statements(&self) -> usize {
        self.statements.len()
    }

    /// LOB descriptors not yet freed
    pub fn live_lobs(&self) -> usize {
        self.lobs.len()
    }

    /// Completed executions, oldest first
    pub fn executions(&self) -> &[ExecutionRecord] {
        &self.executions
    }

    /// Content of every LOB created through a returning bind; `None` is NULL
    pub fn created_lobs(&self) -> Vec<Option<&[u8]>> {
        self.created
            .iter()
            .map(|&idx| self.contents.get(idx).and_then(|c| c.as_deref()))
            .collect()
    }

    /// Every LOB write chunk, in order
    pub fn lob_writes(&self) -> &[LobChunk] {
        &self.lob_writes
    }

    /// Last prefetch hints applied
    pub fn prefetch(&self) -> Option<(u32, u32)> {
        self.prefetch
    }

    fn enter(&mut self, call: Call) -> EngineResult<()> {
        *self.counts.entry(call).or_default() += 1;
        trace!(?call, "memory engine call");

        if let Some(i) = self.failures.iter().position(|f| f.call == call) {
            if self.failures[i].skip > 0 {
                self.failures[i].skip -= 1;
            } else {
                let error = self.failures.remove(i).error;
                // a value-returning call reports information by returning its value
                if !(error.is_info() && call.returns_value()) {
                    return Err(error);
                }
                trace!(?call, %error, "success with info");
            }
        }

        if !self.connected && !matches!(call, Call::Open | Call::Close) {
            return Err(EngineError::new(NOT_CONNECTED, "not connected to ORACLE"));
        }
        Ok(())
    }

    fn issue(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn content_of(&self, lob: LobLocator) -> EngineResult<Option<usize>> {
        self.lobs
            .get(&lob.id())
            .copied()
            .ok_or_else(|| invalid_handle("LOB"))
    }

    fn point(&mut self, lob: LobLocator, content: Option<Vec<u8>>) {
        self.contents.push(content);
        self.lobs.insert(lob.id(), Some(self.contents.len() - 1));
    }

    /// Check a chunk continues the locator's transfer without gap or overlap
    fn check_chunk(&self, lob: LobLocator, chunk: &LobChunk) -> EngineResult<()> {
        let expected = if chunk.piece.is_initial() {
            1
        } else {
            *self.streams.get(&lob.id()).ok_or_else(|| {
                EngineError::new(
                    LOB_OPERATION_OUT_OF_ORDER,
                    format!("{:?} piece without a transfer in progress", chunk.piece),
                )
            })?
        };
        if chunk.offset != expected {
            return Err(EngineError::new(
                LOB_OPERATION_OUT_OF_ORDER,
                format!("chunk at offset {} where {} was expected", chunk.offset, expected),
            ));
        }
        Ok(())
    }

    fn track_chunk(&mut self, lob: LobLocator, chunk: &LobChunk, n: usize) {
        if chunk.piece.is_final() {
            self.streams.remove(&lob.id());
        } else {
            self.streams.insert(lob.id(), chunk.offset + n as u64);
        }
    }

    /// Issue the next queued request, or finish the call
    fn next_step(&mut self, stmt: StatementHandle) -> EngineResult<Step> {
        let state = statement(&mut self.statements, stmt)?;
        match state.queue.pop_front() {
            Some(pending) => Ok(Step::NeedData(state.activate(pending)?)),
            None => {
                state.outstanding = None;
                if let Some(record) = state.record.take() {
                    self.executions.push(record);
                }
                Ok(Step::Complete)
            }
        }
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn open(&mut self, _datasource: &str, _user: &str, _password: &str) -> EngineResult<()> {
        self.enter(Call::Open)?;
        self.connected = true;
        self.opens += 1;
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        self.enter(Call::Close)?;
        self.connected = false;
        self.closes += 1;
        self.statements.clear();
        self.lobs.clear();
        self.streams.clear();
        Ok(())
    }

    async fn prepare(&mut self, sql: &str) -> EngineResult<StatementHandle> {
        self.enter(Call::Prepare)?;
        let script = self.scripts.get(sql.trim()).cloned();
        let kind = match &script {
            Some(script) => script.statement_type(sql),
            None => StatementType::from_sql(sql),
        };
        let id = self.issue();
        self.statements
            .insert(id, StatementState::new(sql.to_string(), script, kind));
        Ok(StatementHandle::new(id))
    }

    async fn alloc_cursor(&mut self) -> EngineResult<StatementHandle> {
        self.enter(Call::AllocCursor)?;
        let id = self.issue();
        self.statements.insert(
            id,
            StatementState::new(String::new(), None, StatementType::Query),
        );
        Ok(StatementHandle::new(id))
    }

    async fn free_statement(&mut self, stmt: StatementHandle) -> EngineResult<()> {
        self.enter(Call::FreeStatement)?;
        self.statements
            .remove(&stmt.id())
            .map(|_| ())
            .ok_or_else(|| invalid_handle("statement"))
    }

    async fn statement_type(&mut self, stmt: StatementHandle) -> EngineResult<StatementType> {
        self.enter(Call::StatementType)?;
        Ok(statement(&mut self.statements, stmt)?.kind)
    }

    async fn set_prefetch(&mut self, stmt: StatementHandle, rows: u32, memory: u32) -> EngineResult<()> {
        self.enter(Call::SetPrefetch)?;
        statement(&mut self.statements, stmt)?;
        self.prefetch = Some((rows, memory));
        Ok(())
    }

    async fn bind(&mut self, stmt: StatementHandle, spec: BindSpec<'_>) -> EngineResult<BindHandle> {
        self.enter(Call::Bind)?;
        let handle = BindHandle::new(self.issue());
        let mode = match spec.value {
            BindValue::Inline(value) => BoundMode::Inline(value.map(<[u8]>::to_vec)),
            BindValue::DataAtExec => BoundMode::DataAtExec,
            BindValue::Cursor(cursor) => BoundMode::Cursor(cursor),
        };
        statement(&mut self.statements, stmt)?.binds.push(BoundVar {
            handle,
            name: spec.name,
            ty: spec.ty,
            mode,
        });
        Ok(handle)
    }

    async fn execute(
        &mut self,
        stmt: StatementHandle,
        iters: u32,
        commit_on_success: bool,
    ) -> EngineResult<Step> {
        self.enter(Call::Execute)?;
        let state = statement(&mut self.statements, stmt)?;
        if let Some(Scripted::Fail(error)) = &state.script {
            return Err(error.clone());
        }

        let iterations = if state.kind.is_query() { 1 } else { iters.max(1) };
        let text = |v: &Option<Vec<u8>>| v.as_ref().map(|v| String::from_utf8_lossy(v).into_owned());
        let row: Vec<Option<String>> = state
            .binds
            .iter()
            .map(|b| match &b.mode {
                BoundMode::Inline(value) => text(value),
                _ => None,
            })
            .collect();

        state.queue.clear();
        state.supplied.clear();
        state.outstanding = None;
        state.record = Some(ExecutionRecord {
            sql: state.sql.clone(),
            iters,
            commit_on_success,
            rows: vec![row; iterations as usize],
        });

        let dynamic: Vec<usize> = state
            .binds
            .iter()
            .enumerate()
            .filter(|(_, b)| matches!(b.mode, BoundMode::DataAtExec))
            .map(|(i, _)| i)
            .collect();
        for iteration in 0..iterations {
            for &bind in &dynamic {
                state.queue.push_back(Pending::In { bind, iteration });
            }
        }

        let mut cursor_rows = None;
        match state.script.clone() {
            Some(Scripted::Query { columns, rows }) => {
                state.results = Some(ResultRows::new(columns, rows));
                state.row_count = 0;
            }
            Some(Scripted::Plsql { cursor, .. }) => {
                for &bind in &dynamic {
                    state.queue.push_back(Pending::OutValue { bind });
                }
                cursor_rows = cursor;
                state.row_count = 1;
            }
            script => {
                if state.kind.is_query() {
                    state.results = Some(ResultRows::default());
                } else if state.kind.is_plsql() {
                    for &bind in &dynamic {
                        state.queue.push_back(Pending::OutValue { bind });
                    }
                } else {
                    state.returning_rows = match script {
                        Some(Scripted::ReturningLobs { rows }) => rows,
                        Some(Scripted::Dml { rows_per_iter }) => rows_per_iter as usize,
                        _ => 1,
                    };
                    for &bind in &dynamic {
                        if state.binds[bind].ty.is_lob() {
                            for index in 0..state.returning_rows {
                                state.queue.push_back(Pending::OutDescriptor {
                                    bind,
                                    index: index as u32,
                                });
                            }
                        }
                    }
                }
                state.row_count = match script {
                    Some(Scripted::Dml { rows_per_iter }) => rows_per_iter * u64::from(iterations),
                    Some(Scripted::ReturningLobs { rows }) => rows as u64,
                    _ if state.kind.is_dml() => u64::from(iterations),
                    _ => 0,
                };
            }
        }

        let cursors: Vec<StatementHandle> = state
            .binds
            .iter()
            .filter_map(|b| match b.mode {
                BoundMode::Cursor(cursor) => Some(cursor),
                _ => None,
            })
            .collect();
        for cursor in cursors {
            let (columns, rows) = cursor_rows.clone().unwrap_or_default();
            statement(&mut self.statements, cursor)?.results = Some(ResultRows::new(columns, rows));
        }

        self.next_step(stmt)
    }

    async fn respond(
        &mut self,
        stmt: StatementHandle,
        response: PieceResponse<'_>,
    ) -> EngineResult<Resumed> {
        self.enter(Call::Respond)?;
        let state = statement(&mut self.statements, stmt)?;
        let mut outstanding = state.outstanding.take().ok_or_else(|| {
            EngineError::status(Status::Error, "no piece request outstanding")
        })?;

        let (written, indicator) = match (outstanding.pending, response) {
            (Pending::In { bind, iteration }, PieceResponse::Supply { data, .. }) => {
                let value = data.map(<[u8]>::to_vec);
                if let Some(record) = state.record.as_mut() {
                    if let Some(cell) = record
                        .rows
                        .get_mut(iteration as usize)
                        .and_then(|row| row.get_mut(bind))
                    {
                        *cell = value.as_ref().map(|v| String::from_utf8_lossy(v).into_owned());
                    }
                }
                state.supplied.insert(bind, value);
                (0, 0)
            }
            (
                Pending::OutValue { .. } | Pending::LongColumn { .. },
                PieceResponse::Receive { buf, .. },
            ) => match outstanding.data.as_deref() {
                None => (0, -1),
                Some(data) => {
                    let remaining = data.len() - outstanding.offset;
                    if remaining > 0 && buf.is_empty() {
                        return Err(EngineError::new(
                            VALUE_TOO_LARGE,
                            "no buffer space offered for the remaining value",
                        ));
                    }
                    let n = remaining.min(buf.len());
                    buf[..n].copy_from_slice(&data[outstanding.offset..outstanding.offset + n]);
                    outstanding.offset += n;

                    if outstanding.offset < data.len() {
                        outstanding.request.piece = Piece::Next;
                        let request = outstanding.request;
                        state.outstanding = Some(outstanding);
                        return Ok(Resumed {
                            written: n,
                            indicator: 0,
                            step: Step::NeedData(request),
                        });
                    }
                    (n, 0)
                }
            },
            (Pending::OutValue { .. }, PieceResponse::Descriptor { lob: None, .. }) => (0, -1),
            (Pending::OutDescriptor { .. }, PieceResponse::Descriptor { lob, .. }) => {
                if let Some(lob) = lob {
                    if !self.lobs.contains_key(&lob.id()) {
                        return Err(invalid_handle("LOB"));
                    }
                    self.point(lob, None);
                    self.created.push(self.contents.len() - 1);
                }
                (0, 0)
            }
            (pending, response) => {
                return Err(EngineError::status(
                    Status::Error,
                    format!("{:?} does not answer {:?}", response, pending),
                ))
            }
        };

        let step = self.next_step(stmt)?;
        Ok(Resumed {
            written,
            indicator,
            step,
        })
    }

    async fn rows_returned(&mut self, bind: BindHandle) -> EngineResult<usize> {
        self.enter(Call::RowsReturned)?;
        self.statements
            .values()
            .find(|s| s.binds.iter().any(|b| b.handle == bind))
            .map(|s| s.returning_rows)
            .ok_or_else(|| invalid_handle("bind"))
    }

    async fn row_count(&mut self, stmt: StatementHandle) -> EngineResult<u64> {
        self.enter(Call::RowCount)?;
        Ok(statement(&mut self.statements, stmt)?.row_count)
    }

    async fn column_count(&mut self, stmt: StatementHandle) -> EngineResult<usize> {
        self.enter(Call::ColumnCount)?;
        Ok(statement(&mut self.statements, stmt)?.columns().len())
    }

    async fn describe_column(&mut self, stmt: StatementHandle, pos: usize) -> EngineResult<ColumnDescribe> {
        self.enter(Call::DescribeColumn)?;
        statement(&mut self.statements, stmt)?
            .columns()
            .get(pos.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| EngineError::new(NOT_IN_SELECT_LIST, "variable not in select list"))
    }

    async fn define(&mut self, stmt: StatementHandle, pos: usize, define: Define) -> EngineResult<()> {
        self.enter(Call::Define)?;
        if let Define::Locator(lob) = define {
            self.content_of(lob)?;
        }
        let state = statement(&mut self.statements, stmt)?;
        if pos == 0 || pos > state.columns().len() {
            return Err(EngineError::new(NOT_IN_SELECT_LIST, "variable not in select list"));
        }
        state.defines.insert(pos, define);
        Ok(())
    }

    async fn fetch(&mut self, stmt: StatementHandle) -> EngineResult<Step> {
        self.enter(Call::Fetch)?;
        let state = statement(&mut self.statements, stmt)?;
        let results = state
            .results
            .as_mut()
            .ok_or_else(|| EngineError::new(FETCH_OUT_OF_SEQUENCE, "fetch out of sequence"))?;

        let row = match results.rows.pop_front() {
            Some(row) => row,
            None => {
                results.current = None;
                return Ok(Step::NoData);
            }
        };
        results.fetched += 1;
        state.row_count = results.fetched;

        let mut pointed = Vec::new();
        for (&pos, define) in &state.defines {
            match define {
                Define::Locator(lob) => {
                    let content = match row.get(pos - 1) {
                        Some(Cell::Lob(content)) => Some(content.clone()),
                        Some(Cell::Text(text)) => Some(text.as_bytes().to_vec()),
                        _ => None,
                    };
                    pointed.push((*lob, content));
                }
                Define::Dynamic { .. } => state.queue.push_back(Pending::LongColumn { pos }),
                Define::Buffer { .. } => {}
            }
        }
        results.current = Some(row);

        for (lob, content) in pointed {
            self.point(lob, content);
        }
        self.next_step(stmt)
    }

    async fn column_value(
        &mut self,
        stmt: StatementHandle,
        pos: usize,
        buf: &mut [u8],
    ) -> EngineResult<ColumnRead> {
        self.enter(Call::ColumnValue)?;
        let state = statement(&mut self.statements, stmt)?;
        let define = state
            .defines
            .get(&pos)
            .copied()
            .ok_or_else(|| EngineError::new(NOT_IN_SELECT_LIST, "column is not defined"))?;
        let cell = state.current_cell(pos)?;

        match (define, cell.bytes()) {
            (_, None) => Ok(ColumnRead { indicator: -1, len: 0 }),
            (Define::Locator(_), Some(_)) => Ok(ColumnRead { indicator: 0, len: 0 }),
            (Define::Buffer { .. }, Some(data)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                let indicator = if len < data.len() {
                    i16::try_from(data.len()).unwrap_or(i16::MAX)
                } else {
                    0
                };
                Ok(ColumnRead { indicator, len })
            }
            (Define::Dynamic { .. }, Some(_)) => Err(EngineError::status(
                Status::Error,
                "dynamically defined columns are delivered through piece requests",
            )),
        }
    }

    async fn alloc_lob(&mut self) -> EngineResult<LobLocator> {
        self.enter(Call::AllocLob)?;
        let id = self.issue();
        self.lobs.insert(id, None);
        Ok(LobLocator::new(id))
    }

    async fn free_lob(&mut self, lob: LobLocator) -> EngineResult<()> {
        self.enter(Call::FreeLob)?;
        self.streams.remove(&lob.id());
        self.lobs
            .remove(&lob.id())
            .map(|_| ())
            .ok_or_else(|| invalid_handle("LOB"))
    }

    async fn lob_length(&mut self, lob: LobLocator) -> EngineResult<u64> {
        self.enter(Call::LobLength)?;
        let len = self
            .content_of(lob)?
            .and_then(|idx| self.contents.get(idx))
            .and_then(|c| c.as_ref())
            .map_or(0, |c| c.len());
        Ok(len as u64)
    }

    async fn lob_read(&mut self, lob: LobLocator, chunk: LobChunk, buf: &mut [u8]) -> EngineResult<usize> {
        self.enter(Call::LobRead)?;
        self.check_chunk(lob, &chunk)?;
        let content: &[u8] = self
            .content_of(lob)?
            .and_then(|idx| self.contents.get(idx))
            .and_then(|c| c.as_deref())
            .unwrap_or(&[]);

        let start = (chunk.offset - 1) as usize;
        if start > content.len() {
            return Err(EngineError::new(
                LOB_OPERATION_OUT_OF_ORDER,
                format!("read at offset {} past the end of a {} byte LOB", chunk.offset, content.len()),
            ));
        }
        let n = chunk.amount.min(buf.len()).min(content.len() - start);
        buf[..n].copy_from_slice(&content[start..start + n]);
        self.track_chunk(lob, &chunk, n);
        Ok(n)
    }

    async fn lob_write(&mut self, lob: LobLocator, chunk: LobChunk, data: &[u8]) -> EngineResult<()> {
        self.enter(Call::LobWrite)?;
        self.check_chunk(lob, &chunk)?;
        if data.len() != chunk.amount {
            return Err(EngineError::status(
                Status::Error,
                format!("chunk declares {} bytes but carries {}", chunk.amount, data.len()),
            ));
        }
        let idx = self
            .content_of(lob)?
            .ok_or_else(|| EngineError::status(Status::InvalidHandle, "LOB locator is not initialized"))?;
        let content = self
            .contents
            .get_mut(idx)
            .ok_or_else(|| invalid_handle("LOB"))?;
        if chunk.piece.is_initial() {
            *content = Some(Vec::with_capacity(data.len()));
        }
        content.get_or_insert_with(Vec::new).extend_from_slice(data);

        self.lob_writes.push(chunk);
        self.track_chunk(lob, &chunk, data.len());
        Ok(())
    }

    async fn commit(&mut self) -> EngineResult<()> {
        self.enter(Call::Commit)?;
        self.commits += 1;
        Ok(())
    }

    async fn rollback(&mut self) -> EngineResult<()> {
        self.enter(Call::Rollback)?;
        self.rollbacks += 1;
        Ok(())
    }
}
