//! Connection handling
//!
//! A [`Connection`] owns one engine session, the current statement and the
//! buffer pool of the request in flight. Every request follows the same
//! shape: flush what the previous request left behind, scan the SQL for
//! bind references, resolve their values (request errors surface here,
//! before any engine call), prepare and bind, execute while answering piece
//! requests, then read results. The pool is released on every path out of a
//! request.
//!
//! # Example
//!
//! ```rust,ignore
//! use ora_piecewise::{Binds, Config, Connection, MemoryEngine};
//!
//! let config = Config::new("ORCL", "scott", "tiger");
//! let mut conn = Connection::open(MemoryEngine::new(), config).await?;
//!
//! let rows = conn
//!     .select("select name from emp where id = :1", &Binds::positional(["7"]))
//!     .await?;
//! for row in rows.iter() {
//!     println!("{:?}", row.get_str(0));
//! }
//! conn.close().await?;
//! ```

use std::path::Path;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tracing::{debug, error, warn};

use crate::batch::ArrayBinds;
use crate::binds::{check_size, Binds, Variables};
use crate::buffer::{BufferPool, ColumnSlot, InSource, Indicator, OutSink, Transfer};
use crate::config::Config;
use crate::constants::{OracleType, MAX_DYNAMIC_BUFFER, PLSQL_BUFFER_SIZE};
use crate::engine::{
    completed, BindSpec, BindValue, Define, Engine, EngineError, EngineResult, LobLocator, StatementHandle,
    Step,
};
use crate::error::{Error, Result};
use crate::lob::{LobKind, LobSource, LobStreamer, LobTransfer};
use crate::piecewise::{self, TransferError};
use crate::recovery::{classify_error, format_diagnostic, ErrorPath, Recovery};
use crate::row::{ResultSet, Row};
use crate::statement::{scan_bind_variables, BindName};

/// Transaction mode of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Every successful DML commits on its own
    #[default]
    Autocommit,
    /// Inside `begin transaction`; nothing commits until `end transaction`
    Transaction,
}

/// Transaction control statement recognized by [`Connection::exec_builtin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    /// `begin transaction`
    Begin,
    /// `end transaction` (commit)
    End,
    /// `abort transaction` (rollback)
    Abort,
}

impl Builtin {
    /// Recognize a transaction control statement (case-insensitive)
    pub fn parse(sql: &str) -> Option<Self> {
        match sql.trim().to_ascii_lowercase().as_str() {
            "begin transaction" => Some(Builtin::Begin),
            "end transaction" => Some(Builtin::End),
            "abort transaction" => Some(Builtin::Abort),
            _ => None,
        }
    }
}

/// Result of [`Connection::plsql`]
#[derive(Debug, Clone, Default)]
pub struct PlsqlResult {
    /// OUT values of every non-cursor bind, in bind order
    pub outputs: Variables,
    /// Rows of the REF CURSOR, when one was bound
    pub cursor: Option<ResultSet>,
}

/// A driver connection over an [`Engine`] session
pub struct Connection<E: Engine> {
    engine: E,
    config: Config,
    mode: Mode,
    connected: bool,
    /// Statement of the last request
    stmt: Option<StatementHandle>,
    /// Buffer pool of the request in flight
    pool: Option<BufferPool>,
    pools_allocated: usize,
    pools_released: usize,
}

impl<E: Engine> std::fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("connected", &self.connected)
            .field("stmt", &self.stmt)
            .finish()
    }
}

fn pool_slot(pool: &mut Option<BufferPool>, index: usize) -> Result<&mut ColumnSlot> {
    pool.as_mut()
        .and_then(|pool| pool.slot_mut(index))
        .ok_or_else(|| Error::Internal(format!("buffer slot {} is not allocated", index)))
}

/// Bind registration for a staged slot
fn bind_spec(slot: &ColumnSlot) -> Result<BindSpec<'_>> {
    let ty = slot.oracle_type().unwrap_or(OracleType::Str);
    let (max_len, value) = match slot.transfer() {
        Transfer::Inline => {
            let value = match slot.indicator() {
                Indicator::Null => None,
                _ => Some(slot.buffer().as_slice()),
            };
            (slot.buffer().len() + 1, BindValue::Inline(value))
        }
        Transfer::DataAtExec { input, output } => {
            let max_len = match (input, output) {
                (InSource::ListElements, _) => slot.buffer().capacity(),
                (_, OutSink::Descriptors) => 0,
                (_, OutSink::Receive) => MAX_DYNAMIC_BUFFER,
                _ => slot.input().map_or(0, |v| v.len()) + 1,
            };
            (max_len, BindValue::DataAtExec)
        }
        Transfer::Cursor => {
            let cursor = slot
                .cursor()
                .ok_or_else(|| Error::Internal(format!("cursor `{}' is not allocated", slot.name)))?;
            (0, BindValue::Cursor(cursor))
        }
        other => {
            return Err(Error::Internal(format!(
                "slot `{}' cannot be bound ({:?})",
                slot.name, other
            )))
        }
    };
    Ok(BindSpec {
        name: slot.name.clone(),
        ty,
        max_len,
        value,
    })
}

impl<E: Engine> Connection<E> {
    /// Open a session on `engine`
    pub async fn open(engine: E, config: Config) -> Result<Self> {
        let mut conn = Self {
            engine,
            config,
            mode: Mode::Autocommit,
            connected: false,
            stmt: None,
            pool: None,
            pools_allocated: 0,
            pools_released: 0,
        };
        conn.connect().await?;
        Ok(conn)
    }

    async fn connect(&mut self) -> Result<()> {
        let result = self
            .engine
            .open(&self.config.datasource, &self.config.user, self.config.password())
            .await;
        match completed(result) {
            Ok(()) => {
                self.connected = true;
                self.mode = Mode::Autocommit;
                if self.config.debug {
                    debug!(datasource = %self.config.datasource, user = %self.config.user, "session opened");
                }
                Ok(())
            }
            Err(e) => {
                let err = self.diagnostic("open", "open", None, &e);
                error!(datasource = %self.config.datasource, code = ?e.code, "{}", err);
                Err(err)
            }
        }
    }

    /// Close the session. Closing a closed connection is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.flush().await;
        self.connected = false;
        match completed(self.engine.close().await) {
            Ok(()) => {
                if self.config.debug {
                    debug!(datasource = %self.config.datasource, "session closed");
                }
                Ok(())
            }
            Err(e) => Err(self.diagnostic("close", "close", None, &e)),
        }
    }

    /// Close (if open) and open a fresh session
    pub async fn reopen(&mut self) -> Result<()> {
        if let Err(e) = self.close().await {
            warn!(error = %e, "close before reopen failed");
        }
        self.connect().await
    }

    /// Free the current statement and any pool left behind
    pub async fn flush(&mut self) {
        self.release_pool().await;
        if let Some(stmt) = self.stmt.take() {
            if let Err(e) = self.engine.free_statement(stmt).await {
                warn!(error = %e, "failed to free statement");
            }
        }
    }

    /// Return the connection to a clean autocommit state.
    ///
    /// An open transaction is rolled back.
    pub async fn reset(&mut self) -> Result<()> {
        self.flush().await;
        if self.mode == Mode::Transaction {
            self.mode = Mode::Autocommit;
            if self.connected {
                self.rollback().await?;
            }
        }
        Ok(())
    }

    /// Check if the session is open
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Current transaction mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Connection configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// The underlying engine, mutably
    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Consume the connection and return the engine without closing it
    pub fn into_engine(self) -> E {
        self.engine
    }

    /// Whether a buffer pool is currently held
    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    /// Pools allocated and released over the connection's lifetime
    pub fn pool_stats(&self) -> (usize, usize) {
        (self.pools_allocated, self.pools_released)
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Run a transaction control statement.
    ///
    /// Returns `None` when `sql` is not one, leaving the connection alone.
    pub async fn exec_builtin(&mut self, sql: &str) -> Result<Option<Builtin>> {
        let builtin = match Builtin::parse(sql) {
            Some(builtin) => builtin,
            None => return Ok(None),
        };
        self.ensure_open()?;
        match builtin {
            Builtin::Begin => self.mode = Mode::Transaction,
            Builtin::End => {
                self.mode = Mode::Autocommit;
                self.commit().await?;
            }
            Builtin::Abort => {
                self.mode = Mode::Autocommit;
                self.rollback().await?;
            }
        }
        if self.config.debug {
            debug!(builtin = ?builtin, mode = ?self.mode, "transaction control");
        }
        Ok(Some(builtin))
    }

    /// Commit the current transaction
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = completed(self.engine.commit().await);
        self.check("commit", "commit", None, result).await
    }

    /// Roll back the current transaction
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = completed(self.engine.rollback().await);
        self.check("rollback", "rollback", None, result).await
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Run a query and fetch every row.
    ///
    /// LOB columns come back as text; LONG columns are fetched piecewise
    /// with no length limit.
    pub async fn select(&mut self, sql: &str, binds: &Binds) -> Result<ResultSet> {
        self.flush().await;
        let result = self.run_select("select", sql, binds).await;
        self.release_pool().await;
        result
    }

    /// Run a query that must return exactly one row
    pub async fn one_row(&mut self, sql: &str, binds: &Binds) -> Result<Row> {
        match self.select(sql, binds).await?.into_single() {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(Error::NoRows),
            Err(_) => Err(Error::TooManyRows),
        }
    }

    /// Run a query that returns at most one row
    pub async fn zero_or_one_row(&mut self, sql: &str, binds: &Binds) -> Result<Option<Row>> {
        self.select(sql, binds)
            .await?
            .into_single()
            .map_err(|_| Error::TooManyRows)
    }

    async fn run_select(&mut self, ctx: &'static str, sql: &str, binds: &Binds) -> Result<ResultSet> {
        let names = scan_bind_variables(sql);
        self.stage_inline(&names, binds)?;

        let stmt = self.prepare(ctx, sql).await?;
        let kind = self.engine.statement_type(stmt).await;
        if !self.check(ctx, "statement_type", Some(sql), kind).await?.is_query() {
            return Err(Error::NotAQuery);
        }
        self.bind_pool(ctx, sql, stmt).await?;

        let (rows, memory) = (self.config.prefetch_rows, self.config.prefetch_memory);
        if rows > 0 || memory > 0 {
            let result = completed(self.engine.set_prefetch(stmt, rows, memory).await);
            self.check(ctx, "set_prefetch", Some(sql), result).await?;
        }

        if self.config.debug {
            debug!(sql = %self.config.loggable(sql), binds = names.len(), "select");
        }
        self.execute(ctx, sql, stmt, 0, false, ErrorPath::Script).await?;
        self.fetch_all(ctx, sql, stmt).await
    }

    /// Describe and define every column of `stmt`, then fetch all rows
    async fn fetch_all(&mut self, ctx: &'static str, sql: &str, stmt: StatementHandle) -> Result<ResultSet> {
        self.release_pool().await;

        let count = self.engine.column_count(stmt).await;
        let count = self.check(ctx, "column_count", Some(sql), count).await?;
        self.install_pool(count);

        for pos in 1..=count {
            let describe = self.engine.describe_column(stmt, pos).await;
            let describe = self.check(ctx, "describe_column", Some(sql), describe).await?;
            let (expansion, lob_size) = (self.config.char_expansion, self.config.lob_buffer_size);

            let slot = pool_slot(&mut self.pool, pos - 1)?;
            slot.describe(pos, &describe.name, describe.ty, describe.size, expansion, lob_size);
            let define = match slot.transfer() {
                Transfer::Define => Define::Buffer {
                    ty: OracleType::Str,
                    capacity: slot.buffer().capacity(),
                },
                Transfer::LongFetch => Define::Dynamic { ty: OracleType::Long },
                _ => {
                    let lob = self.engine.alloc_lob().await;
                    let lob = self.check(ctx, "alloc_lob", Some(sql), lob).await?;
                    pool_slot(&mut self.pool, pos - 1)?.set_locator(lob);
                    Define::Locator(lob)
                }
            };
            let result = completed(self.engine.define(stmt, pos, define).await);
            self.check(ctx, "define", Some(sql), result).await?;
        }

        let columns: Vec<String> = self
            .pool
            .iter()
            .flat_map(|pool| pool.iter())
            .map(|slot| slot.name.clone())
            .collect();
        let mut result = ResultSet::new(columns);

        loop {
            let step = self.engine.fetch(stmt).await;
            let step = self.check_step(ctx, "fetch", sql, step, ErrorPath::Script).await?;
            if self.drive(ctx, sql, stmt, step, ErrorPath::Script).await? == Step::NoData {
                break;
            }
            let mut values = Vec::with_capacity(count);
            for index in 0..count {
                values.push(self.column_text(ctx, sql, stmt, index).await?);
            }
            result.push(values);
        }

        if self.config.debug {
            debug!(rows = result.row_count(), columns = count, "fetch complete");
        }
        Ok(result)
    }

    /// Current row's value of one column
    async fn column_text(
        &mut self,
        ctx: &'static str,
        sql: &str,
        stmt: StatementHandle,
        index: usize,
    ) -> Result<Option<String>> {
        let slot = pool_slot(&mut self.pool, index)?;
        let pos = slot.position();
        match slot.transfer() {
            Transfer::LongFetch => {}
            Transfer::Define => {
                let read = self.engine.column_value(stmt, pos, slot.buffer_mut().whole_mut()).await;
                let read = self.check(ctx, "column_value", Some(sql), read).await?;
                let slot = pool_slot(&mut self.pool, index)?;
                slot.buffer_mut().commit(read.len)?;
                slot.set_indicator(Indicator::from_raw(read.indicator));
            }
            _ => {
                let lob = slot
                    .locator()
                    .ok_or_else(|| Error::Internal(format!("column `{}' has no locator", slot.name)))?;
                let read = self.engine.column_value(stmt, pos, &mut []).await;
                let read = self.check(ctx, "column_value", Some(sql), read).await?;
                if Indicator::from_raw(read.indicator).is_null() {
                    return Ok(None);
                }
                let streamer = self.streamer();
                let content = match streamer.read_to_vec(&mut self.engine, lob).await {
                    Ok(content) => content,
                    Err(e) => return Err(self.transfer_failed(ctx, sql, e, ErrorPath::Script).await),
                };
                return Ok(content.map(|c| String::from_utf8_lossy(&c).into_owned()));
            }
        }

        let slot = pool_slot(&mut self.pool, index)?;
        match slot.indicator() {
            Indicator::NotNull => Ok(slot.text()),
            Indicator::Null => Ok(None),
            Indicator::Error(code) => Err(Error::Internal(format!(
                "column `{}' fetched with indicator {}",
                slot.name, code
            ))),
        }
    }

    // =========================================================================
    // DML
    // =========================================================================

    /// Run a DML statement and return the affected row count
    pub async fn dml(&mut self, sql: &str, binds: &Binds) -> Result<u64> {
        self.flush().await;
        let result = self.run_dml("dml", sql, binds).await;
        self.release_pool().await;
        result
    }

    async fn run_dml(&mut self, ctx: &'static str, sql: &str, binds: &Binds) -> Result<u64> {
        let names = scan_bind_variables(sql);
        self.stage_inline(&names, binds)?;

        let stmt = self.prepare(ctx, sql).await?;
        self.expect_dml(ctx, sql, stmt).await?;
        self.bind_pool(ctx, sql, stmt).await?;

        if self.config.debug {
            debug!(sql = %self.config.loggable(sql), binds = names.len(), "dml");
        }
        let commit = self.commit_on_success();
        self.execute(ctx, sql, stmt, 1, commit, ErrorPath::Script).await?;
        self.rows_processed(ctx, sql, stmt).await
    }

    /// Execute a DML statement once per row of the bound lists.
    ///
    /// Every list must have the same length; a mismatch is rejected before
    /// anything reaches the engine. Empty lists affect nothing.
    pub async fn array_dml(&mut self, sql: &str, arrays: &ArrayBinds) -> Result<u64> {
        self.flush().await;
        let result = self.run_array_dml("array_dml", sql, arrays).await;
        self.release_pool().await;
        result
    }

    async fn run_array_dml(&mut self, ctx: &'static str, sql: &str, arrays: &ArrayBinds) -> Result<u64> {
        let names = scan_bind_variables(sql);
        let pool = self.install_pool(names.len());
        let resolved = arrays.resolve(&names)?;
        let rows = resolved.rows();
        if rows == 0 {
            return Ok(0);
        }

        let widths: Vec<usize> = (0..names.len()).map(|i| resolved.max_len(i)).collect();
        for (((slot, name), list), width) in pool
            .iter_mut()
            .zip(&names)
            .zip(resolved.into_lists())
            .zip(widths)
        {
            slot.bind_data_at_exec(&name.bind_text(), OracleType::Char, InSource::ListElements, OutSink::Discard);
            slot.buffer_mut().reserve_total(width);
            slot.set_elements(list);
        }

        let iters = u32::try_from(rows)
            .map_err(|_| Error::Internal(format!("{} rows exceed the iteration limit", rows)))?;
        let stmt = self.prepare(ctx, sql).await?;
        self.expect_dml(ctx, sql, stmt).await?;
        self.bind_pool(ctx, sql, stmt).await?;

        if self.config.debug {
            debug!(sql = %self.config.loggable(sql), rows, binds = names.len(), "array dml");
        }
        let commit = self.commit_on_success();
        self.execute(ctx, sql, stmt, iters, commit, ErrorPath::Script).await?;
        self.rows_processed(ctx, sql, stmt).await
    }

    /// Rows processed by the current statement
    pub async fn result_rows(&mut self) -> Result<u64> {
        self.ensure_open()?;
        let stmt = self.stmt.ok_or(Error::NoStatement)?;
        let count = self.engine.row_count(stmt).await;
        self.check("result_rows", "row_count", None, count).await
    }

    // =========================================================================
    // PL/SQL
    // =========================================================================

    /// Run a block whose `:1` is an OUT value, returning that value
    pub async fn exec_plsql(&mut self, block: &str) -> Result<Option<String>> {
        self.flush().await;
        let result = self.run_exec_plsql("exec_plsql", block).await;
        self.release_pool().await;
        result
    }

    async fn run_exec_plsql(&mut self, ctx: &'static str, block: &str) -> Result<Option<String>> {
        let pool = self.install_pool(1);
        let slot = pool
            .slot_mut(0)
            .ok_or_else(|| Error::Internal("return slot missing".to_string()))?;
        slot.bind_data_at_exec("1", OracleType::Str, InSource::Null, OutSink::Receive);
        slot.buffer_mut().reserve_total(PLSQL_BUFFER_SIZE);

        let stmt = self.prepare(ctx, block).await?;
        self.bind_pool(ctx, block, stmt).await?;

        if self.config.debug {
            debug!(sql = %self.config.loggable(block), "exec_plsql");
        }
        let commit = self.commit_on_success();
        self.execute(ctx, block, stmt, 1, commit, ErrorPath::Script).await?;
        Ok(pool_slot(&mut self.pool, 0)?.text())
    }

    /// Run a block with bind values, returning the OUT value of `retvar`.
    ///
    /// `retvar` must be one of the block's binds. When the binds come from
    /// a variable store and `retvar` is named, the store is updated with the
    /// returned value.
    pub async fn exec_plsql_bind(
        &mut self,
        block: &str,
        retvar: &str,
        binds: &mut Binds,
    ) -> Result<Option<String>> {
        self.flush().await;
        let result = self.run_exec_plsql_bind("exec_plsql_bind", block, retvar, binds).await;
        self.release_pool().await;
        result
    }

    async fn run_exec_plsql_bind(
        &mut self,
        ctx: &'static str,
        block: &str,
        retvar: &str,
        binds: &mut Binds,
    ) -> Result<Option<String>> {
        let retvar = retvar.trim_start_matches(':');
        let names = scan_bind_variables(block);
        let pool = self.install_pool(names.len());

        let mut ret_index = None;
        for (index, (slot, name)) in pool.iter_mut().zip(&names).enumerate() {
            let text = name.bind_text();
            if text == retvar {
                let value = match binds.resolve(name) {
                    Ok(value) => value,
                    Err(Error::UndefinedVariable(_) | Error::UndefinedSetElement(_)) => None,
                    Err(e) => return Err(e),
                };
                check_size(name, value.as_ref())?;
                let input = if value.is_some() { InSource::Value } else { InSource::Null };
                slot.bind_data_at_exec(&text, OracleType::Str, input, OutSink::Receive);
                slot.set_input(value);
                slot.buffer_mut().reserve_total(PLSQL_BUFFER_SIZE);
                ret_index.get_or_insert(index);
            } else {
                let value = binds.resolve(name)?;
                check_size(name, value.as_ref())?;
                slot.bind_inline(&text, value.as_deref());
            }
        }
        let ret_index = ret_index.ok_or_else(|| Error::ReturnVariableNotFound(retvar.to_string()))?;

        let stmt = self.prepare(ctx, block).await?;
        self.bind_pool(ctx, block, stmt).await?;

        if self.config.debug {
            debug!(sql = %self.config.loggable(block), retvar, "exec_plsql_bind");
        }
        let commit = self.commit_on_success();
        self.execute(ctx, block, stmt, 1, commit, ErrorPath::Script).await?;

        let value = pool_slot(&mut self.pool, ret_index)?.text();
        if !retvar.chars().all(|c| c.is_ascii_digit()) {
            binds.set_variable(retvar, value.clone().unwrap_or_default());
        }
        Ok(value)
    }

    /// Run a block binding every variable IN/OUT from `vars`.
    ///
    /// OUT values are written back into `vars`. When `cursor` names a bind,
    /// it is bound as a REF CURSOR whose rows are returned and whose
    /// statement becomes the connection's current statement.
    pub async fn plsql(
        &mut self,
        block: &str,
        vars: &mut Variables,
        cursor: Option<&str>,
    ) -> Result<PlsqlResult> {
        self.flush().await;
        let result = self.run_plsql("plsql", block, vars, cursor).await;
        self.release_pool().await;
        result
    }

    async fn run_plsql(
        &mut self,
        ctx: &'static str,
        block: &str,
        vars: &mut Variables,
        cursor: Option<&str>,
    ) -> Result<PlsqlResult> {
        let cursor = cursor.map(|c| c.trim_start_matches(':'));
        let names = scan_bind_variables(block);
        let pool = self.install_pool(names.len());

        let mut cursor_index = None;
        for (index, (slot, name)) in pool.iter_mut().zip(&names).enumerate() {
            let text = name.bind_text();
            if Some(text.as_str()) == cursor {
                if cursor_index.is_some() {
                    return Err(Error::DuplicateCursor(text));
                }
                slot.bind_cursor(&text);
                cursor_index = Some(index);
                continue;
            }
            let value = vars
                .get(&text)
                .ok_or_else(|| Error::UndefinedVariable(text.clone()))?;
            let value = (!value.is_empty()).then(|| Bytes::copy_from_slice(value.as_bytes()));
            check_size(name, value.as_ref())?;
            let input = if value.is_some() { InSource::Value } else { InSource::Null };
            slot.bind_data_at_exec(&text, OracleType::Str, input, OutSink::Receive);
            slot.set_input(value);
            slot.buffer_mut().reserve_total(PLSQL_BUFFER_SIZE);
        }

        let stmt = self.prepare(ctx, block).await?;
        if let Some(index) = cursor_index {
            let handle = self.engine.alloc_cursor().await;
            let handle = self.check(ctx, "alloc_cursor", Some(block), handle).await?;
            pool_slot(&mut self.pool, index)?.set_cursor(handle);
        }
        self.bind_pool(ctx, block, stmt).await?;

        if self.config.debug {
            debug!(sql = %self.config.loggable(block), binds = names.len(), cursor = ?cursor, "plsql");
        }
        let commit = self.commit_on_success();
        self.execute(ctx, block, stmt, 1, commit, ErrorPath::Driver).await?;

        let mut outputs = Variables::new();
        for slot in self.pool.iter().flat_map(|pool| pool.iter()) {
            if slot.transfer() != Transfer::Cursor && !outputs.contains_key(&slot.name) {
                outputs.insert(slot.name.clone(), slot.text().unwrap_or_default());
            }
        }
        for (name, value) in &outputs {
            vars.insert(name.clone(), value.clone());
        }

        let cursor = match cursor_index {
            Some(index) => {
                let handle = pool_slot(&mut self.pool, index)?
                    .take_cursor()
                    .ok_or_else(|| Error::Internal("cursor handle lost".to_string()))?;
                // The cursor replaces the block as the current statement
                if let Some(old) = self.stmt.replace(handle) {
                    if let Err(e) = self.engine.free_statement(old).await {
                        warn!(error = %e, "failed to free statement");
                    }
                }
                Some(self.fetch_all(ctx, block, handle).await?)
            }
            None => None,
        };

        Ok(PlsqlResult { outputs, cursor })
    }

    // =========================================================================
    // LOBs
    // =========================================================================

    /// Run a statement whose positional binds `:1..:N` are LOBs returned
    /// into, writing `values[i]` into every LOB returned for bind `i + 1`.
    pub async fn lob_dml<V: AsRef<[u8]>>(&mut self, sql: &str, kind: LobKind, values: &[V]) -> Result<u64> {
        let sources = values.iter().map(|v| LobSource::bytes(v)).collect();
        self.flush().await;
        let result = self.run_lob_dml("lob_dml", sql, kind, sources).await;
        self.release_pool().await;
        result
    }

    /// Like [`Connection::lob_dml`] with the content read from files
    pub async fn lob_dml_file<P: AsRef<Path>>(&mut self, sql: &str, kind: LobKind, paths: &[P]) -> Result<u64> {
        let sources = paths.iter().map(|p| LobSource::file(p)).collect();
        self.flush().await;
        let result = self.run_lob_dml("lob_dml_file", sql, kind, sources).await;
        self.release_pool().await;
        result
    }

    /// Like [`Connection::lob_dml`] with any mix of sources, including
    /// caller streams of declared length
    pub async fn lob_dml_sources(&mut self, sql: &str, kind: LobKind, sources: Vec<LobSource>) -> Result<u64> {
        self.flush().await;
        let result = self.run_lob_dml("lob_dml_sources", sql, kind, sources).await;
        self.release_pool().await;
        result
    }

    async fn run_lob_dml(
        &mut self,
        ctx: &'static str,
        sql: &str,
        kind: LobKind,
        sources: Vec<LobSource>,
    ) -> Result<u64> {
        for source in &sources {
            source.check_access().await?;
        }
        let pool = self.install_pool(sources.len());
        for (index, slot) in pool.iter_mut().enumerate() {
            let name = (index + 1).to_string();
            slot.bind_data_at_exec(&name, kind.oracle_type(), InSource::Null, OutSink::Descriptors);
        }

        let stmt = self.prepare(ctx, sql).await?;
        self.bind_pool(ctx, sql, stmt).await?;
        if self.config.debug {
            debug!(sql = %self.config.loggable(sql), lobs = sources.len(), "lob dml");
        }
        self.execute(ctx, sql, stmt, 1, false, ErrorPath::Script).await?;

        let targets = sources.into_iter().enumerate().collect();
        self.write_returned_lobs(ctx, sql, targets).await?;
        self.finish_lob_dml(ctx, sql, stmt).await
    }

    /// Run a statement with named binds where the binds listed in
    /// `lob_binds` are LOBs returned into and filled with their bind value.
    pub async fn lob_dml_bind(
        &mut self,
        sql: &str,
        kind: LobKind,
        lob_binds: &[&str],
        binds: &Binds,
    ) -> Result<u64> {
        self.flush().await;
        let result = self
            .run_lob_dml_bind("lob_dml_bind", sql, kind, lob_binds, binds, false)
            .await;
        self.release_pool().await;
        result
    }

    /// Like [`Connection::lob_dml_bind`], where each LOB bind's value is the
    /// path of the file holding its content
    pub async fn lob_dml_file_bind(
        &mut self,
        sql: &str,
        kind: LobKind,
        lob_binds: &[&str],
        binds: &Binds,
    ) -> Result<u64> {
        self.flush().await;
        let result = self
            .run_lob_dml_bind("lob_dml_file_bind", sql, kind, lob_binds, binds, true)
            .await;
        self.release_pool().await;
        result
    }

    async fn run_lob_dml_bind(
        &mut self,
        ctx: &'static str,
        sql: &str,
        kind: LobKind,
        lob_binds: &[&str],
        binds: &Binds,
        files: bool,
    ) -> Result<u64> {
        let lob_binds: Vec<&str> = lob_binds.iter().map(|n| n.trim_start_matches(':')).collect();
        let names = scan_bind_variables(sql);
        let pool = self.install_pool(names.len());

        let mut targets = Vec::new();
        let mut matched: Vec<&str> = Vec::new();
        for (index, (slot, name)) in pool.iter_mut().zip(&names).enumerate() {
            let text = name.bind_text();
            let value = binds.resolve(name)?;
            match lob_binds.iter().find(|n| **n == text) {
                Some(&lob_name) => {
                    slot.bind_data_at_exec(&text, kind.oracle_type(), InSource::Null, OutSink::Descriptors);
                    let value = value.unwrap_or_default();
                    let source = if files {
                        LobSource::file(String::from_utf8_lossy(&value).into_owned())
                    } else {
                        LobSource::Bytes(value)
                    };
                    targets.push((index, source));
                    if !matched.contains(&lob_name) {
                        matched.push(lob_name);
                    }
                }
                None => {
                    check_size(name, value.as_ref())?;
                    slot.bind_inline(&text, value.as_deref());
                }
            }
        }
        if matched.len() != lob_binds.len() {
            return Err(Error::LobCountMismatch {
                binds: matched.len(),
                sources: lob_binds.len(),
            });
        }
        for (_, source) in &targets {
            source.check_access().await?;
        }

        let stmt = self.prepare(ctx, sql).await?;
        self.bind_pool(ctx, sql, stmt).await?;
        if self.config.debug {
            debug!(sql = %self.config.loggable(sql), lobs = targets.len(), binds = names.len(), "lob dml");
        }
        self.execute(ctx, sql, stmt, 1, false, ErrorPath::Script).await?;

        self.write_returned_lobs(ctx, sql, targets).await?;
        self.finish_lob_dml(ctx, sql, stmt).await
    }

    /// Stream each source into every descriptor returned for its slot
    async fn write_returned_lobs(
        &mut self,
        ctx: &'static str,
        sql: &str,
        targets: Vec<(usize, LobSource)>,
    ) -> Result<()> {
        let streamer = self.streamer();
        for (index, source) in targets {
            let lobs = pool_slot(&mut self.pool, index)?.lobs().to_vec();
            for lob in lobs {
                let written = streamer.write_source(&mut self.engine, lob, &source).await;
                match written {
                    Ok(transfer) => {
                        if self.config.debug {
                            debug!(slot = index + 1, bytes = transfer.bytes(), "lob written");
                        }
                    }
                    Err(e) => return Err(self.write_failed(ctx, sql, e).await),
                }
            }
        }
        Ok(())
    }

    async fn finish_lob_dml(&mut self, ctx: &'static str, sql: &str, stmt: StatementHandle) -> Result<u64> {
        if self.mode == Mode::Autocommit {
            let result = completed(self.engine.commit().await);
            self.check(ctx, "commit", Some(sql), result).await?;
        }
        self.rows_processed(ctx, sql, stmt).await
    }

    /// Write the LOB in the first column of the query's first row to a
    /// file. NULL or empty LOBs create no file.
    pub async fn lob_get_file(&mut self, sql: &str, binds: &Binds, path: impl AsRef<Path>) -> Result<LobTransfer> {
        self.flush().await;
        let result = self.run_lob_get_file("lob_get_file", sql, binds, path.as_ref()).await;
        self.release_pool().await;
        result
    }

    async fn run_lob_get_file(
        &mut self,
        ctx: &'static str,
        sql: &str,
        binds: &Binds,
        path: &Path,
    ) -> Result<LobTransfer> {
        let (lob, length) = match self.first_lob(ctx, sql, binds).await? {
            Some(found) => found,
            None => return Ok(LobTransfer::Null),
        };
        let mut file = tokio::fs::File::create(path).await?;
        self.stream_lob(ctx, sql, lob, length, &mut file).await
    }

    /// Stream the LOB in the first column of the query's first row to
    /// `sink`. A sink that disconnects part way stops the transfer without
    /// error.
    pub async fn write_lob<W>(&mut self, sql: &str, binds: &Binds, sink: &mut W) -> Result<LobTransfer>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.flush().await;
        let result = self.run_write_lob("write_lob", sql, binds, sink).await;
        self.release_pool().await;
        result
    }

    async fn run_write_lob<W>(&mut self, ctx: &'static str, sql: &str, binds: &Binds, sink: &mut W) -> Result<LobTransfer>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        match self.first_lob(ctx, sql, binds).await? {
            Some((lob, length)) => self.stream_lob(ctx, sql, lob, length, sink).await,
            None => Ok(LobTransfer::Null),
        }
    }

    /// Run a query and position on the LOB in its first row's first column.
    ///
    /// Returns `None` for NULL and zero-length LOBs.
    async fn first_lob(
        &mut self,
        ctx: &'static str,
        sql: &str,
        binds: &Binds,
    ) -> Result<Option<(LobLocator, u64)>> {
        let names = scan_bind_variables(sql);
        self.stage_inline(&names, binds)?;

        let stmt = self.prepare(ctx, sql).await?;
        let kind = self.engine.statement_type(stmt).await;
        if !self.check(ctx, "statement_type", Some(sql), kind).await?.is_query() {
            return Err(Error::NotAQuery);
        }
        self.bind_pool(ctx, sql, stmt).await?;
        self.execute(ctx, sql, stmt, 0, false, ErrorPath::Script).await?;
        self.release_pool().await;

        let describe = self.engine.describe_column(stmt, 1).await;
        let describe = self.check(ctx, "describe_column", Some(sql), describe).await?;
        if !describe.ty.is_lob() {
            return Err(Error::Internal(format!(
                "column `{}' is not a LOB ({:?})",
                describe.name.to_lowercase(),
                describe.ty
            )));
        }
        let (expansion, lob_size) = (self.config.char_expansion, self.config.lob_buffer_size);
        let pool = self.install_pool(1);
        if let Some(slot) = pool.slot_mut(0) {
            slot.describe(1, &describe.name, describe.ty, describe.size, expansion, lob_size);
        }
        let lob = self.engine.alloc_lob().await;
        let lob = self.check(ctx, "alloc_lob", Some(sql), lob).await?;
        pool_slot(&mut self.pool, 0)?.set_locator(lob);
        let result = completed(self.engine.define(stmt, 1, Define::Locator(lob)).await);
        self.check(ctx, "define", Some(sql), result).await?;

        let step = self.engine.fetch(stmt).await;
        if self.check_step(ctx, "fetch", sql, step, ErrorPath::Script).await? == Step::NoData {
            return Err(Error::NoRows);
        }
        let read = self.engine.column_value(stmt, 1, &mut []).await;
        let read = self.check(ctx, "column_value", Some(sql), read).await?;
        if Indicator::from_raw(read.indicator).is_null() {
            return Ok(None);
        }

        let length = self.engine.lob_length(lob).await;
        let length = self.check(ctx, "lob_length", Some(sql), length).await?;
        if self.config.debug {
            debug!(sql = %self.config.loggable(sql), length, "lob located");
        }
        Ok((length > 0).then_some((lob, length)))
    }

    async fn stream_lob<W>(
        &mut self,
        ctx: &'static str,
        sql: &str,
        lob: LobLocator,
        length: u64,
        sink: &mut W,
    ) -> Result<LobTransfer>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let streamer = self.streamer();
        match streamer.read_into(&mut self.engine, lob, length, sink).await {
            Ok(transfer) => Ok(transfer),
            Err(TransferError::Driver(e)) if e.is_streaming_error() => {
                error!(context = ctx, error = %e, "LOB read aborted, reopening session");
                self.release_pool().await;
                if let Err(reopen) = self.reopen().await {
                    warn!(error = %reopen, "reopen failed");
                }
                Err(e)
            }
            Err(e) => Err(self.transfer_failed(ctx, sql, e, ErrorPath::Script).await),
        }
    }

    // =========================================================================
    // Request plumbing
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    fn commit_on_success(&self) -> bool {
        self.mode == Mode::Autocommit
    }

    fn streamer(&self) -> LobStreamer {
        LobStreamer::new(self.config.lob_buffer_size, self.config.debug)
    }

    fn install_pool(&mut self, n: usize) -> &mut BufferPool {
        self.pools_allocated += 1;
        self.pool.insert(BufferPool::allocate(n))
    }

    async fn release_pool(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(&mut self.engine).await;
            self.pools_released += 1;
        }
    }

    /// Allocate one slot per bind reference and copy in its value
    fn stage_inline(&mut self, names: &[BindName], binds: &Binds) -> Result<()> {
        let pool = self.install_pool(names.len());
        let values = binds.resolve_all(names)?;
        for ((slot, name), value) in pool.iter_mut().zip(names).zip(values) {
            slot.bind_inline(&name.bind_text(), value.as_deref());
        }
        Ok(())
    }

    async fn prepare(&mut self, ctx: &'static str, sql: &str) -> Result<StatementHandle> {
        self.ensure_open()?;
        let stmt = self.engine.prepare(sql).await;
        let stmt = self.check(ctx, "prepare", Some(sql), stmt).await?;
        self.stmt = Some(stmt);
        Ok(stmt)
    }

    async fn expect_dml(&mut self, ctx: &'static str, sql: &str, stmt: StatementHandle) -> Result<()> {
        let kind = self.engine.statement_type(stmt).await;
        if self.check(ctx, "statement_type", Some(sql), kind).await?.is_dml() {
            Ok(())
        } else {
            Err(Error::NotDml)
        }
    }

    /// Register every staged slot with the engine
    async fn bind_pool(&mut self, ctx: &'static str, sql: &str, stmt: StatementHandle) -> Result<()> {
        let count = self.pool.as_ref().map_or(0, BufferPool::len);
        for index in 0..count {
            let spec = bind_spec(pool_slot(&mut self.pool, index)?)?;
            let handle = self.engine.bind(stmt, spec).await;
            let handle = self.check(ctx, "bind", Some(sql), handle).await?;
            pool_slot(&mut self.pool, index)?.set_bind(handle);
        }
        Ok(())
    }

    async fn execute(
        &mut self,
        ctx: &'static str,
        sql: &str,
        stmt: StatementHandle,
        iters: u32,
        commit: bool,
        path: ErrorPath,
    ) -> Result<Step> {
        let step = self.engine.execute(stmt, iters, commit).await;
        let step = self.check_step(ctx, "execute", sql, step, path).await?;
        self.drive(ctx, sql, stmt, step, path).await
    }

    /// Answer piece requests against the current pool
    async fn drive(
        &mut self,
        ctx: &'static str,
        sql: &str,
        stmt: StatementHandle,
        step: Step,
        path: ErrorPath,
    ) -> Result<Step> {
        if !matches!(step, Step::NeedData(_)) {
            return Ok(step);
        }
        let mut empty = BufferPool::default();
        let pool = self.pool.as_mut().unwrap_or(&mut empty);
        match piecewise::drive(&mut self.engine, stmt, pool, step, self.config.debug).await {
            Ok(step) => Ok(step),
            Err(e) => Err(self.transfer_failed(ctx, sql, e, path).await),
        }
    }

    async fn rows_processed(&mut self, ctx: &'static str, sql: &str, stmt: StatementHandle) -> Result<u64> {
        let count = self.engine.row_count(stmt).await;
        self.check(ctx, "row_count", Some(sql), count).await
    }

    // =========================================================================
    // Error handling
    // =========================================================================

    fn diagnostic(&self, ctx: &str, call: &str, sql: Option<&str>, error: &EngineError) -> Error {
        Error::OracleError {
            code: error.code,
            message: format_diagnostic(ctx, call, error, sql, self.config.max_string_log_length),
        }
    }

    /// Check a native call on the driver path.
    ///
    /// Calls without a value pass through [`completed`] first; a
    /// value-returning call that reports only information has broken the
    /// engine contract.
    async fn check<T>(&mut self, ctx: &str, call: &str, sql: Option<&str>, result: EngineResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if e.is_info() => {
                error!(context = ctx, call, error = %e, "success with info but no value");
                Err(Error::Internal(format!("`{} ()' returned no value: {}", call, e)))
            }
            Err(e) => Err(self.fail(ctx, call, sql, e, ErrorPath::Driver).await),
        }
    }

    /// Check an execute or fetch; ignorable failures count as completion
    async fn check_step(
        &mut self,
        ctx: &str,
        call: &str,
        sql: &str,
        result: EngineResult<Step>,
        path: ErrorPath,
    ) -> Result<Step> {
        match result {
            Ok(step) => Ok(step),
            Err(e) if classify_error(&e, path) == Recovery::Ignore => {
                if self.config.debug {
                    debug!(context = ctx, call, code = ?e.code, "ignoring engine status");
                }
                Ok(Step::Complete)
            }
            Err(e) => Err(self.fail(ctx, call, Some(sql), e, path).await),
        }
    }

    /// Apply the recovery policy for a failed call and build its error
    async fn fail(&mut self, ctx: &str, call: &str, sql: Option<&str>, error: EngineError, path: ErrorPath) -> Error {
        let err = self.diagnostic(ctx, call, sql, &error);
        error!(context = ctx, call, code = ?error.code, "{}", err);
        match classify_error(&error, path) {
            Recovery::Reconnect => {
                warn!(code = ?error.code, "session unusable, reopening");
                self.release_pool().await;
                if let Err(e) = self.reopen().await {
                    warn!(error = %e, "reopen failed");
                }
            }
            Recovery::Disconnect => {
                warn!(code = ?error.code, "server unavailable, closing session");
                self.release_pool().await;
                if let Err(e) = self.close().await {
                    warn!(error = %e, "close failed");
                }
            }
            Recovery::Ignore | Recovery::Surface => {}
        }
        err
    }

    async fn transfer_failed(&mut self, ctx: &str, sql: &str, error: TransferError, path: ErrorPath) -> Error {
        match error {
            TransferError::Engine { call, error } => self.fail(ctx, call, Some(sql), error, path).await,
            TransferError::Driver(e) => {
                error!(context = ctx, error = %e, "piecewise transfer failed");
                e
            }
        }
    }

    /// A failed LOB write aborts the statement's open transaction
    async fn write_failed(&mut self, ctx: &str, sql: &str, error: TransferError) -> Error {
        let err = self.transfer_failed(ctx, sql, error, ErrorPath::Script).await;
        if err.is_streaming_error() && self.mode == Mode::Transaction && self.connected {
            warn!(context = ctx, "LOB write aborted, rolling back");
            if let Err(e) = self.engine.rollback().await {
                warn!(error = %e, "rollback failed");
            }
        }
        err
    }
}
