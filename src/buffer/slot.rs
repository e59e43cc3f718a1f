//! Typed per-column / per-parameter slots
//!
//! A [`ColumnSlot`] represents one result column or one bound parameter for
//! the lifetime of a single statement execution. Its byte storage is a
//! [`SlotBuffer`], an owned buffer with an explicit capacity that can grow
//! during a piecewise transfer but never shrinks.

use bytes::{Bytes, BytesMut};

use crate::constants::{OracleType, NUMBER_STRING_SIZE, ROWID_STRING_SIZE, SLOT_SLACK};
use crate::engine::{BindHandle, LobLocator, StatementHandle};
use crate::error::{Error, Result};
use crate::piecewise::PieceState;

/// Owned, zero-initialized byte buffer with explicit capacity and length
#[derive(Debug, Default)]
pub struct SlotBuffer {
    /// Storage, always `capacity` bytes long
    data: BytesMut,
    /// Bytes of `data` holding the current value
    len: usize,
}

impl SlotBuffer {
    /// Create a zero-filled buffer of the given capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::zeroed(capacity),
            len: 0,
        }
    }

    /// Get the current length of the value in the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer holds no data
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get the capacity of the buffer
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Get the current value as a byte slice
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Writable space after the current value
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.data[len..]
    }

    /// Writable space for a value replacing the current one
    pub fn whole_mut(&mut self) -> &mut [u8] {
        self.len = 0;
        &mut self.data[..]
    }

    /// Record `n` bytes written into the spare space
    pub fn commit(&mut self, n: usize) -> Result<()> {
        let available = self.capacity() - self.len;
        if n > available {
            return Err(Error::Internal(format!(
                "slot overflow: {} bytes written into {} bytes of space",
                n, available
            )));
        }
        self.len += n;
        Ok(())
    }

    /// Replace the value, growing the buffer if it does not fit
    pub fn set(&mut self, value: &[u8]) {
        self.reserve_total(value.len());
        self.data[..value.len()].copy_from_slice(value);
        self.len = value.len();
    }

    /// Drop the current value, keeping capacity
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Grow to at least `capacity` bytes; never shrinks
    pub fn reserve_total(&mut self, capacity: usize) {
        if capacity > self.capacity() {
            self.data.resize(capacity, 0);
        }
    }

    /// Grow by `additional` bytes
    pub fn grow_by(&mut self, additional: usize) {
        let target = self.capacity() + additional;
        self.data.resize(target, 0);
    }

    /// Double the capacity when the value fills more than half of it.
    ///
    /// Returns whether the buffer grew.
    pub fn grow_if_half_full(&mut self) -> bool {
        let capacity = self.capacity();
        if self.len > capacity / 2 {
            self.data.resize((capacity * 2).max(1), 0);
            true
        } else {
            false
        }
    }

    /// Copy the current value out
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_slice())
    }
}

/// Null indicator of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Indicator {
    /// The slot holds a value
    #[default]
    NotNull,
    /// The slot holds NULL
    Null,
    /// The engine reported a truncation or conversion problem
    Error(i16),
}

impl Indicator {
    /// Decode a raw engine indicator
    pub fn from_raw(raw: i16) -> Self {
        match raw {
            0 => Indicator::NotNull,
            -1 => Indicator::Null,
            other => Indicator::Error(other),
        }
    }

    /// Check for NULL
    pub fn is_null(&self) -> bool {
        *self == Indicator::Null
    }
}

/// Type tag of a slot, decided once the column type is known
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotType {
    /// Fixed-width character data (and anything fetched as text)
    #[default]
    FixedString,
    /// NUMBER fetched in its string form
    NumericString,
    /// ROWID fetched in its string form
    RowId,
    /// LONG fetched piecewise into a growing buffer
    LongCharacter,
    /// CLOB addressed through a locator
    Clob,
    /// BLOB addressed through a locator
    Blob,
    /// REF CURSOR bind
    Cursor,
}

impl SlotType {
    /// Slot type for a described column or bind type
    pub fn for_oracle_type(ty: OracleType) -> Self {
        match ty {
            OracleType::Number => SlotType::NumericString,
            OracleType::Rowid | OracleType::RowidDescriptor => SlotType::RowId,
            OracleType::Long | OracleType::LongRaw => SlotType::LongCharacter,
            OracleType::Clob => SlotType::Clob,
            OracleType::Blob => SlotType::Blob,
            OracleType::Cursor => SlotType::Cursor,
            _ => SlotType::FixedString,
        }
    }

    /// Check for a LOB slot
    pub fn is_lob(&self) -> bool {
        matches!(self, SlotType::Clob | SlotType::Blob)
    }
}

/// Fetch-side capacity for a column.
///
/// `None` means no buffer is preallocated: LOBs only get a locator.
pub fn fetch_capacity(
    ty: OracleType,
    declared_size: usize,
    char_expansion: usize,
    lob_buffer_size: usize,
) -> Option<usize> {
    match SlotType::for_oracle_type(ty) {
        SlotType::Clob | SlotType::Blob => None,
        SlotType::RowId => Some(ROWID_STRING_SIZE + SLOT_SLACK),
        SlotType::NumericString => Some(NUMBER_STRING_SIZE + SLOT_SLACK),
        SlotType::LongCharacter => Some(lob_buffer_size.max(1)),
        SlotType::FixedString | SlotType::Cursor => {
            let base = if ty.is_binary() {
                declared_size * 2 + SLOT_SLACK
            } else {
                declared_size + SLOT_SLACK
            };
            Some(base * char_expansion.max(1))
        }
    }
}

/// Where a data-at-execute bind's IN data comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InSource {
    /// Always NULL
    Null,
    /// The slot's single value, in one piece
    Value,
    /// The element selected by the iteration index
    ListElements,
}

/// Where a data-at-execute bind's OUT data goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutSink {
    /// Accepted and dropped (reports NULL)
    Discard,
    /// Appended to the slot buffer, growing it per piece
    Receive,
    /// One engine descriptor per returned row
    Descriptors,
}

/// How a slot's data moves between the driver and the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transfer {
    /// Not attached to the statement yet
    #[default]
    Unattached,
    /// Bind value copied at bind time
    Inline,
    /// Bind value produced and consumed through piece requests
    DataAtExec {
        /// IN side
        input: InSource,
        /// OUT side
        output: OutSink,
    },
    /// REF CURSOR bind
    Cursor,
    /// Column copied into a fixed buffer on every fetch
    Define,
    /// Column delivered piecewise on every fetch
    LongFetch,
    /// Column fetched into a LOB locator
    Locator,
}

/// One result column or bound parameter
#[derive(Debug, Default)]
pub struct ColumnSlot {
    /// Column name (lowercased) or bind name
    pub name: String,
    slot_type: SlotType,
    oracle_type: Option<OracleType>,
    transfer: Transfer,
    declared_size: usize,
    buffer: SlotBuffer,
    indicator: Indicator,
    input: Option<Bytes>,
    elements: Vec<Option<Bytes>>,
    locator: Option<LobLocator>,
    lobs: Vec<LobLocator>,
    rows_returned: Option<usize>,
    cursor: Option<StatementHandle>,
    bind: Option<BindHandle>,
    position: usize,
    state: PieceState,
}

impl ColumnSlot {
    /// An empty slot with nothing allocated
    pub fn empty() -> Self {
        Self::default()
    }

    // =========================================================================
    // Fetch side
    // =========================================================================

    /// Type the slot for a described column and size its buffer.
    ///
    /// Column names are lowercased. LOB columns get no buffer; the caller
    /// attaches a locator with [`ColumnSlot::set_locator`].
    pub fn describe(
        &mut self,
        position: usize,
        name: &str,
        ty: OracleType,
        declared_size: usize,
        char_expansion: usize,
        lob_buffer_size: usize,
    ) {
        self.name = name.to_lowercase();
        self.position = position;
        self.oracle_type = Some(ty);
        self.slot_type = SlotType::for_oracle_type(ty);
        self.declared_size = declared_size;
        match fetch_capacity(ty, declared_size, char_expansion, lob_buffer_size) {
            Some(capacity) => {
                self.buffer = SlotBuffer::with_capacity(capacity);
                self.transfer = if self.slot_type == SlotType::LongCharacter {
                    Transfer::LongFetch
                } else {
                    Transfer::Define
                };
            }
            None => self.transfer = Transfer::Locator,
        }
    }

    /// 1-based define position
    pub fn position(&self) -> usize {
        self.position
    }

    // =========================================================================
    // Bind side
    // =========================================================================

    /// Type the slot as a bind transferring its value now
    pub fn bind_inline(&mut self, name: &str, value: Option<&[u8]>) {
        self.name = name.to_string();
        self.slot_type = SlotType::FixedString;
        self.oracle_type = Some(OracleType::Str);
        self.transfer = Transfer::Inline;
        match value {
            Some(value) => {
                self.buffer.reserve_total(value.len() + SLOT_SLACK);
                self.buffer.set(value);
                self.indicator = Indicator::NotNull;
            }
            None => {
                self.buffer.clear();
                self.indicator = Indicator::Null;
            }
        }
    }

    /// Type the slot as a data-at-execute bind
    pub fn bind_data_at_exec(
        &mut self,
        name: &str,
        ty: OracleType,
        input: InSource,
        output: OutSink,
    ) {
        self.name = name.to_string();
        self.slot_type = SlotType::for_oracle_type(ty);
        self.oracle_type = Some(ty);
        self.transfer = Transfer::DataAtExec { input, output };
    }

    /// Type the slot as a REF CURSOR bind
    pub fn bind_cursor(&mut self, name: &str) {
        self.name = name.to_string();
        self.slot_type = SlotType::Cursor;
        self.oracle_type = Some(OracleType::Cursor);
        self.transfer = Transfer::Cursor;
    }

    /// Set the IN value of a data-at-execute bind
    pub fn set_input(&mut self, value: Option<Bytes>) {
        self.input = value;
    }

    /// IN value of a data-at-execute bind
    pub fn input(&self) -> Option<&Bytes> {
        self.input.as_ref()
    }

    /// Set the per-iteration values of an array bind
    pub fn set_elements(&mut self, elements: Vec<Option<Bytes>>) {
        self.elements = elements;
    }

    /// Per-iteration values of an array bind
    pub fn elements(&self) -> &[Option<Bytes>] {
        &self.elements
    }

    /// Record the engine's bind handle
    pub fn set_bind(&mut self, bind: BindHandle) {
        self.bind = Some(bind);
    }

    /// Engine bind handle, once bound
    pub fn bind_handle(&self) -> Option<BindHandle> {
        self.bind
    }

    /// Attach the cursor statement of a REF CURSOR bind
    pub fn set_cursor(&mut self, cursor: StatementHandle) {
        self.cursor = Some(cursor);
    }

    /// Cursor statement of a REF CURSOR bind
    pub fn cursor(&self) -> Option<StatementHandle> {
        self.cursor
    }

    /// Take ownership of the cursor statement, so release will not free it
    pub fn take_cursor(&mut self) -> Option<StatementHandle> {
        self.cursor.take()
    }

    // =========================================================================
    // Shared
    // =========================================================================

    /// Type tag
    pub fn slot_type(&self) -> SlotType {
        self.slot_type
    }

    /// Reported or bound Oracle type
    pub fn oracle_type(&self) -> Option<OracleType> {
        self.oracle_type
    }

    /// Transfer mode
    pub fn transfer(&self) -> Transfer {
        self.transfer
    }

    /// Declared size reported by describe
    pub fn declared_size(&self) -> usize {
        self.declared_size
    }

    /// Byte buffer
    pub fn buffer(&self) -> &SlotBuffer {
        &self.buffer
    }

    /// Mutable byte buffer
    pub fn buffer_mut(&mut self) -> &mut SlotBuffer {
        &mut self.buffer
    }

    /// Null indicator
    pub fn indicator(&self) -> Indicator {
        self.indicator
    }

    /// Set the null indicator
    pub fn set_indicator(&mut self, indicator: Indicator) {
        self.indicator = indicator;
    }

    /// Piecewise transfer state
    pub fn state(&self) -> PieceState {
        self.state
    }

    /// Set the piecewise transfer state
    pub fn set_state(&mut self, state: PieceState) {
        self.state = state;
    }

    /// Attach the LOB descriptor of a LOB column
    pub fn set_locator(&mut self, lob: LobLocator) {
        self.locator = Some(lob);
    }

    /// LOB descriptor of a LOB column
    pub fn locator(&self) -> Option<LobLocator> {
        self.locator
    }

    /// Returning descriptors, allocated on the first OUT request
    pub fn lobs(&self) -> &[LobLocator] {
        &self.lobs
    }

    /// Row count fixed by the first OUT request of a returning bind
    pub fn rows_returned(&self) -> Option<usize> {
        self.rows_returned
    }

    /// Add one returning descriptor while the array is being built.
    ///
    /// Descriptors are recorded as they are allocated so a failure part way
    /// through still leaves every allocated one reachable by release.
    pub fn push_lob(&mut self, lob: LobLocator) {
        self.lobs.push(lob);
    }

    /// Fix the returned row count after the descriptors are in place
    pub fn seal_lobs(&mut self) {
        self.rows_returned = Some(self.lobs.len());
    }

    /// Current value as text, `None` for NULL
    pub fn text(&self) -> Option<String> {
        if self.indicator.is_null() {
            return None;
        }
        Some(String::from_utf8_lossy(self.buffer.as_slice()).into_owned())
    }

    /// Hand every engine-owned resource to the caller and reset the slot
    pub(crate) fn take_engine_resources(&mut self) -> (Vec<LobLocator>, Option<StatementHandle>) {
        let mut lobs = std::mem::take(&mut self.lobs);
        if let Some(lob) = self.locator.take() {
            lobs.push(lob);
        }
        self.rows_returned = None;
        (lobs, self.cursor.take())
    }
}
