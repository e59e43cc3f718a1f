//! Piecewise transfer engine
//!
//! During execute and fetch the engine may stop and ask for data it could
//! not transfer up front: IN values of data-at-execute binds, descriptors
//! for returning LOB binds, space for OUT values and for LONG columns. Each
//! request arrives as a [`Step::NeedData`]; [`drive`] answers requests one
//! at a time from the owning slot until the engine reports something else.

use tracing::debug;

use crate::buffer::{BufferPool, ColumnSlot, InSource, Indicator, OutSink, Transfer};
use crate::constants::{Direction, Piece, MAX_DYNAMIC_BUFFER, PLSQL_BUFFER_SIZE};
use crate::engine::{
    Engine, EngineError, PieceRequest, PieceResponse, PieceTarget, Resumed, StatementHandle, Step,
};
use crate::error::Error;

/// Progress of one slot's piecewise transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    /// No piece transferred yet
    #[default]
    NotStarted,
    /// Some pieces transferred; `offset` bytes (or list elements) so far
    InProgress {
        /// Cumulative length transferred
        offset: usize,
    },
    /// The transfer is complete
    Done,
}

impl PieceState {
    /// State after transferring `amount` more in `piece`
    pub fn advance(self, amount: usize, piece: Piece) -> Self {
        if piece.is_final() {
            return PieceState::Done;
        }
        let offset = match self {
            PieceState::InProgress { offset } if !piece.is_initial() => offset,
            _ => 0,
        };
        PieceState::InProgress {
            offset: offset + amount,
        }
    }

    /// Cumulative amount transferred so far
    pub fn offset(&self) -> usize {
        match self {
            PieceState::InProgress { offset } => *offset,
            _ => 0,
        }
    }
}

/// Failure while driving piece requests
#[derive(Debug)]
pub enum TransferError {
    /// A native call failed
    Engine {
        /// Native call that failed
        call: &'static str,
        /// Engine error
        error: EngineError,
    },
    /// The driver rejected the request
    Driver(Error),
}

impl From<Error> for TransferError {
    fn from(e: Error) -> Self {
        TransferError::Driver(e)
    }
}

pub(crate) fn engine_err(call: &'static str) -> impl FnOnce(EngineError) -> TransferError {
    move |error| TransferError::Engine { call, error }
}

/// Answer piece requests until the engine reports completion or no data.
///
/// Every slot still in progress when the engine finishes is marked done.
pub async fn drive<E: Engine + ?Sized>(
    engine: &mut E,
    stmt: StatementHandle,
    pool: &mut BufferPool,
    mut step: Step,
    debug: bool,
) -> Result<Step, TransferError> {
    loop {
        let request = match step {
            Step::NeedData(request) => request,
            done => {
                for slot in pool.iter_mut() {
                    if matches!(slot.state(), PieceState::InProgress { .. }) {
                        slot.set_state(PieceState::Done);
                    }
                }
                return Ok(done);
            }
        };

        let index = match request.target {
            PieceTarget::Bind(bind) => pool.index_of_bind(bind),
            PieceTarget::Define(position) => pool.index_of_define(position),
        }
        .ok_or_else(|| {
            Error::Internal(format!("piece request for unknown target {:?}", request.target))
        })?;
        let slot = pool
            .slot_mut(index)
            .ok_or_else(|| Error::Internal(format!("slot {} missing from pool", index)))?;

        if debug {
            debug!(
                slot = %slot.name,
                direction = ?request.direction,
                iteration = request.iteration,
                index = request.index,
                piece = ?request.piece,
                "piece request"
            );
        }

        let resumed = answer(engine, stmt, slot, request).await?;
        step = resumed.step;
    }
}

async fn answer<E: Engine + ?Sized>(
    engine: &mut E,
    stmt: StatementHandle,
    slot: &mut ColumnSlot,
    request: PieceRequest,
) -> Result<Resumed, TransferError> {
    match (slot.transfer(), request.direction) {
        (Transfer::DataAtExec { input, .. }, Direction::In) => {
            supply(engine, stmt, slot, input, request).await
        }
        (Transfer::DataAtExec { output, .. }, Direction::Out) => match output {
            OutSink::Discard => discard(engine, stmt, request).await,
            OutSink::Descriptors => descriptor(engine, stmt, slot, request).await,
            OutSink::Receive => receive(engine, stmt, slot, request).await,
        },
        (Transfer::LongFetch, Direction::Out) => long_piece(engine, stmt, slot, request).await,
        (transfer, direction) => Err(Error::Internal(format!(
            "unexpected {:?} piece request for `{}' ({:?})",
            direction, slot.name, transfer
        ))
        .into()),
    }
}

fn expect_first_iteration(slot: &ColumnSlot, request: &PieceRequest) -> Result<(), Error> {
    if request.iteration != 0 {
        return Err(Error::Internal(format!(
            "iteration {} requested for non-array bind `{}'",
            request.iteration, slot.name
        )));
    }
    Ok(())
}

/// IN side: the whole value in a single piece
async fn supply<E: Engine + ?Sized>(
    engine: &mut E,
    stmt: StatementHandle,
    slot: &mut ColumnSlot,
    input: InSource,
    request: PieceRequest,
) -> Result<Resumed, TransferError> {
    let data = match input {
        InSource::Null => {
            expect_first_iteration(slot, &request)?;
            None
        }
        InSource::Value => {
            expect_first_iteration(slot, &request)?;
            slot.input().cloned()
        }
        InSource::ListElements => {
            let iteration = request.iteration as usize;
            slot.elements()
                .get(iteration)
                .ok_or_else(|| {
                    Error::Internal(format!(
                        "iteration {} beyond the {} values of `{}'",
                        iteration,
                        slot.elements().len(),
                        slot.name
                    ))
                })?
                .clone()
        }
    };

    let amount = data.as_ref().map_or(0, |d| d.len());
    let resumed = engine
        .respond(
            stmt,
            PieceResponse::Supply {
                data: data.as_deref(),
                piece: Piece::One,
            },
        )
        .await
        .map_err(engine_err("respond"))?;

    let state = match input {
        InSource::ListElements => PieceState::InProgress {
            offset: slot.state().offset() + 1,
        },
        _ => slot.state().advance(amount, Piece::One),
    };
    slot.set_state(state);
    Ok(resumed)
}

/// OUT side with no caller-visible value: always NULL, zero length
async fn discard<E: Engine + ?Sized>(
    engine: &mut E,
    stmt: StatementHandle,
    _request: PieceRequest,
) -> Result<Resumed, TransferError> {
    engine
        .respond(
            stmt,
            PieceResponse::Descriptor {
                lob: None,
                piece: Piece::One,
            },
        )
        .await
        .map_err(engine_err("respond"))
}

/// OUT side of a returning LOB bind.
///
/// The first request fixes the row count and allocates one descriptor per
/// returned row; later requests reuse them.
async fn descriptor<E: Engine + ?Sized>(
    engine: &mut E,
    stmt: StatementHandle,
    slot: &mut ColumnSlot,
    request: PieceRequest,
) -> Result<Resumed, TransferError> {
    expect_first_iteration(slot, &request)?;

    if slot.rows_returned().is_none() {
        let bind = slot
            .bind_handle()
            .ok_or_else(|| Error::Internal(format!("returning bind `{}' is not bound", slot.name)))?;
        let rows = engine
            .rows_returned(bind)
            .await
            .map_err(engine_err("rows_returned"))?;
        for _ in 0..rows {
            let lob = engine.alloc_lob().await.map_err(engine_err("alloc_lob"))?;
            slot.push_lob(lob);
        }
        slot.seal_lobs();
    }

    let index = request.index as usize;
    let lob = *slot.lobs().get(index).ok_or_else(|| {
        Error::Internal(format!(
            "row {} beyond the {} rows returned for `{}'",
            index,
            slot.lobs().len(),
            slot.name
        ))
    })?;

    let resumed = engine
        .respond(
            stmt,
            PieceResponse::Descriptor {
                lob: Some(lob),
                piece: Piece::One,
            },
        )
        .await
        .map_err(engine_err("respond"))?;
    slot.set_indicator(Indicator::NotNull);
    slot.set_state(PieceState::InProgress { offset: index + 1 });
    Ok(resumed)
}

/// OUT side of a dynamic bind: grow by a fixed step per piece
async fn receive<E: Engine + ?Sized>(
    engine: &mut E,
    stmt: StatementHandle,
    slot: &mut ColumnSlot,
    request: PieceRequest,
) -> Result<Resumed, TransferError> {
    expect_first_iteration(slot, &request)?;

    if request.piece.is_initial() {
        slot.buffer_mut().clear();
        slot.set_state(PieceState::NotStarted);
    }

    let capacity = slot.buffer().capacity();
    if capacity - slot.buffer().len() < PLSQL_BUFFER_SIZE {
        if capacity + PLSQL_BUFFER_SIZE > MAX_DYNAMIC_BUFFER {
            return Err(Error::ValueTooLarge {
                name: slot.name.clone(),
                len: capacity + PLSQL_BUFFER_SIZE,
                max: MAX_DYNAMIC_BUFFER,
            }
            .into());
        }
        slot.buffer_mut().grow_by(PLSQL_BUFFER_SIZE);
    }

    let resumed = engine
        .respond(
            stmt,
            PieceResponse::Receive {
                buf: slot.buffer_mut().spare_mut(),
                piece: request.piece,
            },
        )
        .await
        .map_err(engine_err("respond"))?;

    slot.buffer_mut().commit(resumed.written)?;
    slot.set_indicator(Indicator::from_raw(resumed.indicator));
    slot.set_state(slot.state().advance(resumed.written, Piece::Next));
    Ok(resumed)
}

/// One piece of a LONG column; doubles the buffer once it is over half full
async fn long_piece<E: Engine + ?Sized>(
    engine: &mut E,
    stmt: StatementHandle,
    slot: &mut ColumnSlot,
    request: PieceRequest,
) -> Result<Resumed, TransferError> {
    if request.piece.is_initial() {
        slot.buffer_mut().clear();
        slot.set_state(PieceState::NotStarted);
    }

    let resumed = engine
        .respond(
            stmt,
            PieceResponse::Receive {
                buf: slot.buffer_mut().spare_mut(),
                piece: request.piece,
            },
        )
        .await
        .map_err(engine_err("respond"))?;

    slot.buffer_mut().commit(resumed.written)?;
    slot.set_indicator(Indicator::from_raw(resumed.indicator));
    slot.set_state(slot.state().advance(resumed.written, Piece::Next));
    slot.buffer_mut().grow_if_half_full();
    Ok(resumed)
}
