//! Bind and fetch buffers
//!
//! [`ColumnSlot`]s hold one column or parameter each; a [`BufferPool`]
//! owns every slot of one statement execution.

mod pool;
mod slot;

pub use pool::BufferPool;
pub use slot::{fetch_capacity, ColumnSlot, InSource, Indicator, OutSink, SlotBuffer, SlotType, Transfer};
