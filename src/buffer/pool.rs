//! Per-statement slot pool

use tracing::warn;

use crate::engine::{BindHandle, Engine};

use super::slot::ColumnSlot;

/// Every slot of one statement execution, allocated and released together.
///
/// A pool is sized once to the statement's column or parameter count.
/// Dropping a pool frees its buffers, but engine-owned descriptors and
/// cursors are only returned to the engine by [`BufferPool::release`].
#[derive(Debug, Default)]
pub struct BufferPool {
    slots: Vec<ColumnSlot>,
}

impl BufferPool {
    /// Allocate `n` empty, zero-initialized slots
    pub fn allocate(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| ColumnSlot::empty()).collect(),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if the pool has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot by index
    pub fn slot(&self, index: usize) -> Option<&ColumnSlot> {
        self.slots.get(index)
    }

    /// Mutable slot by index
    pub fn slot_mut(&mut self, index: usize) -> Option<&mut ColumnSlot> {
        self.slots.get_mut(index)
    }

    /// Iterate over the slots
    pub fn iter(&self) -> std::slice::Iter<'_, ColumnSlot> {
        self.slots.iter()
    }

    /// Iterate mutably over the slots
    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, ColumnSlot> {
        self.slots.iter_mut()
    }

    /// Index of the slot registered under a bind handle
    pub fn index_of_bind(&self, bind: BindHandle) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.bind_handle() == Some(bind))
    }

    /// Index of the slot defined at a 1-based column position
    pub fn index_of_define(&self, position: usize) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.bind_handle().is_none() && slot.position() == position)
    }

    /// Free every slot, returning descriptors and cursors to the engine.
    ///
    /// Safe on partially populated pools: slots that never got past
    /// allocation hold nothing to return. Engine failures while freeing are
    /// logged and do not stop the remaining slots from being released.
    pub async fn release<E: Engine + ?Sized>(mut self, engine: &mut E) {
        for slot in self.slots.iter_mut() {
            let (lobs, cursor) = slot.take_engine_resources();
            for lob in lobs {
                if let Err(e) = engine.free_lob(lob).await {
                    warn!(slot = %slot.name, error = %e, "failed to free LOB descriptor");
                }
            }
            if let Some(cursor) = cursor {
                if let Err(e) = engine.free_statement(cursor).await {
                    warn!(slot = %slot.name, error = %e, "failed to free cursor");
                }
            }
        }
        self.slots.clear();
    }
}
