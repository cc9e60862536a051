//! Object id allocation.
//!
//! The server keeps remote objects in a table indexed by small integers, so
//! ids are handed out densely: `reserve` always returns the smallest positive
//! id not currently in use.

use std::collections::BTreeSet;

use crate::error::{ClientError, Result};

/// Allocator for the ids of remote objects.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    reserved: BTreeSet<u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves and returns the smallest unused id (starting at 1).
    pub fn reserve(&mut self) -> u32 {
        // The set is ordered: the first position where id != position is the
        // first gap, otherwise the next id is one past the maximum.
        let mut id = 1;
        for &taken in &self.reserved {
            if taken != id {
                break;
            }
            id += 1;
        }
        self.reserved.insert(id);
        id
    }

    /// Returns `id` to the free pool.
    pub fn free(&mut self, id: u32) -> Result<()> {
        if self.reserved.remove(&id) {
            Ok(())
        } else {
            Err(ClientError::NotFound(id))
        }
    }

    /// Frees every id.
    pub fn clear(&mut self) {
        self.reserved.clear();
    }

    pub fn contains(&self, id: u32) -> bool {
        self.reserved.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }

    /// Reserved ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.reserved.iter().copied()
    }
}
