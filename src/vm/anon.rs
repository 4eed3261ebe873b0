//! Anonymous pages.
//!
//! A page with no backing file. Its first touch is a zeroed frame; once
//! evicted, the contents live in a swap slot until the next fault brings
//! them back and releases the slot.

use crate::disk::Disk;
use crate::error::Result;
use crate::param::PGSIZE;
use crate::vm::swap::{SwapSlot, SwapTable};

pub struct AnonPage {
    /// Slot holding the saved contents while the page is not resident.
    pub slot: Option<SwapSlot>,
}

impl AnonPage {
    pub fn new() -> Self {
        Self { slot: None }
    }

    /// Fills `frame` for a fault-in. Without a slot the zeroed frame from
    /// the allocator is already the page's contents.
    pub fn swap_in<D: Disk>(&mut self, swap: &mut SwapTable<D>, frame: &mut [u8; PGSIZE]) {
        if let Some(slot) = self.slot.take() {
            swap.read(slot, frame);
            swap.free(slot);
        }
    }

    /// Saves `frame` into a fresh slot.
    pub fn swap_out<D: Disk>(&mut self, swap: &mut SwapTable<D>, frame: &[u8; PGSIZE]) -> Result<()> {
        let slot = swap.alloc()?;
        swap.write(slot, frame);
        self.slot = Some(slot);
        Ok(())
    }

    /// Releases the slot, if the page died while swapped out.
    pub fn destroy<D: Disk>(&mut self, swap: &mut SwapTable<D>) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }
}
