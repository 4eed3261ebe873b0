//! Per-process page table.
//!
//! Software model of the MMU-visible mapping: page-aligned VA to frame plus
//! writable/accessed/dirty bits. The fault handler consults the SPT, not
//! this table; this table is what `copy_in`/`copy_out` and eviction read,
//! the way hardware walks would.

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::memlayout::pg_round_down;
use crate::vm::frame::FrameId;

bitflags! {
    pub struct PteFlags: u32 {
        const W = 1 << 0;
        const A = 1 << 1;
        const D = 1 << 2;
    }
}

#[derive(Clone, Copy)]
pub struct Pte {
    pub frame: FrameId,
    pub flags: PteFlags,
}

pub struct PageTable {
    map: BTreeMap<usize, Pte>,
}

impl PageTable {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Installs `va -> frame`. Fails when `va` is already mapped.
    pub fn set_page(&mut self, va: usize, frame: FrameId, writable: bool) -> bool {
        let va = pg_round_down(va);
        if self.map.contains_key(&va) {
            return false;
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::W;
        }
        let _ = self.map.insert(va, Pte { frame, flags });
        true
    }

    pub fn clear_page(&mut self, va: usize) {
        let _ = self.map.remove(&pg_round_down(va));
    }

    pub fn get(&self, va: usize) -> Option<&Pte> {
        self.map.get(&pg_round_down(va))
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.get(va).is_some()
    }

    pub fn is_dirty(&self, va: usize) -> bool {
        self.get(va).map_or(false, |pte| pte.flags.contains(PteFlags::D))
    }

    pub fn set_dirty(&mut self, va: usize, dirty: bool) {
        if let Some(pte) = self.map.get_mut(&pg_round_down(va)) {
            pte.flags.set(PteFlags::D, dirty);
        }
    }

    pub fn set_accessed(&mut self, va: usize) {
        if let Some(pte) = self.map.get_mut(&pg_round_down(va)) {
            pte.flags |= PteFlags::A;
        }
    }
}
