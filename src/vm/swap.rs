//! Swap slots.
//!
//! The swap disk is carved into page-sized slots, eight sectors each,
//! starting at sector 0. A bitmap tracks which slots hold a swapped-out
//! anonymous page; a slot is owned by at most one page at a time.

use bitmaps::Bitmap;

use crate::disk::Disk;
use crate::error::{KernelError, Result};
use crate::param::{NSWAP, PGSIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

pub type SwapSlot = usize;

pub struct SwapTable<D: Disk> {
    disk: D,
    used: Bitmap<NSWAP>,
    nslots: usize,
}

impl<D: Disk> SwapTable<D> {
    pub fn new(disk: D) -> Self {
        let nslots = (disk.size() as usize / SECTORS_PER_PAGE).min(NSWAP);
        let mut used = Bitmap::new();
        // Mask out slots past the device so the scan never hands them out.
        for i in nslots..NSWAP {
            used.set(i, true);
        }
        Self { disk, used, nslots }
    }

    pub fn nslots(&self) -> usize {
        self.nslots
    }

    pub fn used_count(&self) -> usize {
        (0..self.nslots).filter(|i| self.used.get(*i)).count()
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.used.get(slot)
    }

    /// Claims a free slot.
    pub fn alloc(&mut self) -> Result<SwapSlot> {
        let slot = self.used.first_false_index().ok_or(KernelError::SwapFull)?;
        self.used.set(slot, true);
        log::trace!("swap: slot {} out", slot);
        Ok(slot)
    }

    pub fn free(&mut self, slot: SwapSlot) {
        debug_assert!(self.used.get(slot), "swap free: slot not in use");
        self.used.set(slot, false);
    }

    /// Writes a page into `slot`.
    pub fn write(&mut self, slot: SwapSlot, data: &[u8; PGSIZE]) {
        let base = (slot * SECTORS_PER_PAGE) as u32;
        for i in 0..SECTORS_PER_PAGE {
            let chunk = &data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE];
            let mut buf = [0u8; SECTOR_SIZE];
            buf.copy_from_slice(chunk);
            self.disk.write(base + i as u32, &buf);
        }
    }

    /// Reads the page saved in `slot` without releasing it.
    pub fn read(&mut self, slot: SwapSlot, data: &mut [u8; PGSIZE]) {
        let base = (slot * SECTORS_PER_PAGE) as u32;
        let mut buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            self.disk.read(base + i as u32, &mut buf);
            data[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&buf);
        }
    }
}
