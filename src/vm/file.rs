//! File-backed pages and the mmap surface.
//!
//! Each mapped page remembers its own file reference, offset and byte
//! split. Fault-in reads `read_bytes` from the file and zeroes the tail;
//! eviction and unmap write the page back only when the mapping is writable
//! and the page table says the frame was dirtied.

use num_iter::range_step;

use crate::disk::Disk;
use crate::error::{KernelError, Result};
use crate::fs::{FileSystem, InodeRef};
use crate::memlayout::{is_kernel_vaddr, pg_ofs, pg_round_down, pg_round_up};
use crate::param::PGSIZE;
use crate::proc::{Pid, ProcTable};
use crate::vm::frame::FrameTable;
use crate::vm::swap::SwapTable;
use crate::vm::{destroy_page, Page, PageFlags, PageState, UninitKind};

pub struct FilePage {
    /// Private claim on the mapped inode; closed when the page dies.
    pub ip: InodeRef,
    pub offset: u32,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl FilePage {
    /// Fills `frame` from the file, zeroing the tail.
    pub fn swap_in<D: Disk>(&self, fs: &mut FileSystem<D>, frame: &mut [u8; PGSIZE]) {
        let n = fs.inode_read_at(&self.ip, &mut frame[..self.read_bytes], self.offset);
        frame[n..].fill(0);
    }

    /// Writes the resident bytes back to the file.
    pub fn write_back<D: Disk>(&self, fs: &mut FileSystem<D>, frame: &[u8; PGSIZE]) {
        let _ = fs.inode_write_at(&self.ip, &frame[..self.read_bytes], self.offset);
    }
}

/// Maps `length` bytes of the file behind `fd` at `addr`. Installs lazy
/// pages only; the first touch of each page reads the file. Returns `addr`.
pub(crate) fn mmap<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    pid: Pid,
    addr: usize,
    length: usize,
    writable: bool,
    fd: usize,
    offset: u32,
) -> Result<usize> {
    let total = pg_round_up(length);
    if addr == 0 || pg_ofs(addr) != 0 || length == 0 {
        return Err(KernelError::InvalidAddress);
    }
    if is_kernel_vaddr(addr) || is_kernel_vaddr(addr + total - 1) {
        return Err(KernelError::InvalidAddress);
    }
    if offset as usize % PGSIZE != 0 {
        return Err(KernelError::InvalidAddress);
    }

    let (sector, file_len) = {
        let proc = procs.get(pid)?;
        let file = proc.file(fd)?;
        let ip = file.inode();
        if fs.inode_is_dir(ip) {
            return Err(KernelError::InvalidHandle);
        }
        (ip.sector, fs.inode_len(ip))
    };
    if offset > file_len {
        return Err(KernelError::InvalidAddress);
    }

    let mut remaining = ((file_len - offset) as usize).min(length);
    let mut installed = 0;

    for va in range_step(addr, addr + total, PGSIZE) {
        let page_read = remaining.min(PGSIZE);
        let aux = FilePage {
            ip: fs.inode_open(sector)?,
            offset: offset + (va - addr) as u32,
            read_bytes: page_read,
            zero_bytes: PGSIZE - page_read,
        };
        let page = Page::new(va, writable, PageFlags::empty(), PageState::Uninit(UninitKind::File(aux)));

        let proc = procs.get_mut(pid)?;
        if let Err(page) = proc.spt.insert(page) {
            // The range collides with an existing mapping: take back the
            // pages installed so far and the reference held by this one.
            if let PageState::Uninit(UninitKind::File(aux)) = page.state {
                fs.inode_close(aux.ip);
            }
            for undo in range_step(addr, addr + installed, PGSIZE) {
                destroy_page(procs, frames, swap, fs, pid, undo)?;
            }
            return Err(KernelError::InvalidAddress);
        }
        installed += PGSIZE;
        remaining -= page_read;
    }

    log::trace!("mmap: pid {} mapped {:#x}..{:#x}", pid, addr, addr + total);
    Ok(addr)
}

/// Unmaps the contiguous run of file-backed pages starting at `addr`,
/// writing dirty ones back. Stops at the first page that is not
/// file-backed.
pub(crate) fn munmap<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    pid: Pid,
    addr: usize,
) -> Result<()> {
    let mut va = pg_round_down(addr);
    loop {
        let file_backed = procs.get(pid)?.spt.find(va).map(|page| {
            matches!(
                page.state,
                PageState::File(_) | PageState::Uninit(UninitKind::File(_))
            )
        });
        if file_backed != Some(true) {
            return Ok(());
        }
        destroy_page(procs, frames, swap, fs, pid, va)?;
        va += PGSIZE;
    }
}
