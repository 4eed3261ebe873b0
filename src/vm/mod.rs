//! Demand-paged virtual memory.
//!
//! Every user page is described by a `Page` in the owning process's
//! supplemental page table. A page starts `Uninit` and is materialized on
//! first touch: the fault handler claims a frame (evicting if the pool is
//! full), dispatches `swap_in` to the variant, and installs the mapping.
//!
//! The variants:
//!   + `Uninit`: not yet touched; holds what the first touch needs.
//!   + `Anon`: zero-filled memory, saved to a swap slot while not resident.
//!   + `File`: a window onto a file, written back when dirty.
//!
//! The entry points take every table they may touch as explicit arguments
//! (process table, frame table, swap table, file system); the kernel facade
//! acquires the locks in that order and threads the guards down, so
//! eviction never re-enters a lock it already holds.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use bitflags::bitflags;
use num_iter::range_step;

use crate::disk::Disk;
use crate::error::{KernelError, Result};
use crate::fs::FileSystem;
use crate::memlayout::{is_kernel_vaddr, pg_round_down, STACK_LIMIT, USER_STACK};
use crate::param::PGSIZE;
use crate::proc::{Pid, ProcTable, Process};

pub mod anon;
pub mod file;
pub mod frame;
pub mod pagetable;
pub mod swap;

pub use anon::AnonPage;
pub use file::FilePage;
pub use frame::{FrameId, FrameTable};
pub use pagetable::{PageTable, PteFlags};
pub use swap::{SwapSlot, SwapTable};

pub(crate) use file::{mmap, munmap};

bitflags! {
    /// Descriptor markers.
    pub struct PageFlags: u32 {
        /// Stack page; never an eviction victim.
        const STACK = 1 << 3;
    }
}

/// What the first touch of an `Uninit` page turns it into.
pub enum UninitKind {
    Anon,
    File(FilePage),
}

pub enum PageState {
    Uninit(UninitKind),
    Anon(AnonPage),
    File(FilePage),
}

/// Supplemental page table entry.
pub struct Page {
    pub va: usize,
    pub writable: bool,
    pub flags: PageFlags,
    pub frame: Option<FrameId>,
    pub state: PageState,
}

impl Page {
    pub fn new(va: usize, writable: bool, flags: PageFlags, state: PageState) -> Self {
        Self {
            va: pg_round_down(va),
            writable,
            flags,
            frame: None,
            state,
        }
    }
}

/// Per-process map from page-aligned VA to page descriptor.
pub struct Spt {
    pages: BTreeMap<usize, Page>,
}

impl Spt {
    pub fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    pub fn find(&self, va: usize) -> Option<&Page> {
        self.pages.get(&pg_round_down(va))
    }

    pub fn find_mut(&mut self, va: usize) -> Option<&mut Page> {
        self.pages.get_mut(&pg_round_down(va))
    }

    /// Registers `page`; hands it back when the VA is taken.
    pub fn insert(&mut self, page: Page) -> core::result::Result<(), Page> {
        if self.pages.contains_key(&page.va) {
            return Err(page);
        }
        let _ = self.pages.insert(page.va, page);
        Ok(())
    }

    fn remove(&mut self, va: usize) -> Option<Page> {
        self.pages.remove(&pg_round_down(va))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

/// Registers a lazy page. The caller still owns nothing on failure: a
/// file-backed kind travels back out through the error for cleanup.
pub(crate) fn alloc_page(
    procs: &mut ProcTable,
    pid: Pid,
    kind: UninitKind,
    va: usize,
    writable: bool,
    flags: PageFlags,
) -> core::result::Result<(), Page> {
    let page = Page::new(va, writable, flags, PageState::Uninit(kind));
    match procs.get_mut(pid) {
        Ok(proc) => proc.spt.insert(page),
        Err(_) => Err(page),
    }
}

/// Claims a frame for the page at `va` and fills it: first touch for
/// `Uninit`, swap-in for `Anon`, file read for `File`. Fails when the page
/// is missing or already resident.
pub(crate) fn claim_page<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    pid: Pid,
    va: usize,
) -> Result<()> {
    let va = pg_round_down(va);
    {
        let proc = procs.get(pid)?;
        let page = proc.spt.find(va).ok_or(KernelError::InvalidAddress)?;
        if page.frame.is_some() {
            return Err(KernelError::InvalidAddress);
        }
    }

    let frame = get_frame(procs, frames, swap, fs)?;
    frames.bind(frame, pid, va);

    let proc = procs.get_mut(pid)?;
    let Process { spt, pagetable, .. } = proc;
    let page = spt.find_mut(va).expect("claim: page vanished");
    page.frame = Some(frame);
    let mapped = pagetable.set_page(va, frame, page.writable);
    debug_assert!(mapped, "claim: stale mapping");

    let materialized = match &mut page.state {
        PageState::Uninit(kind) => {
            let kind = core::mem::replace(kind, UninitKind::Anon);
            match kind {
                // The allocator hands frames out zeroed; that is the
                // anonymous page's initial contents.
                UninitKind::Anon => Some(PageState::Anon(AnonPage::new())),
                UninitKind::File(aux) => {
                    aux.swap_in(fs, frames.data_mut(frame));
                    Some(PageState::File(aux))
                }
            }
        }
        PageState::Anon(anon) => {
            anon.swap_in(swap, frames.data_mut(frame));
            None
        }
        PageState::File(fp) => {
            fp.swap_in(fs, frames.data_mut(frame));
            None
        }
    };
    if let Some(state) = materialized {
        page.state = state;
    }
    Ok(())
}

/// A zeroed frame, evicting if the pool is full.
fn get_frame<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
) -> Result<FrameId> {
    if let Some(id) = frames.try_alloc() {
        return Ok(id);
    }
    evict(procs, frames, swap, fs)
}

/// Picks the eviction victim FIFO-first, skipping stack pages, swaps it
/// out, and returns its frame zeroed and unbound.
fn evict<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
) -> Result<FrameId> {
    let mut victim = None;
    for id in frames.fifo_iter() {
        if let Some((pid, va)) = frames.page_of(id) {
            let stack = procs
                .get(pid)
                .ok()
                .and_then(|p| p.spt.find(va))
                .map_or(false, |page| page.flags.contains(PageFlags::STACK));
            if !stack {
                victim = Some((id, pid, va));
                break;
            }
        }
    }
    let (id, pid, va) = victim.ok_or(KernelError::OutOfMemory)?;

    log::trace!("evict: frame {} (pid {}, va {:#x})", id, pid, va);
    swap_out_page(procs, frames, swap, fs, pid, va)?;
    frames.requeue(id);
    Ok(id)
}

/// Dispatches the victim's `swap_out`: anonymous contents to a swap slot,
/// dirty file windows back to the file. Clears the hardware mapping and
/// detaches the frame.
fn swap_out_page<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    pid: Pid,
    va: usize,
) -> Result<()> {
    let proc = procs.get_mut(pid)?;
    let Process { spt, pagetable, .. } = proc;
    let page = spt.find_mut(va).ok_or(KernelError::InvalidAddress)?;
    let frame = page.frame.ok_or(KernelError::InvalidAddress)?;
    let writable = page.writable;

    match &mut page.state {
        PageState::Anon(anon) => anon.swap_out(swap, frames.data(frame))?,
        PageState::File(fp) => {
            if writable && pagetable.is_dirty(va) {
                fp.write_back(fs, frames.data(frame));
                pagetable.set_dirty(va, false);
            }
        }
        PageState::Uninit(_) => unreachable!("swap_out: uninit page is resident"),
    }

    pagetable.clear_page(va);
    page.frame = None;
    frames.unbind(frame);
    Ok(())
}

/// Removes the page at `va` from the SPT and tears it down: dirty
/// write-back for file pages, slot release for swapped anonymous pages,
/// frame back to the pool.
pub(crate) fn destroy_page<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    pid: Pid,
    va: usize,
) -> Result<()> {
    let proc = procs.get_mut(pid)?;
    let Process { spt, pagetable, .. } = proc;
    let page = spt.remove(va).ok_or(KernelError::InvalidAddress)?;

    match page.state {
        PageState::Uninit(UninitKind::Anon) => {}
        PageState::Uninit(UninitKind::File(aux)) => fs.inode_close(aux.ip),
        PageState::Anon(mut anon) => anon.destroy(swap),
        PageState::File(fp) => {
            if let Some(frame) = page.frame {
                if page.writable && pagetable.is_dirty(va) {
                    fp.write_back(fs, frames.data(frame));
                }
            }
            fs.inode_close(fp.ip);
        }
    }

    pagetable.clear_page(va);
    if let Some(frame) = page.frame {
        frames.release(frame);
    }
    Ok(())
}

/// Tears down the whole SPT; process exit.
pub(crate) fn spt_kill<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    pid: Pid,
) -> Result<()> {
    loop {
        let va = match procs.get(pid)?.spt.iter().next() {
            Some(page) => page.va,
            None => return Ok(()),
        };
        destroy_page(procs, frames, swap, fs, pid, va)?;
    }
}

/// Page-fault entry point.
///
/// `intr_rsp` is the stack pointer from the interrupt frame; for faults
/// taken in kernel mode the heuristic uses the `user_rsp` the dispatcher
/// captured at system-call entry instead, before the stack switched.
pub(crate) fn handle_fault<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    pid: Pid,
    addr: usize,
    user: bool,
    write: bool,
    not_present: bool,
    intr_rsp: usize,
) -> Result<()> {
    if addr == 0 || is_kernel_vaddr(addr) {
        return Err(KernelError::InvalidAddress);
    }
    let va = pg_round_down(addr);

    if !not_present {
        // Present but faulting: a protection fault, not demand paging.
        let proc = procs.get(pid)?;
        let page = proc.spt.find(va).ok_or(KernelError::InvalidAddress)?;
        if write && !page.writable {
            return Err(KernelError::InvalidAddress);
        }
        return claim_page(procs, frames, swap, fs, pid, va);
    }

    let rsp = if user {
        intr_rsp
    } else {
        procs.get(pid)?.user_rsp
    };
    if addr >= rsp.saturating_sub(8) && addr < USER_STACK && addr >= USER_STACK - STACK_LIMIT {
        stack_growth(procs, pid, addr)?;
        return claim_page(procs, frames, swap, fs, pid, va);
    }

    let proc = procs.get(pid)?;
    let page = proc.spt.find(va).ok_or(KernelError::InvalidAddress)?;
    if write && !page.writable {
        return Err(KernelError::InvalidAddress);
    }
    claim_page(procs, frames, swap, fs, pid, va)
}

/// Registers anonymous, writable, stack-marked pages from the faulting
/// address up to `USER_STACK`, skipping pages that already exist. The
/// faulting page itself is claimed by the caller.
fn stack_growth(procs: &mut ProcTable, pid: Pid, addr: usize) -> Result<()> {
    let proc = procs.get_mut(pid)?;
    for va in range_step(pg_round_down(addr), USER_STACK, PGSIZE) {
        if va < USER_STACK - STACK_LIMIT {
            break;
        }
        if proc.spt.find(va).is_none() {
            let page = Page::new(
                va,
                true,
                PageFlags::STACK,
                PageState::Uninit(UninitKind::Anon),
            );
            let _ = proc.spt.insert(page);
        }
    }
    Ok(())
}

/// Clones `parent`'s SPT into `child`, for fork. Lazy pages stay lazy
/// (file-backed ones get their own file reference); materialized pages are
/// claimed in the child and their bytes copied frame-to-frame.
pub(crate) fn spt_copy<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    fs: &mut FileSystem<D>,
    parent: Pid,
    child: Pid,
) -> Result<()> {
    enum Src {
        UninitAnon,
        UninitFile { sector: u32, offset: u32, read_bytes: usize, zero_bytes: usize },
        Anon,
        File { sector: u32, offset: u32, read_bytes: usize, zero_bytes: usize },
    }

    let entries: Vec<(usize, bool, PageFlags, Src)> = procs
        .get(parent)?
        .spt
        .iter()
        .map(|page| {
            let src = match &page.state {
                PageState::Uninit(UninitKind::Anon) => Src::UninitAnon,
                PageState::Uninit(UninitKind::File(aux)) => Src::UninitFile {
                    sector: aux.ip.sector,
                    offset: aux.offset,
                    read_bytes: aux.read_bytes,
                    zero_bytes: aux.zero_bytes,
                },
                PageState::Anon(_) => Src::Anon,
                PageState::File(fp) => Src::File {
                    sector: fp.ip.sector,
                    offset: fp.offset,
                    read_bytes: fp.read_bytes,
                    zero_bytes: fp.zero_bytes,
                },
            };
            (page.va, page.writable, page.flags, src)
        })
        .collect();

    for (va, writable, flags, src) in entries {
        match src {
            Src::UninitAnon => {
                alloc_page(procs, child, UninitKind::Anon, va, writable, flags)
                    .map_err(|_| KernelError::InvalidAddress)?;
            }
            Src::UninitFile { sector, offset, read_bytes, zero_bytes } => {
                let aux = FilePage {
                    ip: fs.inode_open(sector)?,
                    offset,
                    read_bytes,
                    zero_bytes,
                };
                if let Err(page) = alloc_page(procs, child, UninitKind::File(aux), va, writable, flags) {
                    if let PageState::Uninit(UninitKind::File(aux)) = page.state {
                        fs.inode_close(aux.ip);
                    }
                    return Err(KernelError::InvalidAddress);
                }
            }
            Src::Anon => {
                alloc_page(procs, child, UninitKind::Anon, va, writable, flags)
                    .map_err(|_| KernelError::InvalidAddress)?;
                claim_page(procs, frames, swap, fs, child, va)?;
                copy_resident(procs, frames, swap, parent, child, va)?;
            }
            Src::File { sector, offset, read_bytes, zero_bytes } => {
                let aux = FilePage {
                    ip: fs.inode_open(sector)?,
                    offset,
                    read_bytes,
                    zero_bytes,
                };
                if let Err(page) = alloc_page(procs, child, UninitKind::File(aux), va, writable, flags) {
                    if let PageState::Uninit(UninitKind::File(aux)) = page.state {
                        fs.inode_close(aux.ip);
                    }
                    return Err(KernelError::InvalidAddress);
                }
                // The claim reads the file; the copy below overwrites that
                // with the parent's (possibly dirtier) bytes.
                claim_page(procs, frames, swap, fs, child, va)?;
                copy_resident(procs, frames, swap, parent, child, va)?;
            }
        }
    }
    Ok(())
}

/// Copies the parent's current bytes for `va` into the child's freshly
/// claimed frame, wherever they live right now (frame or swap slot), and
/// carries the dirty bit over.
fn copy_resident<D: Disk>(
    procs: &mut ProcTable,
    frames: &mut FrameTable,
    swap: &mut SwapTable<D>,
    parent: Pid,
    child: Pid,
    va: usize,
) -> Result<()> {
    let child_frame = procs
        .get(child)?
        .spt
        .find(va)
        .and_then(|p| p.frame)
        .ok_or(KernelError::InvalidAddress)?;

    let (src_frame, src_slot, dirty) = {
        let proc = procs.get(parent)?;
        let page = proc.spt.find(va).ok_or(KernelError::InvalidAddress)?;
        let slot = match &page.state {
            PageState::Anon(anon) => anon.slot,
            _ => None,
        };
        (page.frame, slot, proc.pagetable.is_dirty(va))
    };

    if let Some(src) = src_frame {
        frames.copy(src, child_frame);
    } else if let Some(slot) = src_slot {
        swap.read(slot, frames.data_mut(child_frame));
    }

    if dirty {
        procs.get_mut(child)?.pagetable.set_dirty(va, true);
    }
    Ok(())
}
