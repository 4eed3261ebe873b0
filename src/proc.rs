//! Processes, as the storage/VM core sees them.
//!
//! Scheduling and the wait/exit protocol live outside this crate; what
//! remains per process is the state the file system and VM need: the
//! current working directory, the bounded file-descriptor table, the
//! supplemental page table with its hardware-facing page table, and the
//! user stack pointer captured at system-call entry for the stack-growth
//! heuristic.

use array_macro::array;

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::fs::InodeRef;
use crate::param::{FD_MAX, NPROC};
use crate::vm::{PageTable, Spt};

pub type Pid = usize;

/// Lowest fd handed to user code; 0 and 1 belong to the console.
const FD_FIRST: usize = 2;

pub struct Process {
    /// Current working directory; an owned open-count claim.
    pub(crate) cwd: InodeRef,
    pub(crate) files: [Option<File>; FD_MAX],
    pub(crate) spt: Spt,
    pub(crate) pagetable: PageTable,
    /// User RSP saved at system-call entry, before the stack switch.
    pub user_rsp: usize,
}

impl Process {
    fn new(cwd: InodeRef) -> Self {
        Self {
            cwd,
            files: array![_ => None; FD_MAX],
            spt: Spt::new(),
            pagetable: PageTable::new(),
            user_rsp: 0,
        }
    }

    /// Puts `file` into the lowest free descriptor slot; hands it back when
    /// the table is full so the caller can close it.
    pub(crate) fn alloc_fd(&mut self, file: File) -> core::result::Result<usize, File> {
        for fd in FD_FIRST..FD_MAX {
            if self.files[fd].is_none() {
                self.files[fd] = Some(file);
                return Ok(fd);
            }
        }
        Err(file)
    }

    pub(crate) fn file(&self, fd: usize) -> Result<&File> {
        if fd < FD_FIRST || fd >= FD_MAX {
            return Err(KernelError::InvalidHandle);
        }
        self.files[fd].as_ref().ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn file_mut(&mut self, fd: usize) -> Result<&mut File> {
        if fd < FD_FIRST || fd >= FD_MAX {
            return Err(KernelError::InvalidHandle);
        }
        self.files[fd].as_mut().ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn take_fd(&mut self, fd: usize) -> Result<File> {
        if fd < FD_FIRST || fd >= FD_MAX {
            return Err(KernelError::InvalidHandle);
        }
        self.files[fd].take().ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn spt(&self) -> &Spt {
        &self.spt
    }

    pub(crate) fn pagetable(&self) -> &PageTable {
        &self.pagetable
    }
}

/// Fixed pool of process slots; a pid is an index into it.
pub struct ProcTable {
    procs: [Option<Process>; NPROC],
}

impl ProcTable {
    pub fn new() -> Self {
        Self {
            procs: array![_ => None; NPROC],
        }
    }

    /// Claims a slot for a new process whose cwd is `cwd`; hands the cwd
    /// reference back when the pool is full so the caller can close it.
    pub(crate) fn alloc(&mut self, cwd: InodeRef) -> core::result::Result<Pid, InodeRef> {
        let pid = match self.procs.iter().position(|p| p.is_none()) {
            Some(pid) => pid,
            None => return Err(cwd),
        };
        self.procs[pid] = Some(Process::new(cwd));
        Ok(pid)
    }

    pub(crate) fn get(&self, pid: Pid) -> Result<&Process> {
        self.procs
            .get(pid)
            .and_then(|p| p.as_ref())
            .ok_or(KernelError::InvalidHandle)
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Result<&mut Process> {
        self.procs
            .get_mut(pid)
            .and_then(|p| p.as_mut())
            .ok_or(KernelError::InvalidHandle)
    }

    /// Removes the process, handing its state to the caller for teardown.
    pub(crate) fn take(&mut self, pid: Pid) -> Result<Process> {
        self.procs
            .get_mut(pid)
            .and_then(|p| p.take())
            .ok_or(KernelError::InvalidHandle)
    }
}
