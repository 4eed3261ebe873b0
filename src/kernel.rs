//! The kernel facade.
//!
//! Owns the global state behind its locks and exposes the entry points the
//! system-call dispatcher consumes. Every file-system entry point runs
//! entirely under the single file-system lock; VM entry points additionally
//! take the frame and swap tables. Locks are always acquired in the order
//! procs -> fs -> frames -> swap and the guards are threaded down into the
//! VM layer, so nothing below re-enters a lock.

use core::mem;

use crate::disk::Disk;
use crate::error::{KernelError, Result};
use crate::file::File;
use crate::fs::{FileNameBuf, FileSystem, Path};
use crate::lock::{SleepLock, SpinLock};
use crate::memlayout::is_kernel_vaddr;
use crate::param::{FD_MAX, PGSIZE};
use crate::proc::{Pid, ProcTable};
use crate::vm::{self, FrameTable, PageFlags, SwapTable, UninitKind};

pub struct Kernel<D: Disk> {
    fs: SleepLock<FileSystem<D>>,
    frames: SpinLock<FrameTable>,
    swap: SpinLock<SwapTable<D>>,
    procs: SpinLock<ProcTable>,
}

impl<D: Disk> Kernel<D> {
    /// Formats `fs_disk` and brings the kernel up with a user frame pool of
    /// `frame_pool` pages and `swap_disk` behind the swap table.
    pub fn format(fs_disk: D, swap_disk: D, frame_pool: usize) -> Result<Self> {
        Ok(Self {
            fs: SleepLock::new("filesys", FileSystem::format(fs_disk)?),
            frames: SpinLock::new("frames", FrameTable::new(frame_pool)),
            swap: SpinLock::new("swap", SwapTable::new(swap_disk)),
            procs: SpinLock::new("procs", ProcTable::new()),
        })
    }

    /// Mounts an already-formatted disk.
    pub fn mount(fs_disk: D, swap_disk: D, frame_pool: usize) -> Self {
        Self {
            fs: SleepLock::new("filesys", FileSystem::mount(fs_disk)),
            frames: SpinLock::new("frames", FrameTable::new(frame_pool)),
            swap: SpinLock::new("swap", SwapTable::new(swap_disk)),
            procs: SpinLock::new("procs", ProcTable::new()),
        }
    }

    /// Writes the FAT back. The write-on-close of the metadata; file data
    /// is already on disk.
    pub fn shutdown(&self) {
        self.fs.lock().unmount();
    }

    /// Creates a process with the root directory as cwd.
    pub fn spawn(&self) -> Result<Pid> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let cwd = fs.open_root()?;
        match procs.alloc(cwd) {
            Ok(pid) => Ok(pid),
            Err(cwd) => {
                fs.inode_close(cwd);
                Err(KernelError::OutOfMemory)
            }
        }
    }

    /// Records the user stack pointer at system-call entry; the fault
    /// handler uses it for kernel-mode faults.
    pub fn set_user_rsp(&self, pid: Pid, rsp: usize) -> Result<()> {
        self.procs.lock().get_mut(pid)?.user_rsp = rsp;
        Ok(())
    }

    // File-system surface.

    pub fn create(&self, pid: Pid, path: &Path, initial_size: u32) -> Result<()> {
        if path.is_empty_string() {
            return Err(KernelError::NoSuchPath);
        }
        let cwd = self.procs.lock().get(pid)?.cwd.sector;
        self.fs.lock().create(cwd, path, initial_size)
    }

    pub fn remove(&self, pid: Pid, path: &Path) -> Result<()> {
        if path.is_empty_string() {
            return Err(KernelError::NoSuchPath);
        }
        let cwd = self.procs.lock().get(pid)?.cwd.sector;
        self.fs.lock().remove(cwd, path)
    }

    /// Opens `path` and returns a file descriptor.
    pub fn open(&self, pid: Pid, path: &Path) -> Result<usize> {
        if path.is_empty_string() {
            return Err(KernelError::NoSuchPath);
        }
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let cwd = procs.get(pid)?.cwd.sector;
        let ip = fs.open(cwd, path)?;
        match procs.get_mut(pid)?.alloc_fd(File::new(ip)) {
            Ok(fd) => Ok(fd),
            Err(file) => {
                file.close(&mut fs);
                Err(KernelError::OutOfMemory)
            }
        }
    }

    pub fn close(&self, pid: Pid, fd: usize) -> Result<()> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let file = procs.get_mut(pid)?.take_fd(fd)?;
        file.close(&mut fs);
        Ok(())
    }

    pub fn filesize(&self, pid: Pid, fd: usize) -> Result<u32> {
        let procs = self.procs.lock();
        let fs = self.fs.lock();
        Ok(procs.get(pid)?.file(fd)?.len(&fs))
    }

    /// Reads from the handle's cursor into a kernel buffer. The dispatcher
    /// pairs this with `copy_out` for user destinations.
    pub fn read(&self, pid: Pid, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        Ok(procs.get_mut(pid)?.file_mut(fd)?.read(&mut fs, buf))
    }

    /// Writes a kernel buffer at the handle's cursor. Directories reject
    /// writes; deny-write inodes report 0 bytes.
    pub fn write(&self, pid: Pid, fd: usize, buf: &[u8]) -> Result<usize> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let file = procs.get_mut(pid)?.file_mut(fd)?;
        if file.is_dir(&fs) {
            return Err(KernelError::ReadOnly);
        }
        Ok(file.write(&mut fs, buf))
    }

    pub fn seek(&self, pid: Pid, fd: usize, pos: u32) -> Result<()> {
        let mut procs = self.procs.lock();
        procs.get_mut(pid)?.file_mut(fd)?.seek(pos);
        Ok(())
    }

    pub fn tell(&self, pid: Pid, fd: usize) -> Result<u32> {
        Ok(self.procs.lock().get(pid)?.file(fd)?.tell())
    }

    pub fn mkdir(&self, pid: Pid, path: &Path) -> Result<()> {
        if path.is_empty_string() {
            return Err(KernelError::NoSuchPath);
        }
        let cwd = self.procs.lock().get(pid)?.cwd.sector;
        self.fs.lock().mkdir(cwd, path)
    }

    pub fn chdir(&self, pid: Pid, path: &Path) -> Result<()> {
        if path.is_empty_string() {
            return Err(KernelError::NoSuchPath);
        }
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let cwd = procs.get(pid)?.cwd.sector;
        let new_cwd = fs.chdir(cwd, path)?;
        let old = mem::replace(&mut procs.get_mut(pid)?.cwd, new_cwd);
        fs.inode_close(old);
        Ok(())
    }

    /// Next entry of the directory behind `fd`, skipping `.` and `..`.
    pub fn readdir(&self, pid: Pid, fd: usize) -> Result<Option<FileNameBuf>> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let file = procs.get_mut(pid)?.file_mut(fd)?;
        if !file.is_dir(&fs) {
            return Err(KernelError::NotADirectory);
        }
        while let Some(name) = file.dir_read(&mut fs) {
            if &name[..] != b"." && &name[..] != b".." {
                return Ok(Some(name));
            }
        }
        Ok(None)
    }

    pub fn isdir(&self, pid: Pid, fd: usize) -> Result<bool> {
        let procs = self.procs.lock();
        let fs = self.fs.lock();
        Ok(procs.get(pid)?.file(fd)?.is_dir(&fs))
    }

    pub fn inumber(&self, pid: Pid, fd: usize) -> Result<u32> {
        Ok(self.procs.lock().get(pid)?.file(fd)?.inumber())
    }

    pub fn symlink(&self, pid: Pid, target: &str, linkpath: &Path) -> Result<()> {
        if linkpath.is_empty_string() || target.is_empty() {
            return Err(KernelError::NoSuchPath);
        }
        let cwd = self.procs.lock().get(pid)?.cwd.sector;
        self.fs.lock().symlink(cwd, target.as_bytes(), linkpath)
    }

    // VM surface.

    /// Registers a lazy anonymous page; what the loader uses for segments
    /// and the initial stack.
    pub fn map_anon(&self, pid: Pid, va: usize, writable: bool) -> Result<()> {
        if va == 0 || is_kernel_vaddr(va) {
            return Err(KernelError::InvalidAddress);
        }
        let mut procs = self.procs.lock();
        vm::alloc_page(
            &mut procs,
            pid,
            UninitKind::Anon,
            va,
            writable,
            PageFlags::empty(),
        )
        .map_err(|_| KernelError::InvalidAddress)
    }

    /// Maps `length` bytes of the file behind `fd` at `addr`.
    pub fn mmap(
        &self,
        pid: Pid,
        addr: usize,
        length: usize,
        writable: bool,
        fd: usize,
        offset: u32,
    ) -> Result<usize> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();
        vm::mmap(
            &mut procs, &mut frames, &mut swap, &mut fs, pid, addr, length, writable, fd, offset,
        )
    }

    /// Unmaps the mapping starting at `addr`, writing dirty pages back.
    pub fn munmap(&self, pid: Pid, addr: usize) -> Result<()> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();
        vm::munmap(&mut procs, &mut frames, &mut swap, &mut fs, pid, addr)
    }

    /// Page-fault entry point. `intr_rsp` is the RSP of the interrupt
    /// frame; ignored for kernel-mode faults, which use the saved
    /// `user_rsp`.
    pub fn page_fault(
        &self,
        pid: Pid,
        addr: usize,
        user: bool,
        write: bool,
        not_present: bool,
        intr_rsp: usize,
    ) -> Result<()> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();
        vm::handle_fault(
            &mut procs,
            &mut frames,
            &mut swap,
            &mut fs,
            pid,
            addr,
            user,
            write,
            not_present,
            intr_rsp,
        )
    }

    /// Kernel-side store into user memory: faults pages in, honors the
    /// writable bit, and sets the accessed/dirty bits a hardware store
    /// would.
    pub fn copy_out(&self, pid: Pid, va: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if va == 0 || is_kernel_vaddr(va) || is_kernel_vaddr(va + buf.len() - 1) {
            return Err(KernelError::InvalidAddress);
        }

        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();

        let mut done = 0;
        let mut va = va;
        while done < buf.len() {
            let ofs = va % PGSIZE;
            let n = (buf.len() - done).min(PGSIZE - ofs);
            let frame = Self::user_frame(
                &mut procs, &mut frames, &mut swap, &mut fs, pid, va, true,
            )?;
            frames.data_mut(frame)[ofs..ofs + n].copy_from_slice(&buf[done..done + n]);

            let proc = procs.get_mut(pid)?;
            proc.pagetable.set_accessed(va);
            proc.pagetable.set_dirty(va, true);
            done += n;
            va += n;
        }
        Ok(())
    }

    /// Kernel-side load from user memory.
    pub fn copy_in(&self, pid: Pid, va: usize, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if va == 0 || is_kernel_vaddr(va) || is_kernel_vaddr(va + buf.len() - 1) {
            return Err(KernelError::InvalidAddress);
        }

        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();

        let mut done = 0;
        let mut va = va;
        while done < buf.len() {
            let ofs = va % PGSIZE;
            let n = (buf.len() - done).min(PGSIZE - ofs);
            let frame = Self::user_frame(
                &mut procs, &mut frames, &mut swap, &mut fs, pid, va, false,
            )?;
            buf[done..done + n].copy_from_slice(&frames.data(frame)[ofs..ofs + n]);

            procs.get_mut(pid)?.pagetable.set_accessed(va);
            done += n;
            va += n;
        }
        Ok(())
    }

    /// Resolves one user page for a kernel-side access, faulting it in when
    /// absent and checking the writable bit for stores.
    fn user_frame(
        procs: &mut ProcTable,
        frames: &mut FrameTable,
        swap: &mut SwapTable<D>,
        fs: &mut FileSystem<D>,
        pid: Pid,
        va: usize,
        write: bool,
    ) -> Result<vm::FrameId> {
        if !procs.get(pid)?.pagetable().is_mapped(va) {
            // A kernel-mode fault: the stack heuristic uses the saved
            // user_rsp, not the interrupt frame.
            vm::handle_fault(procs, frames, swap, fs, pid, va, false, write, true, 0)?;
        }
        let pte = procs
            .get(pid)?
            .pagetable()
            .get(va)
            .ok_or(KernelError::InvalidAddress)?;
        if write && !pte.flags.contains(vm::PteFlags::W) {
            return Err(KernelError::InvalidAddress);
        }
        Ok(pte.frame)
    }

    /// Clones a process: same cwd, duplicated fd table, copied address
    /// space. A failed copy tears the half-built child down.
    pub fn fork(&self, parent: Pid) -> Result<Pid> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();

        let (cwd, user_rsp) = {
            let p = procs.get(parent)?;
            (fs.inode_reopen(&p.cwd), p.user_rsp)
        };
        let child = match procs.alloc(cwd) {
            Ok(pid) => pid,
            Err(cwd) => {
                fs.inode_close(cwd);
                return Err(KernelError::OutOfMemory);
            }
        };
        procs.get_mut(child)?.user_rsp = user_rsp;

        for fd in 0..FD_MAX {
            let dup = match procs.get(parent)?.files[fd].as_ref() {
                Some(file) => Some(file.duplicate(&mut fs)),
                None => None,
            };
            if let Some(dup) = dup {
                procs.get_mut(child)?.files[fd] = Some(dup);
            }
        }

        if let Err(e) = vm::spt_copy(&mut procs, &mut frames, &mut swap, &mut fs, parent, child) {
            Self::teardown(&mut procs, &mut frames, &mut swap, &mut fs, child);
            return Err(e);
        }
        log::debug!("fork: {} -> {}", parent, child);
        Ok(child)
    }

    /// Releases everything the process owns: pages (with file write-back),
    /// open files, and the cwd reference.
    pub fn exit(&self, pid: Pid) -> Result<()> {
        let mut procs = self.procs.lock();
        let mut fs = self.fs.lock();
        let mut frames = self.frames.lock();
        let mut swap = self.swap.lock();
        procs.get(pid)?;
        Self::teardown(&mut procs, &mut frames, &mut swap, &mut fs, pid);
        Ok(())
    }

    fn teardown(
        procs: &mut ProcTable,
        frames: &mut FrameTable,
        swap: &mut SwapTable<D>,
        fs: &mut FileSystem<D>,
        pid: Pid,
    ) {
        let _ = vm::spt_kill(procs, frames, swap, fs, pid);
        if let Ok(mut proc) = procs.take(pid) {
            for fd in 0..FD_MAX {
                if let Some(file) = proc.files[fd].take() {
                    file.close(fs);
                }
            }
            fs.inode_close(proc.cwd);
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::disk::MemDisk;
    use crate::memlayout::USER_STACK;
    use crate::vm::PageState;

    const MAP: usize = 0x1000_0000;

    fn boot(frame_pool: usize) -> Kernel<MemDisk> {
        Kernel::format(MemDisk::new(1024), MemDisk::new(512), frame_pool).unwrap()
    }

    #[test]
    fn file_syscall_surface_round_trips() {
        let k = boot(16);
        let pid = k.spawn().unwrap();

        k.mkdir(pid, Path::new("/a")).unwrap();
        k.mkdir(pid, Path::new("/a/b")).unwrap();
        k.create(pid, Path::new("/a/b/f"), 0).unwrap();

        let fd = k.open(pid, Path::new("/a/b/f")).unwrap();
        assert_eq!(k.write(pid, fd, b"hello").unwrap(), 5);
        k.close(pid, fd).unwrap();

        let fd = k.open(pid, Path::new("/a/b/f")).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(k.read(pid, fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(k.filesize(pid, fd).unwrap(), 5);
        assert!(!k.isdir(pid, fd).unwrap());
        assert!(k.inumber(pid, fd).unwrap() > 0);
        k.close(pid, fd).unwrap();
        k.exit(pid).unwrap();
    }

    #[test]
    fn chdir_makes_relative_paths_work() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        k.mkdir(pid, Path::new("/a")).unwrap();
        k.chdir(pid, Path::new("/a")).unwrap();
        k.create(pid, Path::new("f"), 0).unwrap();

        let fd = k.open(pid, Path::new("/a/f")).unwrap();
        k.close(pid, fd).unwrap();

        // The cwd itself cannot be removed.
        assert_eq!(
            k.remove(pid, Path::new("/a")).unwrap_err(),
            KernelError::DirectoryBusy
        );
        k.exit(pid).unwrap();
    }

    #[test]
    fn readdir_skips_dot_entries() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        k.create(pid, Path::new("/x"), 0).unwrap();
        k.create(pid, Path::new("/y"), 0).unwrap();

        let fd = k.open(pid, Path::new("/")).unwrap();
        let mut names = Vec::new();
        while let Some(name) = k.readdir(pid, fd).unwrap() {
            names.push(name);
        }
        let names: Vec<&[u8]> = names.iter().map(|n| &n[..]).collect();
        assert_eq!(names, [b"x".as_ref(), b"y"]);
        k.close(pid, fd).unwrap();

        let fd = k.open(pid, Path::new("/x")).unwrap();
        assert_eq!(
            k.readdir(pid, fd).unwrap_err(),
            KernelError::NotADirectory
        );
        k.exit(pid).unwrap();
    }

    #[test]
    fn writes_through_directory_fds_are_rejected() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        let fd = k.open(pid, Path::new("/")).unwrap();
        assert_eq!(
            k.write(pid, fd, b"no").unwrap_err(),
            KernelError::ReadOnly
        );
        k.exit(pid).unwrap();
    }

    #[test]
    fn symlink_dangles_after_target_removal() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        k.create(pid, Path::new("/x"), 0).unwrap();
        k.symlink(pid, "/x", Path::new("/y")).unwrap();

        let fd = k.open(pid, Path::new("/y")).unwrap();
        k.close(pid, fd).unwrap();

        k.remove(pid, Path::new("/x")).unwrap();
        assert_eq!(
            k.open(pid, Path::new("/y")).unwrap_err(),
            KernelError::NoSuchPath
        );
        k.exit(pid).unwrap();
    }

    #[test]
    fn lazy_page_materializes_on_first_touch() {
        let k = boot(4);
        let pid = k.spawn().unwrap();
        k.map_anon(pid, MAP, true).unwrap();

        {
            let procs = k.procs.lock();
            let page = procs.get(pid).unwrap().spt().find(MAP).unwrap();
            assert!(page.frame.is_none());
            assert!(matches!(page.state, PageState::Uninit(_)));
        }

        k.copy_out(pid, MAP + 7, b"lazy").unwrap();
        let mut buf = [0u8; 4];
        k.copy_in(pid, MAP + 7, &mut buf).unwrap();
        assert_eq!(&buf, b"lazy");

        // Untouched bytes of the page read as zero.
        k.copy_in(pid, MAP, &mut buf).unwrap();
        assert_eq!(buf, [0, 0, 0, 0]);
        k.exit(pid).unwrap();
    }

    #[test]
    fn write_to_read_only_page_faults() {
        let k = boot(4);
        let pid = k.spawn().unwrap();
        k.map_anon(pid, MAP, false).unwrap();
        assert_eq!(
            k.copy_out(pid, MAP, b"x").unwrap_err(),
            KernelError::InvalidAddress
        );
        let mut buf = [0u8; 1];
        k.copy_in(pid, MAP, &mut buf).unwrap();
        k.exit(pid).unwrap();
    }

    #[test]
    fn fault_on_unmapped_or_kernel_addresses_fails() {
        let k = boot(4);
        let pid = k.spawn().unwrap();
        assert!(k.page_fault(pid, 0, true, false, true, 0).is_err());
        assert!(k
            .page_fault(pid, crate::memlayout::KERN_BASE + 8, true, false, true, 0)
            .is_err());
        assert!(k.page_fault(pid, 0x5000_0000, true, false, true, 0).is_err());
        k.exit(pid).unwrap();
    }

    #[test]
    fn stack_grows_at_rsp_minus_8_but_not_9() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        let rsp = USER_STACK - 3 * PGSIZE;

        // A fault 9 bytes under RSP is not stack growth, and nothing is
        // mapped there yet.
        assert!(k
            .page_fault(pid, rsp - 9, true, true, true, rsp)
            .is_err());

        k.page_fault(pid, rsp - 8, true, true, true, rsp).unwrap();
        {
            let procs = k.procs.lock();
            let proc = procs.get(pid).unwrap();
            let page = proc.spt().find(rsp - 8).unwrap();
            assert!(page.writable);
            assert!(page.flags.contains(PageFlags::STACK));
            assert!(page.frame.is_some());
            // The pages up to USER_STACK were registered lazily.
            assert!(proc.spt().find(USER_STACK - PGSIZE).is_some());
        }

        // Kernel-mode faults use the rsp captured at syscall entry.
        let rsp2 = rsp - 2 * PGSIZE;
        k.set_user_rsp(pid, rsp2).unwrap();
        k.page_fault(pid, rsp2 - 8, false, true, true, 0).unwrap();
        k.exit(pid).unwrap();
    }

    #[test]
    fn stack_faults_below_the_limit_fail() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        let too_low = USER_STACK - crate::memlayout::STACK_LIMIT - PGSIZE;
        assert!(k
            .page_fault(pid, too_low, true, true, true, too_low + 8)
            .is_err());
        k.exit(pid).unwrap();
    }

    #[test]
    fn anon_pages_survive_eviction_through_swap() {
        // Pool of 4 frames, 12 anonymous pages with distinct patterns.
        let k = boot(4);
        let pid = k.spawn().unwrap();
        const N: usize = 12;

        for i in 0..N {
            let va = MAP + i * PGSIZE;
            k.map_anon(pid, va, true).unwrap();
            let fill = vec![i as u8 + 1; PGSIZE];
            k.copy_out(pid, va, &fill).unwrap();
        }

        {
            let frames = k.frames.lock();
            assert_eq!(frames.live(), 4);
            let swap = k.swap.lock();
            assert!(swap.used_count() >= N - 4);
        }

        for i in (0..N).rev() {
            let va = MAP + i * PGSIZE;
            let mut buf = vec![0u8; PGSIZE];
            k.copy_in(pid, va, &mut buf).unwrap();
            assert!(buf.iter().all(|b| *b == i as u8 + 1), "page {} pattern", i);
        }

        k.exit(pid).unwrap();
        assert_eq!(k.swap.lock().used_count(), 0);
        assert_eq!(k.frames.lock().live(), 0);
    }

    #[test]
    fn frame_and_page_back_pointers_agree() {
        let k = boot(4);
        let pid = k.spawn().unwrap();
        for i in 0..6 {
            let va = MAP + i * PGSIZE;
            k.map_anon(pid, va, true).unwrap();
            k.copy_out(pid, va, &[1]).unwrap();
        }

        let procs = k.procs.lock();
        let frames = k.frames.lock();
        let proc = procs.get(pid).unwrap();
        for id in frames.fifo_iter() {
            let (fpid, va) = frames.page_of(id).unwrap();
            assert_eq!(fpid, pid);
            assert_eq!(proc.spt().find(va).unwrap().frame, Some(id));
        }
        for page in proc.spt().iter() {
            if let Some(frame) = page.frame {
                assert_eq!(frames.page_of(frame), Some((pid, page.va)));
            }
        }
    }

    #[test]
    fn mmap_reads_file_and_zero_tail_and_writes_back() {
        let k = boot(8);
        let pid = k.spawn().unwrap();

        // A 5000-byte file with a recognizable pattern.
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 199) as u8 + 1).collect();
        k.create(pid, Path::new("/m"), 0).unwrap();
        let fd = k.open(pid, Path::new("/m")).unwrap();
        assert_eq!(k.write(pid, fd, &data).unwrap(), 5000);

        assert_eq!(k.mmap(pid, MAP, 8192, true, fd, 0).unwrap(), MAP);
        {
            let procs = k.procs.lock();
            assert_eq!(procs.get(pid).unwrap().spt().len(), 2);
        }

        // Bytes [5000, 8192) read as zero, the rest as the file.
        let mut buf = vec![0u8; 8192];
        k.copy_in(pid, MAP, &mut buf).unwrap();
        assert_eq!(&buf[..5000], &data[..]);
        assert!(buf[5000..].iter().all(|b| *b == 0));

        // Mutate the mapped window, then unmap: the file sees the change.
        k.copy_out(pid, MAP, &vec![0xee; 5000]).unwrap();
        k.munmap(pid, MAP).unwrap();
        {
            let procs = k.procs.lock();
            assert_eq!(procs.get(pid).unwrap().spt().len(), 0);
        }

        k.seek(pid, fd, 0).unwrap();
        let mut back = vec![0u8; 5000];
        assert_eq!(k.read(pid, fd, &mut back).unwrap(), 5000);
        assert!(back.iter().all(|b| *b == 0xee));
        k.close(pid, fd).unwrap();
        k.exit(pid).unwrap();
    }

    #[test]
    fn clean_mmap_does_not_write_back() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        k.create(pid, Path::new("/m"), 0).unwrap();
        let fd = k.open(pid, Path::new("/m")).unwrap();
        assert_eq!(k.write(pid, fd, b"stable").unwrap(), 6);

        assert_eq!(k.mmap(pid, MAP, 6, true, fd, 0).unwrap(), MAP);
        let mut buf = [0u8; 6];
        k.copy_in(pid, MAP, &mut buf).unwrap();
        k.munmap(pid, MAP).unwrap();

        k.seek(pid, fd, 0).unwrap();
        assert_eq!(k.read(pid, fd, &mut buf).unwrap(), 6);
        assert_eq!(&buf, b"stable");
        k.close(pid, fd).unwrap();
        k.exit(pid).unwrap();
    }

    #[test]
    fn mmap_validates_its_arguments() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        k.create(pid, Path::new("/m"), 100).unwrap();
        let fd = k.open(pid, Path::new("/m")).unwrap();

        assert!(k.mmap(pid, 0, 100, true, fd, 0).is_err());
        assert!(k.mmap(pid, MAP + 3, 100, true, fd, 0).is_err());
        assert!(k.mmap(pid, MAP, 0, true, fd, 0).is_err());
        assert!(k.mmap(pid, MAP, 100, true, fd, 4096).is_err()); // past EOF
        assert!(k.mmap(pid, MAP, 100, true, fd, 7).is_err()); // unaligned
        assert!(k.mmap(pid, MAP, 100, true, 99, 0).is_err()); // bad fd

        // Overlap with an existing mapping rolls back cleanly.
        k.map_anon(pid, MAP + PGSIZE, true).unwrap();
        assert!(k.mmap(pid, MAP, 2 * PGSIZE, true, fd, 0).is_err());
        {
            let procs = k.procs.lock();
            assert_eq!(procs.get(pid).unwrap().spt().len(), 1);
        }
        // All inode claims from the failed mmap were returned.
        k.close(pid, fd).unwrap();
        k.remove(pid, Path::new("/m")).unwrap();
        k.exit(pid).unwrap();
        assert_eq!(k.fs.lock().itable().open_inodes(), 0);
    }

    #[test]
    fn fork_copies_memory_and_isolates_it() {
        let k = boot(8);
        let parent = k.spawn().unwrap();
        k.map_anon(parent, MAP, true).unwrap();
        k.copy_out(parent, MAP, b"PPPP").unwrap();

        let child = k.fork(parent).unwrap();

        let mut buf = [0u8; 4];
        k.copy_in(child, MAP, &mut buf).unwrap();
        assert_eq!(&buf, b"PPPP");

        k.copy_out(child, MAP, b"QQQQ").unwrap();
        k.copy_in(parent, MAP, &mut buf).unwrap();
        assert_eq!(&buf, b"PPPP");
        k.copy_in(child, MAP, &mut buf).unwrap();
        assert_eq!(&buf, b"QQQQ");

        k.exit(child).unwrap();
        k.exit(parent).unwrap();
    }

    #[test]
    fn fork_copies_lazy_and_swapped_pages() {
        let k = boot(4);
        let parent = k.spawn().unwrap();

        // A lazy page the parent never touches.
        k.map_anon(parent, MAP, true).unwrap();
        // Enough touched pages that some get swapped out.
        for i in 1..8usize {
            let va = MAP + i * PGSIZE;
            k.map_anon(parent, va, true).unwrap();
            k.copy_out(parent, va, &[i as u8; 16]).unwrap();
        }

        let child = k.fork(parent).unwrap();
        let mut buf = [0u8; 16];
        for i in 1..8usize {
            k.copy_in(child, MAP + i * PGSIZE, &mut buf).unwrap();
            assert_eq!(buf, [i as u8; 16], "child page {}", i);
        }
        // The untouched page is still lazy in the child and reads zero.
        k.copy_in(child, MAP, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);

        k.exit(child).unwrap();
        k.exit(parent).unwrap();
        assert_eq!(k.swap.lock().used_count(), 0);
    }

    #[test]
    fn fork_duplicates_open_files_with_cursors() {
        let k = boot(8);
        let parent = k.spawn().unwrap();
        k.create(parent, Path::new("/f"), 0).unwrap();
        let fd = k.open(parent, Path::new("/f")).unwrap();
        assert_eq!(k.write(parent, fd, b"abcdef").unwrap(), 6);
        k.seek(parent, fd, 2).unwrap();

        let child = k.fork(parent).unwrap();
        assert_eq!(k.tell(child, fd).unwrap(), 2);
        let mut buf = [0u8; 2];
        assert_eq!(k.read(child, fd, &mut buf).unwrap(), 2);
        assert_eq!(&buf, b"cd");
        // The parent's cursor did not move.
        assert_eq!(k.tell(parent, fd).unwrap(), 2);

        k.exit(child).unwrap();
        k.exit(parent).unwrap();
        assert_eq!(k.fs.lock().itable().open_inodes(), 0);
    }

    #[test]
    fn exit_writes_mappings_back_and_frees_everything() {
        let k = boot(8);
        let pid = k.spawn().unwrap();
        k.create(pid, Path::new("/m"), 0).unwrap();
        let fd = k.open(pid, Path::new("/m")).unwrap();
        assert_eq!(k.write(pid, fd, &[0u8; 4096]).unwrap(), 4096);

        assert_eq!(k.mmap(pid, MAP, 4096, true, fd, 0).unwrap(), MAP);
        k.copy_out(pid, MAP, b"last words").unwrap();
        k.exit(pid).unwrap();

        let pid = k.spawn().unwrap();
        let fd = k.open(pid, Path::new("/m")).unwrap();
        let mut buf = [0u8; 10];
        assert_eq!(k.read(pid, fd, &mut buf).unwrap(), 10);
        assert_eq!(&buf, b"last words");
        k.exit(pid).unwrap();

        assert_eq!(k.frames.lock().live(), 0);
        assert_eq!(k.fs.lock().itable().open_inodes(), 0);
    }

    #[test]
    fn eviction_skips_stack_pages() {
        // Pool of 2: one stack page plus anonymous traffic.
        let k = boot(2);
        let pid = k.spawn().unwrap();
        let rsp = USER_STACK - PGSIZE;
        k.page_fault(pid, rsp - 8, true, true, true, rsp).unwrap();
        k.copy_out(pid, rsp - 8, b"S").unwrap();

        for i in 0..4usize {
            let va = MAP + i * PGSIZE;
            k.map_anon(pid, va, true).unwrap();
            k.copy_out(pid, va, &[i as u8 + 1]).unwrap();
        }

        // The stack page never left memory.
        {
            let procs = k.procs.lock();
            let page = procs.get(pid).unwrap().spt().find(rsp - 8).unwrap();
            assert!(page.frame.is_some());
        }
        let mut buf = [0u8; 1];
        k.copy_in(pid, rsp - 8, &mut buf).unwrap();
        assert_eq!(&buf, b"S");
        k.exit(pid).unwrap();
    }

    #[test]
    fn swap_exhaustion_surfaces_as_an_error() {
        // 2 frames, 2 swap slots: the fifth touched page has nowhere to go.
        let k = Kernel::format(MemDisk::new(1024), MemDisk::new(16), 2).unwrap();
        let pid = k.spawn().unwrap();

        let mut failed = false;
        for i in 0..5usize {
            let va = MAP + i * PGSIZE;
            k.map_anon(pid, va, true).unwrap();
            if k.copy_out(pid, va, &[1]).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        k.exit(pid).unwrap();
    }

    #[test]
    fn shutdown_persists_across_a_remount() {
        let k = boot(4);
        let pid = k.spawn().unwrap();
        k.create(pid, Path::new("/f"), 0).unwrap();
        let fd = k.open(pid, Path::new("/f")).unwrap();
        assert_eq!(k.write(pid, fd, b"durable").unwrap(), 7);
        k.close(pid, fd).unwrap();
        k.exit(pid).unwrap();
        k.shutdown();

        let Kernel { fs, .. } = k;
        let disk = fs.into_inner().into_disk();
        let k = Kernel::mount(disk, MemDisk::new(64), 4);
        let pid = k.spawn().unwrap();
        let fd = k.open(pid, Path::new("/f")).unwrap();
        let mut buf = [0u8; 7];
        assert_eq!(k.read(pid, fd, &mut buf).unwrap(), 7);
        assert_eq!(&buf, b"durable");
        k.close(pid, fd).unwrap();
        k.exit(pid).unwrap();
    }
}
