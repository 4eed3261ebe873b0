//! Directories.
//!
//! A directory is an inode whose data is a packed array of `Dirent`
//! records. Entries are reused in place: removal clears `in_use`, insertion
//! takes the first free slot and grows the directory file only when every
//! slot is taken.

use core::mem;

use zerocopy::{AsBytes, FromBytes};

use super::inode::InodeRef;
use super::path::{FileName, FileNameBuf};
use super::FileSystem;
use crate::disk::{Disk, SectorNo};
use crate::error::{KernelError, Result};
use crate::param::DIRSIZ;

/// On-disk directory entry.
#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct Dirent {
    in_use: u32,
    inode_sector: SectorNo,
    /// NUL-terminated, at most `DIRSIZ` characters.
    name: [u8; DIRSIZ + 1],
    _pad: u8,
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

impl Dirent {
    /// Fill in name. If name is shorter than `DIRSIZ`, a NUL terminator is
    /// appended.
    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        self.name[..name.len()].copy_from_slice(name);
        self.name[name.len()] = 0;
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|ch| *ch == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }

    fn name_matches(&self, name: &FileName) -> bool {
        self.name_bytes() == name.as_bytes()
    }
}

impl<D: Disk> FileSystem<D> {
    /// Initializes a directory inode with room for `entry_cnt` entries at
    /// `sector`. The caller inserts `.` and `..` right after.
    pub(crate) fn dir_create(&mut self, sector: SectorNo, entry_cnt: u32) -> Result<()> {
        self.inode_create(sector, entry_cnt * DIRENT_SIZE as u32, true)
    }

    fn read_entry(&mut self, dir: &InodeRef, off: u32) -> Option<Dirent> {
        let mut buf = [0u8; DIRENT_SIZE];
        if self.inode_read_at(dir, &mut buf, off) != DIRENT_SIZE {
            return None;
        }
        Dirent::read_from(&buf[..])
    }

    fn write_entry(&mut self, dir: &InodeRef, off: u32, de: &Dirent) -> Result<()> {
        let mut buf = [0u8; DIRENT_SIZE];
        buf.copy_from_slice(de.as_bytes());
        if self.inode_write_at(dir, &buf, off) != DIRENT_SIZE {
            return Err(KernelError::OutOfSpace);
        }
        Ok(())
    }

    /// Looks `name` up in `dir` and opens the named inode.
    pub(crate) fn dir_lookup(&mut self, dir: &InodeRef, name: &FileName) -> Result<InodeRef> {
        assert!(self.inode_is_dir(dir), "dir_lookup: not a directory");

        let len = self.inode_len(dir);
        let mut off = 0;
        while off < len {
            if let Some(de) = self.read_entry(dir, off) {
                if de.in_use != 0 && de.name_matches(name) {
                    return self.inode_open(de.inode_sector);
                }
            }
            off += DIRENT_SIZE as u32;
        }
        Err(KernelError::NoSuchPath)
    }

    /// Writes a new entry `name -> inode_sector` into `dir`.
    pub(crate) fn dir_add(
        &mut self,
        dir: &InodeRef,
        name: &FileName,
        inode_sector: SectorNo,
    ) -> Result<()> {
        if name.as_bytes().is_empty() {
            return Err(KernelError::NoSuchPath);
        }
        if let Ok(ip) = self.dir_lookup(dir, name) {
            self.inode_close(ip);
            return Err(KernelError::NameExists);
        }

        // First slot not in use, or the end of the directory data (the
        // write below grows the file).
        let len = self.inode_len(dir);
        let mut off = 0;
        while off < len {
            match self.read_entry(dir, off) {
                Some(de) if de.in_use == 0 => break,
                Some(_) => off += DIRENT_SIZE as u32,
                None => break,
            }
        }

        let mut de = Dirent::default();
        de.in_use = 1;
        de.inode_sector = inode_sector;
        de.set_name(name);
        self.write_entry(dir, off, &de)
    }

    /// Clears the entry for `name` and marks the named inode removed.
    pub(crate) fn dir_remove(&mut self, dir: &InodeRef, name: &FileName) -> Result<()> {
        let len = self.inode_len(dir);
        let mut off = 0;
        while off < len {
            if let Some(mut de) = self.read_entry(dir, off) {
                if de.in_use != 0 && de.name_matches(name) {
                    let target = self.inode_open(de.inode_sector)?;
                    de.in_use = 0;
                    self.write_entry(dir, off, &de)?;
                    self.inode_remove(&target);
                    self.inode_close(target);
                    return Ok(());
                }
            }
            off += DIRENT_SIZE as u32;
        }
        Err(KernelError::NoSuchPath)
    }

    /// Returns the next in-use entry name at or after `*pos`, advancing
    /// `*pos` past it. `.` and `..` are not filtered here; the readdir
    /// wrapper in the kernel facade skips them.
    pub(crate) fn dir_read(&mut self, dir: &InodeRef, pos: &mut u32) -> Option<FileNameBuf> {
        let len = self.inode_len(dir);
        while *pos < len {
            let de = self.read_entry(dir, *pos);
            *pos += DIRENT_SIZE as u32;
            if let Some(de) = de {
                if de.in_use != 0 {
                    let mut name = FileNameBuf::new();
                    name.try_extend_from_slice(de.name_bytes()).ok()?;
                    return Some(name);
                }
            }
        }
        None
    }

    /// Is `dir` empty except for `.` and `..`?
    pub(crate) fn dir_is_empty(&mut self, dir: &InodeRef) -> bool {
        let len = self.inode_len(dir);
        let mut off = 0;
        while off < len {
            if let Some(de) = self.read_entry(dir, off) {
                if de.in_use != 0 && de.name_bytes() != b"." && de.name_bytes() != b".." {
                    return false;
                }
            }
            off += DIRENT_SIZE as u32;
        }
        true
    }
}
