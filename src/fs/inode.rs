//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk form
//! (`Dinode`) occupies exactly one sector and holds the head cluster of the
//! data chain, the length in bytes, and the directory/symlink flags; a
//! symlink stores its target path inside the record itself.
//!
//! The kernel keeps a table of open inodes in memory so that opening the
//! same on-disk sector twice yields the same cached record with a shared
//! open count. An entry is recycled when the count drops to zero; if the
//! inode was removed while open, its data chain (and the cluster backing the
//! inode sector itself) is given back to the FAT at that point.
//!
//! All reads and writes go sector-by-sector: full aligned sectors move
//! directly between the caller's buffer and the disk, everything else
//! bounces through a one-sector buffer.

use core::convert::TryInto;
use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use super::fat::{ClusterNo, Fat, EOC, FREE};
use super::FileSystem;
use crate::disk::{Disk, SectorNo};
use crate::error::{KernelError, Result};
use crate::param::{LINKPATH_MAX, NINODE, SECTOR_SIZE};

const INODE_MAGIC: u32 = 0x494e_4f44;

/// Returns the number of sectors needed for `size` bytes of data.
pub fn bytes_to_sectors(size: u32) -> u32 {
    (size as usize + SECTOR_SIZE - 1) as u32 / SECTOR_SIZE as u32
}

/// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    /// First cluster of the data chain; 0 when the file is empty.
    pub start: ClusterNo,
    /// File size in bytes.
    pub length: u32,
    magic: u32,
    /// 0 = file, 1 = directory.
    is_dir: u32,
    /// 0 = regular, 1 = symlink.
    is_link: u32,
    /// NUL-terminated target path; only meaningful when `is_link` is set.
    linkpath: [u8; LINKPATH_MAX],
}

const_assert!(mem::size_of::<Dinode>() == SECTOR_SIZE);

impl Dinode {
    fn zeroed() -> Self {
        Self {
            start: 0,
            length: 0,
            magic: 0,
            is_dir: 0,
            is_link: 0,
            linkpath: [0; LINKPATH_MAX],
        }
    }
}

/// In-memory inode.
pub struct Inode {
    /// Sector number of the on-disk record.
    pub sector: SectorNo,
    /// Number of openers.
    open_count: u32,
    /// True if deleted; storage is freed at the last close.
    removed: bool,
    /// 0: writes ok, >0: writes denied.
    deny_write_count: u32,
    /// Cached copy of the on-disk record. Mutations write through.
    data: Dinode,
}

/// Opaque handle to an open inode.
///
/// The table is the sole owner of `Inode` records; a handle is a claim on
/// one open count and must be given back through `inode_close` (or one of
/// the operations documented to consume it).
#[derive(Debug)]
pub struct InodeRef {
    slot: usize,
    pub sector: SectorNo,
}

/// Table of open inodes, keyed by sector.
pub struct Itable {
    slots: [Option<Inode>; NINODE],
}

impl Itable {
    pub fn new() -> Self {
        Self {
            slots: array_macro::array![_ => None; NINODE],
        }
    }

    fn find(&self, sector: SectorNo) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| matches!(s, Some(ip) if ip.sector == sector))
    }

    pub(super) fn get(&self, ip: &InodeRef) -> &Inode {
        self.slots[ip.slot].as_ref().expect("itable: stale handle")
    }

    pub(super) fn get_mut(&mut self, ip: &InodeRef) -> &mut Inode {
        self.slots[ip.slot].as_mut().expect("itable: stale handle")
    }

    /// Number of live entries, for invariant checks.
    pub fn open_inodes(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn write_dinode<D: Disk>(disk: &mut D, sector: SectorNo, data: &Dinode) {
    let mut buf = [0u8; SECTOR_SIZE];
    buf.copy_from_slice(data.as_bytes());
    disk.write(sector, &buf);
}

/// Returns the sector holding byte `pos` of the inode's data, chain-walking
/// from `start`. `None` past EOF or off a broken chain.
fn byte_to_sector(fat: &Fat, data: &Dinode, pos: u32) -> Option<SectorNo> {
    if pos >= data.length {
        return None;
    }
    let mut clst = data.start;
    if clst < 1 {
        return None;
    }
    let mut skip = pos as usize / SECTOR_SIZE;
    while skip > 0 {
        clst = fat.get(clst);
        if clst == EOC || clst == 0 {
            return None;
        }
        skip -= 1;
    }
    Some(fat.cluster_to_sector(clst))
}

/// Builds a zeroed chain of `sectors` clusters. A half-built chain is
/// released again when allocation runs out of space mid-way.
fn alloc_chain<D: Disk>(fat: &mut Fat, disk: &mut D, sectors: u32) -> Result<ClusterNo> {
    let mut chain = scopeguard::guard((fat, FREE), |(fat, first)| {
        if first != 0 {
            fat.remove_chain(first, 0);
        }
    });

    let mut prev = 0;
    for _ in 0..sectors {
        let clst = chain.0.create_chain(prev)?;
        if chain.1 == 0 {
            chain.1 = clst;
        }
        prev = clst;
    }
    let (fat, first) = scopeguard::ScopeGuard::into_inner(chain);

    let zeros = [0u8; SECTOR_SIZE];
    let mut clst = first;
    for _ in 0..sectors {
        disk.write(fat.cluster_to_sector(clst), &zeros);
        clst = fat.get(clst);
    }
    Ok(first)
}

impl<D: Disk> FileSystem<D> {
    /// Initializes a file inode of `length` zeroed bytes at `sector`.
    pub(crate) fn inode_create(&mut self, sector: SectorNo, length: u32, is_dir: bool) -> Result<()> {
        let mut data = Dinode::zeroed();
        data.length = length;
        data.magic = INODE_MAGIC;
        data.is_dir = is_dir as u32;
        data.start = alloc_chain(&mut self.fat, &mut self.disk, bytes_to_sectors(length))?;
        write_dinode(&mut self.disk, sector, &data);
        Ok(())
    }

    /// Initializes a symlink inode at `sector` whose body is `target`.
    pub(crate) fn inode_create_link(&mut self, sector: SectorNo, target: &[u8]) -> Result<()> {
        if target.len() + 1 > LINKPATH_MAX {
            return Err(KernelError::NameTooLong);
        }
        let length = target.len() as u32 + 1;
        let mut data = Dinode::zeroed();
        data.length = length;
        data.magic = INODE_MAGIC;
        data.is_link = 1;
        data.linkpath[..target.len()].copy_from_slice(target);
        data.start = alloc_chain(&mut self.fat, &mut self.disk, bytes_to_sectors(length))?;
        write_dinode(&mut self.disk, sector, &data);
        Ok(())
    }

    /// Opens the inode at `sector`, sharing the cached record when it is
    /// already open.
    pub(crate) fn inode_open(&mut self, sector: SectorNo) -> Result<InodeRef> {
        if let Some(slot) = self.itable.find(sector) {
            let ip = self.itable.slots[slot].as_mut().unwrap();
            ip.open_count += 1;
            return Ok(InodeRef { slot, sector });
        }

        let slot = self
            .itable
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(KernelError::OutOfMemory)?;

        let mut buf = [0u8; SECTOR_SIZE];
        self.disk.read(sector, &mut buf);
        let data = Dinode::read_from(&buf[..]).expect("inode_open: record");
        assert_eq!(data.magic, INODE_MAGIC, "inode_open: bad magic");

        self.itable.slots[slot] = Some(Inode {
            sector,
            open_count: 1,
            removed: false,
            deny_write_count: 0,
            data,
        });
        Ok(InodeRef { slot, sector })
    }

    /// Takes another claim on an already-open inode.
    pub(crate) fn inode_reopen(&mut self, ip: &InodeRef) -> InodeRef {
        let inode = self.itable.get_mut(ip);
        inode.open_count += 1;
        InodeRef {
            slot: ip.slot,
            sector: ip.sector,
        }
    }

    /// Gives back one claim. At the last close the entry is recycled, and a
    /// removed inode's storage goes back to the FAT.
    pub(crate) fn inode_close(&mut self, ip: InodeRef) {
        let inode = self.itable.get_mut(&ip);
        assert!(inode.open_count > 0, "inode_close: not open");
        inode.open_count -= 1;
        if inode.open_count > 0 {
            return;
        }

        let inode = self.itable.slots[ip.slot].take().unwrap();
        if inode.removed {
            log::trace!("inode {}: freeing storage", inode.sector);
            if inode.data.start != 0 {
                self.fat.remove_chain(inode.data.start, 0);
            }
            let own = self.fat.sector_to_cluster(inode.sector);
            self.fat.remove_chain(own, 0);
        }
    }

    /// Marks the inode for deletion at its last close.
    pub(crate) fn inode_remove(&mut self, ip: &InodeRef) {
        self.itable.get_mut(ip).removed = true;
    }

    /// Reads up to `buf.len()` bytes starting at `off`. Returns the number
    /// of bytes read, short at EOF.
    pub(crate) fn inode_read_at(&mut self, ip: &InodeRef, buf: &mut [u8], mut off: u32) -> usize {
        let Self {
            disk, fat, itable, ..
        } = self;
        let inode = itable.get(ip);

        let mut bounce = [0u8; SECTOR_SIZE];
        let mut bytes_read = 0;
        let mut size = buf.len();

        while size > 0 {
            let sector_ofs = off as usize % SECTOR_SIZE;

            // Bytes left in inode, bytes left in sector, lesser of the two.
            let inode_left = inode.data.length.saturating_sub(off) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            let sector = match byte_to_sector(fat, &inode.data, off) {
                Some(s) => s,
                None => break,
            };

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                // Full sector straight into the caller's buffer.
                let dst = (&mut buf[bytes_read..bytes_read + SECTOR_SIZE])
                    .try_into()
                    .unwrap();
                disk.read(sector, dst);
            } else {
                disk.read(sector, &mut bounce);
                buf[bytes_read..bytes_read + chunk]
                    .copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }

            size -= chunk;
            off += chunk as u32;
            bytes_read += chunk;
        }
        bytes_read
    }

    /// Writes `buf` starting at `off`, extending the file as needed.
    /// Returns the number of bytes written: 0 when writes are denied, and 0
    /// when the FAT cannot cover the requested growth (clusters already
    /// chained stay in place; the length is only updated after the whole
    /// growth succeeds).
    pub(crate) fn inode_write_at(&mut self, ip: &InodeRef, buf: &[u8], mut off: u32) -> usize {
        let Self {
            disk, fat, itable, ..
        } = self;
        let inode = itable.get_mut(ip);

        if inode.deny_write_count > 0 {
            return 0;
        }

        let end_pos = off + buf.len() as u32;
        if end_pos > inode.data.length {
            // File growth: chain enough clusters for the new tail, then
            // commit the new length.
            let old_sectors = bytes_to_sectors(inode.data.length);
            let new_sectors = bytes_to_sectors(end_pos);
            let mut cnt = new_sectors.saturating_sub(old_sectors);

            let mut clst = inode.data.start;
            if clst == 0 && cnt > 0 {
                clst = match fat.create_chain(0) {
                    Ok(c) => c,
                    Err(_) => return 0,
                };
                let zeros = [0u8; SECTOR_SIZE];
                disk.write(fat.cluster_to_sector(clst), &zeros);
                inode.data.start = clst;
                cnt -= 1;
            }

            while cnt > 0 && fat.get(clst) != EOC {
                clst = fat.get(clst);
            }

            let zeros = [0u8; SECTOR_SIZE];
            for _ in 0..cnt {
                clst = match fat.create_chain(clst) {
                    Ok(c) => c,
                    Err(_) => return 0,
                };
                disk.write(fat.cluster_to_sector(clst), &zeros);
            }

            inode.data.length = end_pos;
            write_dinode(disk, inode.sector, &inode.data);
        }

        let mut bounce = [0u8; SECTOR_SIZE];
        let mut bytes_written = 0;
        let mut size = buf.len();

        while size > 0 {
            let sector_ofs = off as usize % SECTOR_SIZE;

            let inode_left = inode.data.length.saturating_sub(off) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = size.min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }

            let sector = match byte_to_sector(fat, &inode.data, off) {
                Some(s) => s,
                None => break,
            };

            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let src = (&buf[bytes_written..bytes_written + SECTOR_SIZE])
                    .try_into()
                    .unwrap();
                disk.write(sector, src);
            } else {
                // Partial sector: the chunk either starts mid-sector or
                // stops short of its end, so the surrounding bytes have to
                // be read and kept.
                disk.read(sector, &mut bounce);
                bounce[sector_ofs..sector_ofs + chunk]
                    .copy_from_slice(&buf[bytes_written..bytes_written + chunk]);
                disk.write(sector, &bounce);
            }

            size -= chunk;
            off += chunk as u32;
            bytes_written += chunk;
        }
        bytes_written
    }

    /// Disables writes. May be called at most once per opener.
    pub(crate) fn inode_deny_write(&mut self, ip: &InodeRef) {
        let inode = self.itable.get_mut(ip);
        inode.deny_write_count += 1;
        assert!(
            inode.deny_write_count <= inode.open_count,
            "inode_deny_write"
        );
    }

    /// Re-enables writes. Must pair with a prior `inode_deny_write`.
    pub(crate) fn inode_allow_write(&mut self, ip: &InodeRef) {
        let inode = self.itable.get_mut(ip);
        assert!(inode.deny_write_count > 0, "inode_allow_write");
        assert!(
            inode.deny_write_count <= inode.open_count,
            "inode_allow_write"
        );
        inode.deny_write_count -= 1;
    }

    pub(crate) fn inode_len(&self, ip: &InodeRef) -> u32 {
        self.itable.get(ip).data.length
    }

    pub(crate) fn inode_is_dir(&self, ip: &InodeRef) -> bool {
        self.itable.get(ip).data.is_dir != 0
    }

    pub(crate) fn inode_is_link(&self, ip: &InodeRef) -> bool {
        self.itable.get(ip).data.is_link != 0
    }

    pub(crate) fn inode_open_count(&self, ip: &InodeRef) -> u32 {
        self.itable.get(ip).open_count
    }

    /// Copies out the NUL-terminated symlink target.
    pub(crate) fn inode_linkpath(&self, ip: &InodeRef) -> arrayvec::ArrayVec<u8, LINKPATH_MAX> {
        let inode = self.itable.get(ip);
        assert!(inode.data.is_link != 0, "inode_linkpath: not a link");
        let bytes = &inode.data.linkpath;
        let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
        let mut out = arrayvec::ArrayVec::new();
        out.try_extend_from_slice(&bytes[..len]).unwrap();
        out
    }

    /// Number of data clusters currently chained, for invariant checks.
    pub(crate) fn inode_chain_len(&self, ip: &InodeRef) -> u32 {
        let inode = self.itable.get(ip);
        let mut clst = inode.data.start;
        let mut n = 0;
        while clst != 0 && clst != EOC {
            n += 1;
            clst = self.fat.get(clst);
        }
        n
    }
}
