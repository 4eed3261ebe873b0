//! File system implementation. Four layers:
//!   + FAT: cluster-chain allocator, loaded at mount and written at unmount.
//!   + Inodes: one-sector records, reading, writing, growth, open-count GC.
//!   + Directories: inodes with special contents (lists of other inodes!)
//!   + Names: paths like /usr/rtm/fs.rs with symlink substitution.
//!
//! Everything here runs under the single file-system lock owned by the
//! kernel facade; nothing below it synchronizes on its own.

use crate::disk::{Disk, SectorNo};
use crate::error::{KernelError, Result};
use crate::param::{DIR_DEFAULT_ENTRIES, NSYMLINK};

mod dir;
mod fat;
mod inode;
mod path;

pub use dir::{Dirent, DIRENT_SIZE};
pub use fat::{ClusterNo, Fat, EOC, ROOT_CLUSTER};
pub use inode::{bytes_to_sectors, Dinode, Inode, InodeRef, Itable};
pub use path::{FileName, FileNameBuf, Path};

pub struct FileSystem<D: Disk> {
    disk: D,
    fat: Fat,
    itable: Itable,
}

impl<D: Disk> FileSystem<D> {
    /// Formats `disk` and mounts the result: fresh FAT, root directory with
    /// `.` and `..` pointing at itself.
    pub fn format(mut disk: D) -> Result<Self> {
        let fat = Fat::format(&mut disk);
        let mut fs = Self {
            disk,
            fat,
            itable: Itable::new(),
        };

        let root = fs.root_sector();
        fs.dir_create(root, DIR_DEFAULT_ENTRIES)?;
        let dir = fs.inode_open(root)?;
        fs.dir_add(&dir, FileName::new(b".")?, root)?;
        fs.dir_add(&dir, FileName::new(b"..")?, root)?;
        fs.inode_close(dir);

        fs.sync_fat();
        log::debug!("fs: formatted, root at sector {}", root);
        Ok(fs)
    }

    /// Mounts an already-formatted disk.
    pub fn mount(mut disk: D) -> Self {
        let fat = Fat::open(&mut disk);
        Self {
            disk,
            fat,
            itable: Itable::new(),
        }
    }

    /// Writes the FAT back; the write-on-close of the metadata.
    pub fn unmount(&mut self) {
        self.sync_fat();
    }

    /// Unmounts and hands the device back.
    pub fn into_disk(mut self) -> D {
        self.sync_fat();
        self.disk
    }

    fn sync_fat(&mut self) {
        let Self { disk, fat, .. } = self;
        fat.close(disk);
    }

    /// Sector of the root directory inode.
    pub fn root_sector(&self) -> SectorNo {
        self.fat.cluster_to_sector(ROOT_CLUSTER)
    }

    /// Opens a fresh reference to the root directory.
    pub fn open_root(&mut self) -> Result<InodeRef> {
        self.inode_open(self.root_sector())
    }

    pub fn fat(&self) -> &Fat {
        &self.fat
    }

    pub fn itable(&self) -> &Itable {
        &self.itable
    }

    /// Resolves `path` to `(containing directory, leaf name)`. The leaf need
    /// not exist. With `deep`, a trailing symlink is dereferenced too.
    ///
    /// The directory reference is open; the caller closes it.
    pub(crate) fn nameiparent(
        &mut self,
        cwd: SectorNo,
        path: &Path,
        deep: bool,
    ) -> Result<(InodeRef, FileNameBuf)> {
        self.namex(cwd, path, deep, 0)
    }

    fn namex(
        &mut self,
        cwd: SectorNo,
        path: &Path,
        deep: bool,
        depth: usize,
    ) -> Result<(InodeRef, FileNameBuf)> {
        if depth > NSYMLINK {
            return Err(KernelError::BrokenSymlink);
        }

        let mut dir = if path.is_absolute() {
            self.open_root()?
        } else {
            self.inode_open(cwd)?
        };

        let (mut rest, first) = match path.skipelem() {
            Some(elem) => elem,
            None => {
                // "/" or "": the start directory itself.
                let mut name = FileNameBuf::new();
                name.push(b'.');
                return Ok((dir, name));
            }
        };
        let mut name = match first {
            Ok(n) => n.to_buf(),
            Err(e) => {
                self.inode_close(dir);
                return Err(e);
            }
        };

        loop {
            if rest.is_empty_string() {
                // Final component. It does not have to exist, but when it
                // names a symlink and the caller wants it dereferenced, the
                // resolution restarts at the stored target.
                if deep {
                    let leaf = FileName::new(&name).expect("namex: leaf");
                    if let Ok(ip) = self.dir_lookup(&dir, leaf) {
                        if self.inode_is_link(&ip) {
                            let target = self.inode_linkpath(&ip);
                            self.inode_close(ip);
                            self.inode_close(dir);
                            // SAFETY: linkpath bytes are NUL-trimmed.
                            let target = unsafe { Path::from_bytes(&target) };
                            return self.namex(cwd, target, deep, depth + 1);
                        }
                        self.inode_close(ip);
                    }
                }
                return Ok((dir, name));
            }

            // Intermediate component: must exist and lead to a directory.
            let leaf = FileName::new(&name).expect("namex: component");
            let ip = match self.dir_lookup(&dir, leaf) {
                Ok(ip) => ip,
                Err(e) => {
                    self.inode_close(dir);
                    return Err(e);
                }
            };

            if self.inode_is_link(&ip) {
                // Substitute the link target for this component and retry it
                // against the target's parent, keeping the remaining tokens.
                let target = self.inode_linkpath(&ip);
                self.inode_close(ip);
                self.inode_close(dir);
                // SAFETY: linkpath bytes are NUL-trimmed.
                let target = unsafe { Path::from_bytes(&target) };
                let (next_dir, next_name) = self.namex(cwd, target, deep, depth + 1)?;
                dir = next_dir;
                name = next_name;
                continue;
            }

            if !self.inode_is_dir(&ip) {
                self.inode_close(ip);
                self.inode_close(dir);
                return Err(KernelError::NotADirectory);
            }

            self.inode_close(dir);
            dir = ip;

            let (next_rest, next_name) = rest.skipelem().expect("namex: nonempty rest");
            rest = next_rest;
            name = match next_name {
                Ok(n) => n.to_buf(),
                Err(e) => {
                    self.inode_close(dir);
                    return Err(e);
                }
            };
        }
    }

    /// Creates a file of `initial_size` zeroed bytes at `path`.
    pub fn create(&mut self, cwd: SectorNo, path: &Path, initial_size: u32) -> Result<()> {
        let (dir, name) = self.nameiparent(cwd, path, true)?;
        let r = self.create_inner(&dir, &name, initial_size);
        self.inode_close(dir);
        r
    }

    fn create_inner(&mut self, dir: &InodeRef, name: &[u8], initial_size: u32) -> Result<()> {
        let name = FileName::new(name)?;
        let clst = self.fat.create_chain(0)?;
        let sector = self.fat.cluster_to_sector(clst);

        if let Err(e) = self.inode_create(sector, initial_size, false) {
            self.fat.remove_chain(clst, 0);
            return Err(e);
        }
        if let Err(e) = self.dir_add(dir, name, sector) {
            self.discard_inode(sector);
            return Err(e);
        }
        Ok(())
    }

    /// Unwinds a freshly created inode that never made it into a directory.
    fn discard_inode(&mut self, sector: SectorNo) {
        if let Ok(ip) = self.inode_open(sector) {
            self.inode_remove(&ip);
            self.inode_close(ip);
        }
    }

    /// Opens `path` and returns the inode reference.
    pub fn open(&mut self, cwd: SectorNo, path: &Path) -> Result<InodeRef> {
        let (dir, name) = self.nameiparent(cwd, path, true)?;
        let r = FileName::new(&name).and_then(|n| self.dir_lookup(&dir, n));
        self.inode_close(dir);
        r
    }

    /// Removes `path`. Open files stay usable until their last close; a
    /// directory must be empty, closed elsewhere, and not the process cwd.
    pub fn remove(&mut self, cwd: SectorNo, path: &Path) -> Result<()> {
        let (dir, name) = self.nameiparent(cwd, path, false)?;
        let r = self.remove_inner(&dir, &name, cwd);
        self.inode_close(dir);
        r
    }

    fn remove_inner(&mut self, dir: &InodeRef, name: &[u8], cwd: SectorNo) -> Result<()> {
        let name = FileName::new(name)?;
        let ip = self.dir_lookup(dir, name)?;

        if self.inode_is_dir(&ip) {
            let busy = self.inode_open_count(&ip) > 1 || ip.sector == cwd;
            let empty = self.dir_is_empty(&ip);
            self.inode_close(ip);
            if busy {
                return Err(KernelError::DirectoryBusy);
            }
            if !empty {
                return Err(KernelError::DirectoryNotEmpty);
            }
            self.dir_remove(dir, name)
        } else {
            self.inode_remove(&ip);
            self.inode_close(ip);
            self.dir_remove(dir, name)
        }
    }

    /// Creates a directory at `path` with `.` and `..` in place.
    pub fn mkdir(&mut self, cwd: SectorNo, path: &Path) -> Result<()> {
        let (dir, name) = self.nameiparent(cwd, path, true)?;
        let r = self.mkdir_inner(&dir, &name);
        self.inode_close(dir);
        r
    }

    fn mkdir_inner(&mut self, dir: &InodeRef, name: &[u8]) -> Result<()> {
        let name = FileName::new(name)?;
        let clst = self.fat.create_chain(0)?;
        let sector = self.fat.cluster_to_sector(clst);

        if let Err(e) = self.dir_create(sector, DIR_DEFAULT_ENTRIES) {
            self.fat.remove_chain(clst, 0);
            return Err(e);
        }
        if let Err(e) = self.dir_add(dir, name, sector) {
            self.discard_inode(sector);
            return Err(e);
        }

        let new_dir = match self.inode_open(sector) {
            Ok(ip) => ip,
            Err(e) => {
                let _ = self.dir_remove(dir, name);
                return Err(e);
            }
        };
        let dots = self
            .dir_add(&new_dir, FileName::new(b".")?, sector)
            .and_then(|_| self.dir_add(&new_dir, FileName::new(b"..")?, dir.sector));
        self.inode_close(new_dir);
        if let Err(e) = dots {
            let _ = self.dir_remove(dir, name);
            return Err(e);
        }
        Ok(())
    }

    /// Resolves `path` to a directory for use as a new cwd. The returned
    /// reference is open; the caller owns it.
    pub fn chdir(&mut self, cwd: SectorNo, path: &Path) -> Result<InodeRef> {
        let (dir, name) = self.nameiparent(cwd, path, true)?;
        let r = FileName::new(&name).and_then(|n| self.dir_lookup(&dir, n));
        self.inode_close(dir);
        let ip = r?;
        if !self.inode_is_dir(&ip) {
            self.inode_close(ip);
            return Err(KernelError::NotADirectory);
        }
        Ok(ip)
    }

    /// Creates a symlink at `linkpath` whose body is `target`. The target is
    /// stored verbatim; it is resolved at traversal time and may dangle.
    pub fn symlink(&mut self, cwd: SectorNo, target: &[u8], linkpath: &Path) -> Result<()> {
        let (dir, name) = self.nameiparent(cwd, linkpath, true)?;
        let r = self.symlink_inner(&dir, target, &name);
        self.inode_close(dir);
        r
    }

    fn symlink_inner(&mut self, dir: &InodeRef, target: &[u8], name: &[u8]) -> Result<()> {
        let name = FileName::new(name)?;
        let clst = self.fat.create_chain(0)?;
        let sector = self.fat.cluster_to_sector(clst);

        if let Err(e) = self.inode_create_link(sector, target) {
            self.fat.remove_chain(clst, 0);
            return Err(e);
        }
        if let Err(e) = self.dir_add(dir, name, sector) {
            self.discard_inode(sector);
            return Err(e);
        }
        Ok(())
    }
}
