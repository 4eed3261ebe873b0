/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Open files per process. Slots 0 and 1 are reserved for the console.
pub const FD_MAX: usize = 130;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Sector size of every block device.
pub const SECTOR_SIZE: usize = 512;

/// Page size.
pub const PGSIZE: usize = 4096;

/// Sectors per page, for swap-slot addressing.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Maximum number of swap slots the swap table tracks.
pub const NSWAP: usize = 1024;

/// Maximum length of a directory entry name.
pub const DIRSIZ: usize = 14;

/// Maximum length of a symlink target, including the NUL terminator.
pub const LINKPATH_MAX: usize = 492;

/// Maximum number of symlink substitutions in a single path resolution.
pub const NSYMLINK: usize = 8;

/// Directory entries preallocated by mkdir and format.
pub const DIR_DEFAULT_ENTRIES: u32 = 16;

/// Maximum file path name.
pub const MAXPATH: usize = 128;
