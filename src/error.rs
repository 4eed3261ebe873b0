//! Kernel error kinds.
//!
//! Every fallible entry point returns `Result<T>`. The system-call
//! dispatcher maps these to the documented user-visible sentinels (`false`,
//! `-1`, `NULL`); inside the kernel they propagate with `?`.

/// Error kinds surfaced by the file-system and VM entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// A path component does not exist.
    NoSuchPath,
    /// A non-final path component is not a directory.
    NotADirectory,
    /// A name is longer than a directory entry can hold.
    NameTooLong,
    /// The name already exists in the target directory.
    NameExists,
    /// Directory removal target still has entries besides `.` and `..`.
    DirectoryNotEmpty,
    /// Directory removal target is open elsewhere or is the process cwd.
    DirectoryBusy,
    /// The FAT has no free cluster.
    OutOfSpace,
    /// A table (inodes, processes, fds, frames) is exhausted.
    OutOfMemory,
    /// Write to a deny-write inode, or through a directory handle.
    ReadOnly,
    /// File descriptor is out of range or not open.
    InvalidHandle,
    /// User address is null, kernel-ranged, or unmapped for the access.
    InvalidAddress,
    /// The swap disk has no free slot.
    SwapFull,
    /// Symlink target cannot be resolved (dangling or too many levels).
    BrokenSymlink,
}

pub type Result<T> = core::result::Result<T, KernelError>;
