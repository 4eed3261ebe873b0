//! fatvm: the storage and virtual-memory core of a teaching kernel.
//!
//! Two subsystems, tightly coupled through the kernel facade:
//!
//!   + A FAT-backed file system: cluster chains, one-sector inodes with an
//!     open-count cache, packed directories, and a path resolver that
//!     follows symlinks.
//!   + Demand-paged virtual memory: per-process supplemental page tables,
//!     a global FIFO frame pool, swap for anonymous pages, write-back for
//!     dirty file mappings, copy-on-fork, and user-stack growth.
//!
//! The system-call dispatcher, scheduler and loader are external; they talk
//! to [`kernel::Kernel`]. Block devices come in through [`disk::Disk`]; the
//! tests run everything against the RAM-backed implementation.

#![cfg_attr(not(test), no_std)]
//
// # Tries to deny the lints that matter for a kernel tree.
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(non_ascii_idents)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_extern_crates)]
#![deny(unused_import_braces)]
#![allow(dead_code)]

extern crate alloc;

pub mod disk;
pub mod error;
pub mod file;
pub mod fs;
pub mod kernel;
pub mod lock;
pub mod memlayout;
pub mod param;
pub mod proc;
pub mod vm;

pub use error::{KernelError, Result};
pub use kernel::Kernel;
