use arrayvec::ArrayVec;
use cstr_core::CStr;

use crate::error::{KernelError, Result};
use crate::param::DIRSIZ;

/// Owned copy of a file name, at most `DIRSIZ` bytes.
pub type FileNameBuf = ArrayVec<u8, DIRSIZ>;

/// A borrowed file name.
#[derive(PartialEq, Debug)]
#[repr(transparent)]
pub struct FileName {
    // Invariant:
    // - The slice contains no NUL characters and no '/'.
    // - The slice is not longer than DIRSIZ.
    inner: [u8],
}

impl FileName {
    /// Checks that `bytes` fits in a directory entry and wraps it.
    pub fn new(bytes: &[u8]) -> Result<&Self> {
        if bytes.len() > DIRSIZ {
            return Err(KernelError::NameTooLong);
        }
        // SAFETY: `&FileName` is layout-compatible with `[u8]` because of its
        // attribute `#[repr(transparent)]`.
        Ok(unsafe { &*(bytes as *const [u8] as *const Self) })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn to_buf(&self) -> FileNameBuf {
        let mut buf = FileNameBuf::new();
        buf.try_extend_from_slice(&self.inner).expect("FileName");
        buf
    }

    /// `.` and `..` never name ordinary entries.
    pub fn is_dot(&self) -> bool {
        &self.inner == b"."
    }

    pub fn is_dot_dot(&self) -> bool {
        &self.inner == b".."
    }
}

/// A `/`-separated path.
#[repr(transparent)]
pub struct Path {
    // Invariant: the slice contains no NUL characters.
    inner: [u8],
}

impl Path {
    pub fn new(path: &str) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of its
        // attribute `#[repr(transparent)]`, and `str` contains no NUL.
        unsafe { &*(path.as_bytes() as *const [u8] as *const Self) }
    }

    /// Entry point for the system-call dispatcher, which hands paths over as
    /// C strings.
    pub fn from_cstr(cstr: &CStr) -> &Self {
        // SAFETY: CStr::to_bytes contains no NUL.
        unsafe { Self::from_bytes(cstr.to_bytes()) }
    }

    /// # Safety
    ///
    /// `bytes` must not contain any NUL bytes.
    pub unsafe fn from_bytes(bytes: &[u8]) -> &Self {
        // SAFETY: `&Path` is layout-compatible with `[u8]` because of its
        // attribute `#[repr(transparent)]`. Also, the slice does not contain
        // NUL according to the safety condition of this method.
        unsafe { &*(bytes as *const [u8] as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Splits off the leading component.
    ///
    /// Slash runs on either side of the component are discarded, so the
    /// remainder comes back ready for the next call and an empty remainder
    /// means the component was the last one. `None` when nothing but
    /// slashes (or nothing at all) is left. The component itself is handed
    /// through the `FileName` length check, so an over-long token surfaces
    /// here rather than at the directory layer.
    pub fn skipelem(&self) -> Option<(&Self, Result<&FileName>)> {
        let trimmed = trim_slashes(&self.inner);
        if trimmed.is_empty() {
            return None;
        }
        let end = trimmed
            .iter()
            .position(|b| *b == b'/')
            .unwrap_or(trimmed.len());
        let (component, tail) = trimmed.split_at(end);

        // SAFETY: `tail` is a subslice of `self.inner`, which contains no
        // NUL bytes.
        let rest = unsafe { Self::from_bytes(trim_slashes(tail)) };
        Some((rest, FileName::new(component)))
    }

    /// A path starting with `/` resolves from the root directory rather
    /// than the process cwd.
    pub fn is_absolute(&self) -> bool {
        self.inner.first() == Some(&b'/')
    }

    pub fn is_empty_string(&self) -> bool {
        self.inner.is_empty()
    }
}

fn trim_slashes(bytes: &[u8]) -> &[u8] {
    let skip = bytes.iter().take_while(|b| **b == b'/').count();
    &bytes[skip..]
}
