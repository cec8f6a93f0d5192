//! Shared memory mappings backing the channel
//!
//! A segment is either a file mapped `MAP_SHARED` (the cross-process case:
//! the service creates it, producers open it) or an anonymous shared mapping
//! for producers living in the service's own process.

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

/// A shared, read/write memory mapping
pub struct SharedSegment {
    base: NonNull<c_void>,
    len: usize,
    path: Option<PathBuf>,
    // Keeps the descriptor alive for the lifetime of the mapping
    _file: Option<File>,
}

// The mapping is plain shared memory. All concurrent access to it goes through
// the atomics of the ring header and slot stamps.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create (or truncate) `path` with `len` zeroed bytes and map it
    pub fn create(path: &Path, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let base = map(Some(&file), len)?;
        Ok(Self {
            base,
            len,
            path: Some(path.to_path_buf()),
            _file: Some(file),
        })
    }

    /// Map an existing segment file in full
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is empty", path.display()),
            ));
        }
        let base = map(Some(&file), len)?;
        Ok(Self {
            base,
            len,
            path: Some(path.to_path_buf()),
            _file: Some(file),
        })
    }

    /// Anonymous zeroed mapping, shared with forked children only
    pub fn anonymous(len: usize) -> io::Result<Self> {
        let base = map(None, len)?;
        Ok(Self {
            base,
            len,
            path: None,
            _file: None,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr().cast::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr(), self.len);
        }
    }
}

fn map(file: Option<&File>, len: usize) -> io::Result<NonNull<c_void>> {
    if len == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "cannot map an empty segment",
        ));
    }
    let (flags, fd) = match file {
        Some(file) => (libc::MAP_SHARED, file.as_raw_fd()),
        None => (libc::MAP_SHARED | libc::MAP_ANONYMOUS, -1),
    };
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr).ok_or_else(|| io::Error::other("mmap returned null"))
}
