//! Backing memory for a mailbox.
//!
//! A mailbox lives either in a zeroed heap allocation (peers in one process)
//! or in a `MAP_SHARED` file mapping, e.g. under `/dev/shm`, that several
//! processes can map at once.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// Alignment of heap-backed regions.
const REGION_ALIGN: usize = 64;

/// Memory holding a mailbox.
pub enum Region {
    Heap(HeapRegion),
    Mapped(MmapRegion),
}

impl Region {
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        match self {
            Self::Heap(r) => r.ptr,
            Self::Mapped(r) => r.base,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Heap(r) => r.layout.size(),
            Self::Mapped(r) => r.len,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Heap(_) => None,
            Self::Mapped(r) => Some(&r.path),
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("len", &self.len())
            .field("path", &self.path())
            .finish()
    }
}

// =============================================================================
// Heap
// =============================================================================

/// Zeroed, 64-byte aligned heap allocation.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is plain memory; concurrent access goes through
// atomics in the mailslot headers.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new_zeroed(len: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len.max(1), REGION_ALIGN)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: layout has a nonzero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "cannot allocate mailbox region")
        })?;
        Ok(Self { ptr, layout })
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// =============================================================================
// File Mapping
// =============================================================================

/// Shared file mapping.
pub struct MmapRegion {
    base: NonNull<u8>,
    len: usize,
    path: PathBuf,
    /// Kept open for the lifetime of the mapping.
    _file: File,
}

// SAFETY: MmapRegion is Send + Sync because the memory is synchronized via atomics.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    /// Create (or truncate) a file of `len` bytes and map it.
    pub fn create(path: impl AsRef<Path>, len: usize) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        Self::map(file, len, path)
    }

    /// Map an existing file in full.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        Self::map(file, len, path)
    }

    fn map(file: File, len: usize, path: &Path) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map an empty mailbox file",
            ));
        }

        // SAFETY: mapping a regular file we hold open; the result is checked.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let base = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;

        Ok(Self {
            base,
            len,
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        // SAFETY: base and len were valid when created.
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_heap_region_is_zeroed_and_aligned() {
        let region = Region::Heap(HeapRegion::new_zeroed(4096).unwrap());
        assert_eq!(region.len(), 4096);
        assert_eq!(region.base().as_ptr() as usize % REGION_ALIGN, 0);
        let bytes = unsafe { std::slice::from_raw_parts(region.base().as_ptr(), region.len()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_mapped_region_is_shared() {
        let path = std::env::temp_dir().join(format!("ivshmsg_region_{}.shm", std::process::id()));

        let a = MmapRegion::create(&path, 8192).unwrap();
        let b = MmapRegion::open(&path).unwrap();
        assert_eq!(b.len, 8192);

        unsafe { a.base.as_ptr().add(100).write(0xAB) };
        assert_eq!(unsafe { b.base.as_ptr().add(100).read() }, 0xAB);

        drop(a);
        drop(b);
        std::fs::remove_file(&path).ok();
    }
}
