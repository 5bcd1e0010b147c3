//! Executable memory management for the JIT
//!
//! Delivers page-aligned regions that are first writable, then sealed as
//! read+execute. A region is never writable and executable at the same time
//! (W^X); sealing revokes write permission in the same `mprotect` call.

use std::ptr::NonNull;
use thiserror::Error;

/// Errors raised by the executable-memory allocator
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Anonymous page mapping failed
    #[error("failed to map {size} bytes of code memory (errno {errno})")]
    MapFailed {
        /// Requested size in bytes
        size: usize,
        /// Raw `errno` reported by the kernel
        errno: i32,
    },
    /// Changing page protection failed
    #[error("failed to change page protection (errno {errno})")]
    ProtectFailed {
        /// Raw `errno` reported by the kernel
        errno: i32,
    },
    /// A write was attempted after the region was sealed executable
    #[error("code region is sealed executable and no longer writable")]
    Sealed,
}

/// Returns the system page size in bytes
pub fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn round_up_to_page(bytes: usize) -> usize {
    let page = page_size();
    (bytes + page - 1) & !(page - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protection {
    ReadWrite,
    ReadExecute,
}

/// An owned, page-aligned code region.
///
/// Starts out writable and non-executable. [`CodeMemory::seal`] transitions it
/// to read+execute; afterwards the region stays mapped and executable until
/// drop. The instruction cache needs no explicit flush on x86-64, where stores
/// and the `mprotect` syscall already serialize against later fetches.
#[derive(Debug)]
pub struct CodeMemory {
    ptr: NonNull<u8>,
    size: usize,
    protection: Protection,
}

// The region is exclusively owned and the pointer never aliases other Rust
// objects; execution after sealing is inherently immutable.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

impl CodeMemory {
    /// Allocates at least `bytes` of writable, non-executable memory, rounded
    /// up to whole pages.
    pub fn allocate(bytes: usize) -> Result<Self, MemoryError> {
        let size = round_up_to_page(bytes.max(1));

        // SAFETY: anonymous private mapping; no file descriptor, no aliasing.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::MapFailed {
                size,
                errno: last_errno(),
            });
        }

        Ok(Self {
            // SAFETY: mmap success implies a non-null pointer.
            ptr: unsafe { NonNull::new_unchecked(ptr.cast::<u8>()) },
            size,
            protection: Protection::ReadWrite,
        })
    }

    /// Size of the mapping in bytes (a whole number of pages)
    pub fn size(&self) -> usize {
        self.size
    }

    /// Base address of the mapping
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Whether the region has been sealed read+execute
    pub fn is_executable(&self) -> bool {
        self.protection == Protection::ReadExecute
    }

    /// Mutable view of the region while it is still writable.
    ///
    /// Returns [`MemoryError::Sealed`] once [`seal`](Self::seal) has run.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], MemoryError> {
        if self.protection != Protection::ReadWrite {
            return Err(MemoryError::Sealed);
        }
        // SAFETY: the mapping is owned, writable, and `size` bytes long.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) })
    }

    /// Copies `code` to the start of the region. Fails if sealed or too small.
    pub fn write(&mut self, code: &[u8]) -> Result<(), MemoryError> {
        let slice = self.as_mut_slice()?;
        assert!(
            code.len() <= slice.len(),
            "code of {} bytes exceeds region of {} bytes",
            code.len(),
            slice.len()
        );
        slice[..code.len()].copy_from_slice(code);
        Ok(())
    }

    /// Transitions the whole region to read+execute, revoking write access.
    pub fn seal(&mut self) -> Result<(), MemoryError> {
        if self.protection == Protection::ReadExecute {
            return Ok(());
        }

        // SAFETY: the range [ptr, ptr+size) is an owned page-aligned mapping.
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr().cast::<libc::c_void>(),
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };

        if result != 0 {
            return Err(MemoryError::ProtectFailed { errno: last_errno() });
        }

        self.protection = Protection::ReadExecute;
        Ok(())
    }

    /// Entry address at `offset` bytes into the sealed region.
    ///
    /// Panics if the region has not been sealed; calling unsealed code would
    /// fault anyway, and this catches the misuse at the call site.
    pub fn entry(&self, offset: usize) -> *const u8 {
        assert!(
            self.protection == Protection::ReadExecute,
            "entry requested before the code region was sealed executable"
        );
        assert!(offset < self.size);
        // SAFETY: offset is within the mapping.
        unsafe { self.ptr.as_ptr().add(offset) }
    }
}

impl Drop for CodeMemory {
    fn drop(&mut self) {
        // SAFETY: the mapping is owned and unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.size);
        }
    }
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_rounds_to_pages() {
        let region = CodeMemory::allocate(1).unwrap();
        assert_eq!(region.size() % page_size(), 0);
        assert!(region.size() >= page_size());
    }

    #[test]
    fn test_write_then_seal_revokes_write() {
        let mut region = CodeMemory::allocate(64).unwrap();
        region.write(&[0xC3]).unwrap(); // ret
        assert!(!region.is_executable());

        region.seal().unwrap();
        assert!(region.is_executable());
        assert!(matches!(region.write(&[0x90]), Err(MemoryError::Sealed)));
        assert!(matches!(region.as_mut_slice(), Err(MemoryError::Sealed)));
    }

    #[test]
    fn test_sealed_region_is_callable() {
        let mut region = CodeMemory::allocate(16).unwrap();
        // mov eax, 42 ; ret
        region.write(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]).unwrap();
        region.seal().unwrap();

        let entry = region.entry(0);
        // SAFETY: the bytes above form a complete C-ABI function.
        let function: extern "C" fn() -> i32 = unsafe { std::mem::transmute(entry) };
        assert_eq!(function(), 42);
    }

    #[test]
    #[should_panic]
    fn test_entry_before_seal_panics() {
        let region = CodeMemory::allocate(16).unwrap();
        let _ = region.entry(0);
    }
}
