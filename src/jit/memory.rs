//! Page-granular memory for generated code.
//!
//! Code is copied into a private anonymous mapping while it is writable, then
//! the mapping is flipped to read+execute. It is never writable and
//! executable at the same time.

use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("failed to map {0} bytes")]
    MapFailed(usize),
    #[error("failed to change page protection")]
    ProtectFailed,
    #[error("cannot map an empty code region")]
    Empty,
    #[error("write of {len} bytes at {offset} overflows a {size}-byte region")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("region is already executable")]
    Sealed,
    #[error("executable memory is not supported on this platform")]
    Unsupported,
}

/// An mmap'd region. Unmapped on drop.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    /// Mapped size, a whole number of pages.
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map a writable region of at least `size` bytes.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::Empty);
        }
        let page_size = page_size();
        let size = (size + page_size - 1) & !(page_size - 1);
        let ptr = map(size)?;
        Ok(Self {
            ptr,
            size,
            executable: false,
        })
    }

    /// Map a region holding a copy of `code` and make it executable.
    pub fn with_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut memory = Self::new(code.len())?;
        memory.write(0, code)?;
        memory.make_executable()?;
        Ok(memory)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// The first `len` bytes of the region.
    pub fn bytes(&self, len: usize) -> &[u8] {
        let len = len.min(self.size);
        // SAFETY: the mapping is readable in both states and `len` is clamped.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), len) }
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::Sealed);
        }
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.size,
            });
        }
        // SAFETY: bounds checked above; the region is writable.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Flip the region to read+execute. It cannot be written afterwards.
    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        protect_executable(self.ptr, self.size)?;
        self.executable = true;
        Ok(())
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unmap(self.ptr, self.size);
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("ptr", &self.ptr)
            .field("size", &self.size)
            .field("executable", &self.executable)
            .finish()
    }
}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { 4096 }
}

#[cfg(not(unix))]
fn page_size() -> usize {
    4096
}

#[cfg(unix)]
fn map(size: usize) -> Result<NonNull<u8>, MemoryError> {
    // SAFETY: anonymous private mapping with no address hint.
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
        return Err(MemoryError::MapFailed(size));
    }
    NonNull::new(ptr as *mut u8).ok_or(MemoryError::MapFailed(size))
}

#[cfg(not(unix))]
fn map(_size: usize) -> Result<NonNull<u8>, MemoryError> {
    Err(MemoryError::Unsupported)
}

#[cfg(unix)]
fn protect_executable(ptr: NonNull<u8>, size: usize) -> Result<(), MemoryError> {
    // SAFETY: `ptr..ptr+size` is a mapping we own.
    let result = unsafe {
        libc::mprotect(
            ptr.as_ptr() as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };
    if result != 0 {
        return Err(MemoryError::ProtectFailed);
    }
    Ok(())
}

#[cfg(not(unix))]
fn protect_executable(_ptr: NonNull<u8>, _size: usize) -> Result<(), MemoryError> {
    Err(MemoryError::Unsupported)
}

#[cfg(unix)]
fn unmap(ptr: NonNull<u8>, size: usize) {
    // SAFETY: the mapping was created by `map` with this size.
    unsafe {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    }
}

#[cfg(not(unix))]
fn unmap(_ptr: NonNull<u8>, _size: usize) {}
