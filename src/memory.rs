//! Executable memory management using mmap.
//!
//! This module provides a safe abstraction over OS-level memory mapping
//! for allocating the region the JIT assembles into. The region follows a
//! W^X discipline: pages are flipped to writable one at a time while code
//! is being written, and the whole region is flipped back to executable
//! before any generated code runs.

use std::ptr::NonNull;

/// Error type for memory operations.
#[derive(Debug)]
pub enum MemoryError {
    AllocationFailed,
    ProtectionFailed,
    InvalidSize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "memory allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "memory protection change failed"),
            MemoryError::InvalidSize => write!(f, "invalid memory size"),
        }
    }
}

impl std::error::Error for MemoryError {}

/// A block of memory allocated via mmap, intended to hold machine code.
///
/// The memory starts out writable. The code blocks carved out of it flip
/// protection with [`mark_writable`] and [`mark_executable`].
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
}

impl ExecutableMemory {
    /// Allocate a new block of memory with the given size, rounded up to
    /// the page size. The memory is initially writable but not executable.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize);
        }

        // Round up to page size
        let page_size = Self::page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        let ptr = Self::mmap_alloc(aligned_size)?;

        Ok(Self {
            ptr,
            size: aligned_size,
        })
    }

    /// Get the page size for the current system.
    pub fn page_size() -> usize {
        #[cfg(unix)]
        {
            unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    /// Allocate memory using mmap.
    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        use std::ptr;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }

        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        // Fallback for non-Unix systems: use regular allocation
        // Note: This won't actually be executable on most systems
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize)?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Get a mutable pointer to the start of the region.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the size of the allocated memory.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(self.size, Self::page_size())
                .expect("invalid layout");
            unsafe {
                std::alloc::dealloc(self.ptr.as_ptr(), layout);
            }
        }
    }
}

// ExecutableMemory owns its mapping; the code blocks carved out of it are
// only reachable through the global JIT lock.
unsafe impl Send for ExecutableMemory {}

/// Make `len` bytes starting at `ptr` readable and writable.
/// `ptr` must be page-aligned and inside a mapping owned by the caller.
#[cfg(unix)]
pub fn mark_writable(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    protect(ptr, len, libc::PROT_READ | libc::PROT_WRITE)
}

/// Make `len` bytes starting at `ptr` readable and executable.
#[cfg(unix)]
pub fn mark_executable(ptr: *mut u8, len: usize) -> Result<(), MemoryError> {
    protect(ptr, len, libc::PROT_READ | libc::PROT_EXEC)
}

#[cfg(unix)]
fn protect(ptr: *mut u8, len: usize, prot: libc::c_int) -> Result<(), MemoryError> {
    let result = unsafe { libc::mprotect(ptr as *mut libc::c_void, len, prot) };
    if result != 0 {
        return Err(MemoryError::ProtectionFailed);
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn mark_writable(_ptr: *mut u8, _len: usize) -> Result<(), MemoryError> {
    Ok(())
}

#[cfg(not(unix))]
pub fn mark_executable(_ptr: *mut u8, _len: usize) -> Result<(), MemoryError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_memory() {
        let mem = ExecutableMemory::new(4096).unwrap();
        assert!(mem.size() >= 4096);
    }

    #[test]
    fn test_rounds_up_to_page_size() {
        let mem = ExecutableMemory::new(1).unwrap();
        assert_eq!(mem.size() % ExecutableMemory::page_size(), 0);
    }

    #[test]
    fn test_write_then_seal() {
        let mem = ExecutableMemory::new(4096).unwrap();
        unsafe {
            // NOP sled
            for i in 0..16 {
                mem.as_mut_ptr().add(i).write(0x90);
            }
        }
        mark_executable(mem.as_mut_ptr(), mem.size()).unwrap();
        // Flipping a page back to writable must succeed as well
        mark_writable(mem.as_mut_ptr(), ExecutableMemory::page_size()).unwrap();
    }
}
