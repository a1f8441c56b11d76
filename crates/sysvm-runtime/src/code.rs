//! Executable memory for compiled code
//!
//! Code is written into a read-write mapping, the instruction cache is
//! synchronized, and the mapping is then flipped to read-execute. The region
//! is never writable and executable at the same time.

use std::ptr;

use crate::errors::EngineResourceError;

/// An immutable, executable copy of an artifact's machine code
#[derive(Debug)]
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

// The region is read-only after construction.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    pub fn new(code: &[u8]) -> Result<Self, EngineResourceError> {
        if code.is_empty() {
            return Ok(Self {
                ptr: ptr::null_mut(),
                len: 0,
            });
        }

        let ptr = alloc_region(code.len())?;
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
        if let Err(err) = finalize_region(ptr, code.len()) {
            unsafe { free_region(ptr, code.len()) };
            return Err(err);
        }
        Ok(Self {
            ptr,
            len: code.len(),
        })
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of `offset` within the region, if in bounds
    pub fn address(&self, offset: u32) -> Option<*const u8> {
        let offset = offset as usize;
        (offset < self.len).then(|| unsafe { self.ptr.add(offset) as *const u8 })
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
        }
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { free_region(self.ptr, self.len) };
        }
    }
}

fn map_error(bytes: usize, reason: impl std::fmt::Display) -> EngineResourceError {
    EngineResourceError::CodeMemory {
        bytes,
        reason: reason.to_string(),
    }
}

#[cfg(unix)]
fn alloc_region(size: usize) -> Result<*mut u8, EngineResourceError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(map_error(size, std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn finalize_region(ptr: *mut u8, size: usize) -> Result<(), EngineResourceError> {
    flush_icache(ptr, size);
    let rc = unsafe {
        libc::mprotect(
            ptr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_EXEC,
        )
    };
    if rc != 0 {
        return Err(map_error(size, std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(unix)]
unsafe fn free_region(ptr: *mut u8, size: usize) {
    unsafe {
        libc::munmap(ptr as *mut libc::c_void, size);
    }
}

#[cfg(all(unix, target_arch = "aarch64", not(target_vendor = "apple")))]
fn flush_icache(ptr: *mut u8, size: usize) {
    unsafe extern "C" {
        fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe {
        let begin = ptr as *mut libc::c_char;
        __clear_cache(begin, begin.add(size));
    }
}

#[cfg(all(unix, target_arch = "aarch64", target_vendor = "apple"))]
fn flush_icache(ptr: *mut u8, size: usize) {
    unsafe extern "C" {
        fn sys_icache_invalidate(start: *mut libc::c_void, len: usize);
    }
    unsafe { sys_icache_invalidate(ptr as *mut libc::c_void, size) };
}

#[cfg(all(unix, not(target_arch = "aarch64")))]
fn flush_icache(_ptr: *mut u8, _size: usize) {}

#[cfg(windows)]
fn alloc_region(size: usize) -> Result<*mut u8, EngineResourceError> {
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE, VirtualAlloc,
    };

    let ptr = unsafe { VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) };
    if ptr.is_null() {
        return Err(map_error(size, std::io::Error::last_os_error()));
    }
    Ok(ptr as *mut u8)
}

#[cfg(windows)]
fn finalize_region(ptr: *mut u8, size: usize) -> Result<(), EngineResourceError> {
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::Memory::{PAGE_EXECUTE_READ, VirtualProtect};
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    let mut old_protect = 0;
    let ok = unsafe {
        VirtualProtect(
            ptr as *const core::ffi::c_void,
            size,
            PAGE_EXECUTE_READ,
            &mut old_protect,
        )
    };
    if ok == 0 {
        return Err(map_error(size, std::io::Error::last_os_error()));
    }
    unsafe {
        FlushInstructionCache(GetCurrentProcess(), ptr as *const core::ffi::c_void, size);
    }
    Ok(())
}

#[cfg(windows)]
unsafe fn free_region(ptr: *mut u8, _size: usize) {
    use windows_sys::Win32::System::Memory::{MEM_RELEASE, VirtualFree};

    unsafe {
        VirtualFree(ptr as *mut core::ffi::c_void, 0, MEM_RELEASE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_copied() {
        let code = [0xc3u8, 0x90, 0x90, 0x90];
        let memory = ExecutableMemory::new(&code).unwrap();
        assert_eq!(memory.as_slice(), &code);
        assert!(memory.address(3).is_some());
        assert!(memory.address(4).is_none());
    }

    #[test]
    fn test_empty_code_maps_nothing() {
        let memory = ExecutableMemory::new(&[]).unwrap();
        assert!(memory.is_empty());
        assert!(memory.as_slice().is_empty());
        assert!(memory.address(0).is_none());
    }
}
