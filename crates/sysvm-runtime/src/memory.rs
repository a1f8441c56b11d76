//! Sandbox linear memory
//!
//! Each execution context owns one `SandboxMemory` exclusively. Generated code
//! reaches it through the base pointer and byte length published in the VM
//! context and bounds-checks every access against that length, so the
//! allocation is sized to exactly the current page count with no guard space.

use derive_more::{Display, Error, From};
use sysvm_core::{MAX_WASM_PAGES, MemoryLimits, WASM_PAGE_SIZE};

use crate::errors::EngineResourceError;

/// A `memory.grow` request was refused.
///
/// The contract observes this as `memory.grow` returning -1; it does not end
/// the execution.
#[derive(Clone, Copy, Debug, Display, Error, PartialEq, Eq)]
#[display("cannot grow memory from {current} by {delta} pages, maximum is {maximum}")]
pub struct MemoryGrowFailed {
    pub current: u32,
    pub delta: u32,
    pub maximum: u32,
}

#[derive(Debug, Display, Error, From)]
pub enum GrowError {
    #[display("{_0}")]
    Refused(MemoryGrowFailed),

    #[display("{_0}")]
    Resource(EngineResourceError),
}

#[derive(Debug)]
pub struct SandboxMemory {
    bytes: Vec<u8>,
    maximum_pages: u32,
}

impl SandboxMemory {
    /// Allocate the module's initial memory.
    ///
    /// The effective maximum is the module's declared maximum (or the 32-bit
    /// address space limit) clamped to the engine-wide `cap_pages`.
    pub fn new(limits: Option<MemoryLimits>, cap_pages: u32) -> Result<Self, EngineResourceError> {
        let Some(limits) = limits else {
            return Ok(Self {
                bytes: Vec::new(),
                maximum_pages: 0,
            });
        };

        let maximum_pages = limits
            .maximum
            .unwrap_or(MAX_WASM_PAGES)
            .min(MAX_WASM_PAGES)
            .min(cap_pages);
        let mut memory = Self {
            bytes: Vec::new(),
            maximum_pages: maximum_pages.max(limits.initial),
        };
        memory.resize(limits.initial)?;
        Ok(memory)
    }

    pub fn size_pages(&self) -> u32 {
        (self.bytes.len() as u64 / WASM_PAGE_SIZE) as u32
    }

    pub fn maximum_pages(&self) -> u32 {
        self.maximum_pages
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether growing by `delta` pages stays within the maximum
    pub fn check_grow(&self, delta: u32) -> Result<(), MemoryGrowFailed> {
        let current = self.size_pages();
        if u64::from(current) + u64::from(delta) > u64::from(self.maximum_pages) {
            return Err(MemoryGrowFailed {
                current,
                delta,
                maximum: self.maximum_pages,
            });
        }
        Ok(())
    }

    /// Grow by `delta` pages, returning the previous size in pages
    pub fn grow(&mut self, delta: u32) -> Result<u32, GrowError> {
        self.check_grow(delta)?;
        let current = self.size_pages();
        if delta > 0 {
            self.resize(current + delta)?;
        }
        Ok(current)
    }

    fn resize(&mut self, pages: u32) -> Result<(), EngineResourceError> {
        let bytes = u64::from(pages) * WASM_PAGE_SIZE;
        let additional = bytes as usize - self.bytes.len();
        self.bytes
            .try_reserve_exact(additional)
            .map_err(|_| EngineResourceError::SandboxMemory { bytes })?;
        self.bytes.resize(bytes as usize, 0);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Bounds-checked view of `len` bytes at `offset`
    pub fn read(&self, offset: u32, len: u32) -> Option<&[u8]> {
        let start = offset as usize;
        let end = start.checked_add(len as usize)?;
        self.bytes.get(start..end)
    }

    /// Bounds-checked copy of `data` to `offset`; nothing is written on failure
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Option<()> {
        let start = offset as usize;
        let end = start.checked_add(data.len())?;
        self.bytes.get_mut(start..end)?.copy_from_slice(data);
        Some(())
    }

    /// Base pointer published to generated code; changes whenever memory grows
    pub(crate) fn base_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(initial: u32, maximum: Option<u32>) -> Option<MemoryLimits> {
        Some(MemoryLimits { initial, maximum })
    }

    #[test]
    fn test_initial_memory_is_zeroed() {
        let memory = SandboxMemory::new(limits(1, Some(2)), 16).unwrap();
        assert_eq!(memory.size_pages(), 1);
        assert_eq!(memory.len(), 65_536);
        assert!(memory.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_grow_up_to_declared_maximum() {
        let mut memory = SandboxMemory::new(limits(1, Some(2)), 16).unwrap();
        assert_eq!(memory.grow(0).unwrap(), 1);
        assert_eq!(memory.grow(1).unwrap(), 1);
        assert_eq!(memory.size_pages(), 2);

        let err = memory.grow(1).unwrap_err();
        insta::assert_snapshot!(err.to_string(), @"cannot grow memory from 2 by 1 pages, maximum is 2");
        assert_eq!(memory.size_pages(), 2);
    }

    #[test]
    fn test_engine_cap_clamps_undeclared_maximum() {
        let mut memory = SandboxMemory::new(limits(0, None), 3).unwrap();
        assert_eq!(memory.maximum_pages(), 3);
        assert!(matches!(memory.grow(4), Err(GrowError::Refused(_))));
        assert_eq!(memory.grow(3).unwrap(), 0);
    }

    #[test]
    fn test_check_grow_does_not_allocate() {
        let memory = SandboxMemory::new(limits(1, Some(2)), 16).unwrap();
        assert!(memory.check_grow(1).is_ok());
        assert_eq!(
            memory.check_grow(u32::MAX),
            Err(MemoryGrowFailed {
                current: 1,
                delta: u32::MAX,
                maximum: 2
            })
        );
        assert_eq!(memory.size_pages(), 1);
    }

    #[test]
    fn test_module_without_memory() {
        let mut memory = SandboxMemory::new(None, 16).unwrap();
        assert!(memory.is_empty());
        assert!(memory.read(0, 1).is_none());
        assert!(matches!(memory.grow(1), Err(GrowError::Refused(_))));
        assert_eq!(memory.grow(0).unwrap(), 0);
    }

    #[test]
    fn test_host_access_is_bounds_checked() {
        let mut memory = SandboxMemory::new(limits(1, None), 16).unwrap();
        let last = (memory.len() - 1) as u32;
        assert!(memory.write(last, &[7]).is_some());
        assert_eq!(memory.read(last, 1), Some(&[7u8][..]));
        assert!(memory.write(last, &[1, 2]).is_none());
        assert_eq!(memory.read(last, 1), Some(&[7u8][..]));
        assert!(memory.read(u32::MAX, 2).is_none());
    }
}
