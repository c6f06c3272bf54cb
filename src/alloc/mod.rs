//! Near-address executable buffer allocation
//!
//! Relative control-flow instructions are shorter and faster than absolute
//! indirect ones, but only reach a bounded signed displacement from the
//! instruction itself. The [`BufferPool`] exists so every code-generation
//! step can request placement that is *guaranteed* reachable from a target
//! address instead of probabilistically reachable.
//!
//! The pool is an explicit resource manager owned by the hook engine and
//! passed by reference; there are no process-wide implicit singletons.

use std::fmt::Display;
use std::sync::Mutex;

use thiserror::Error;

use crate::range::{relative_jump_range, AddressRange};

pub mod proximity;
pub mod search;

use proximity::{Allocation, ProximityAllocator};

/// The furthest distance between a target and its generated code when no
/// explicit range is given: the reach of a rel32 branch (2 GiB).
pub const DEFAULT_MAX_DISTANCE: usize = 0x7fff_f000;

/// Errors that occur while creating near-address allocations
#[derive(Debug, Error)]
pub enum AllocError {
    /// Every pool in range is full and the allocator could not map a new one
    #[error("ran out of executable memory within the requested address range")]
    OutOfMemory,
    /// No free region exists inside the requested address range
    #[error("no executable memory could be mapped within the requested address range")]
    OutOfRange,
    /// Error while memory-mapping a region
    #[error("{0}")]
    Mmap(MmapError),
    /// Error while querying a memory region
    #[error("{0}")]
    Region(#[from] region::Error),
}

impl From<mmap::MapError> for AllocError {
    fn from(e: mmap::MapError) -> Self {
        AllocError::Mmap(MmapError(e))
    }
}

/// Newtype so the foreign map error can participate in `thiserror` chains.
#[derive(Debug)]
pub struct MmapError(pub mmap::MapError);

impl Display for MmapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MmapError {}

/// A thread-safe set of executable memory pools handing out near-address
/// buffers.
pub struct BufferPool {
    /// Distance limit applied when callers allocate by origin only
    max_distance: usize,
    /// The pools themselves, guarded for concurrent hook construction
    inner: Mutex<ProximityAllocator>,
}

impl BufferPool {
    /// Creates a pool with the default rel32 reach limit.
    pub fn new() -> Self {
        Self::with_max_distance(DEFAULT_MAX_DISTANCE)
    }

    /// Creates a pool with a custom distance limit for origin-based
    /// allocation.
    pub fn with_max_distance(max_distance: usize) -> Self {
        Self {
            max_distance,
            inner: Mutex::new(ProximityAllocator::new()),
        }
    }

    /// Allocates an executable buffer within the pool's distance limit of
    /// `origin`.
    pub fn allocate(&self, origin: usize, size: usize) -> Result<CodeBuffer, AllocError> {
        self.allocate_in_range(size, relative_jump_range(origin, self.max_distance), 1)
    }

    /// Allocates an executable buffer of `size` bytes whose every address
    /// lies inside `range`, with the buffer start aligned to `alignment`.
    pub fn allocate_in_range(
        &self,
        size: usize,
        range: AddressRange,
        alignment: usize,
    ) -> Result<CodeBuffer, AllocError> {
        debug_assert!(alignment.is_power_of_two());
        // over-allocate so an aligned start always exists inside the chunk
        let padded = size + alignment - 1;
        let origin = range.start + (range.end - range.start) / 2;
        let data = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .allocate(origin, range, padded)?;
        let base = data.as_ptr() as usize;
        let cursor = base.next_multiple_of(alignment) - base;
        log::trace!(
            "allocated {padded:#x} byte code buffer at {base:#x} (range {:#x}..{:#x})",
            range.start,
            range.end
        );
        Ok(CodeBuffer { data, cursor })
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned chunk of executable memory with a write cursor.
///
/// All code generation appends through this type; the address of every write
/// is known before the bytes land, which is what lets stubs refer to each
/// other with RIP-relative operands.
pub struct CodeBuffer {
    /// Backing allocation, exclusively owned
    data: Allocation,
    /// Offset of the next write
    cursor: usize,
}

impl CodeBuffer {
    /// Address of the next write.
    pub fn current(&self) -> usize {
        self.data.as_ptr() as usize + self.cursor
    }

    /// Remaining capacity in bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.cursor
    }

    /// Appends `bytes`, returning the address they were written to.
    ///
    /// Panics if the buffer is out of capacity: sizing is computed up front
    /// by the callers, so an overflow is a bug, not an environment failure.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        assert!(
            bytes.len() <= self.remaining(),
            "code buffer overflow: {} bytes left, {} needed",
            self.remaining(),
            bytes.len()
        );
        let address = self.current();
        self.data[self.cursor..self.cursor + bytes.len()].copy_from_slice(bytes);
        self.cursor += bytes.len();
        address
    }

    /// Advances the cursor to the next multiple of `alignment`, padding with
    /// nops so a fall-through stays executable.
    pub fn align(&mut self, alignment: usize) {
        debug_assert!(alignment.is_power_of_two());
        let misalign = self.current() % alignment;
        if misalign != 0 {
            self.write(&crate::code::nops(alignment - misalign));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Every address handed out lies within the requested jump range
    fn test_range_guarantee() {
        let pool = BufferPool::new();
        let target = tests_anchor as usize;
        for max_disp in [0x7fff_f000usize, 0x10_0000_0000] {
            let range = relative_jump_range(target, max_disp);
            let mut buffer = pool
                .allocate_in_range(64, range, 16)
                .expect("allocation within range");
            let address = buffer.write(&[0xc3]);
            assert!(range.contains(address));
            assert!(range.contains(address + buffer.remaining()));
            assert_eq!(address % 16, 0);
        }
    }

    #[test]
    /// Consecutive small allocations share one underlying pool
    fn test_pool_reuse() {
        let pool = BufferPool::new();
        let origin = tests_anchor as usize;
        let first = pool.allocate(origin, 32).unwrap();
        let second = pool.allocate(origin, 32).unwrap();
        let distance = first.current().abs_diff(second.current());
        assert!(distance < 0x20000);
    }

    #[test]
    /// Writes advance the cursor and land at the reported address
    fn test_buffer_writes() {
        let pool = BufferPool::new();
        let mut buffer = pool.allocate(tests_anchor as usize, 64).unwrap();
        let start = buffer.current();
        let first = buffer.write(&[1, 2, 3]);
        assert_eq!(first, start);
        assert_eq!(buffer.current(), start + 3);
        buffer.align(8);
        assert_eq!(buffer.current() % 8, 0);
        let read = unsafe { std::slice::from_raw_parts(start as *const u8, 3) };
        assert_eq!(read, &[1, 2, 3]);
    }

    #[test]
    /// An impossible window fails cleanly instead of allocating out of range
    fn test_out_of_range() {
        let pool = BufferPool::new();
        // single unmapped page at the very bottom of the address space
        let range = AddressRange::new(0x1000, 0x1fff);
        // range is far too small for the padded request
        assert!(pool.allocate_in_range(0x10000, range, 1).is_err());
    }

    /// Address anchor inside the test image.
    fn tests_anchor() {}
}
