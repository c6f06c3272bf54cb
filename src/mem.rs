//! The unsafe boundary: raw reads and writes of process memory
//!
//! Everything above this module works on byte buffers and addresses as plain
//! values; only the primitives here (and the generated stubs themselves) touch
//! raw pointers.

use std::ptr;

use region::Protection;
use thiserror::Error;

/// Errors raised by the raw memory primitives
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The requested range is not mapped readable memory
    #[error("address range {address:#x}..{address:#x}+{len:#x} is not mapped readable memory")]
    Unmapped {
        /// Start of the faulting range
        address: usize,
        /// Length of the faulting range
        len: usize,
    },
    /// Error while changing page protections for a write
    #[error("error setting memory protections")]
    Protection(#[from] region::Error),
}

/// Reads `len` bytes of process memory starting at `address`.
///
/// # Safety
///
/// `address` must be valid, mapped memory for `len` bytes. Use
/// [`LiveMemory`] for a variant that queries the region map first.
pub unsafe fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    ptr::copy_nonoverlapping(address as *const u8, buf.as_mut_ptr(), len);
    buf
}

/// Writes `bytes` to process memory at `address`, lifting page protections
/// for the duration of the write and restoring them afterwards.
///
/// # Safety
///
/// `address` must be mapped memory for the full length of `bytes`, and no
/// Rust-tracked object may alias the destination. Writing over bytes another
/// thread is currently executing is an accepted hazard, not made safe here.
pub unsafe fn write_bytes(address: usize, bytes: &[u8]) -> Result<(), MemoryError> {
    let _guard = region::protect_with_handle(address as *const u8, bytes.len(), Protection::all())?;
    ptr::copy(bytes.as_ptr(), address as *mut u8, bytes.len());
    Ok(())
}

/// Returns whether `[address, address + len)` is mapped and readable.
pub fn is_readable(address: usize, len: usize) -> bool {
    if len == 0 {
        return false;
    }
    let Ok(regions) = region::query_range(address as *const u8, len) else {
        return false;
    };
    regions
        .map(|r| match r {
            Ok(region) => region.protection().contains(Protection::READ),
            Err(_) => false,
        })
        .all(|readable| readable)
}

/// Read-only view of some address space, the seam between the function
/// patcher's search heuristics and the process's actual memory.
///
/// Tests substitute an in-memory implementation; production code uses
/// [`LiveMemory`].
pub trait MemorySource {
    /// Reads `len` bytes at `address`, or `None` if the range is not readable.
    fn read(&self, address: usize, len: usize) -> Option<Vec<u8>>;

    /// Reads a little-endian pointer-sized value at `address`.
    fn read_ptr(&self, address: usize) -> Option<usize> {
        let bytes = self.read(address, std::mem::size_of::<usize>())?;
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        raw.copy_from_slice(&bytes);
        Some(usize::from_le_bytes(raw))
    }
}

/// [`MemorySource`] backed by the process's own address space.
///
/// Every read is preceded by a region query, so unmapped probe addresses
/// produced by the search heuristics degrade to `None` instead of faulting.
#[derive(Debug, Default, Clone, Copy)]
pub struct LiveMemory;

impl MemorySource for LiveMemory {
    fn read(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        if !is_readable(address, len) {
            return None;
        }
        // Safety: the range was just verified mapped and readable
        Some(unsafe { read_bytes(address, len) })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::MemorySource;

    /// A fake address space for exercising search heuristics without touching
    /// real memory.
    pub struct FakeMemory {
        /// Base address the buffer pretends to live at
        pub base: usize,
        /// Backing bytes
        pub bytes: Vec<u8>,
    }

    impl MemorySource for FakeMemory {
        fn read(&self, address: usize, len: usize) -> Option<Vec<u8>> {
            let offset = address.checked_sub(self.base)?;
            let end = offset.checked_add(len)?;
            self.bytes.get(offset..end).map(|s| s.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Reads on our own data return the data; unmapped probes return None
    fn test_live_memory() {
        let data = vec![1u8, 2, 3, 4];
        let read = LiveMemory
            .read(data.as_ptr() as usize, data.len())
            .expect("own allocation must be readable");
        assert_eq!(read, data);
    }

    #[test]
    fn test_is_readable_rejects_null() {
        assert!(!is_readable(0, 16));
        assert!(!is_readable(0x10, 0));
    }

    #[test]
    /// Raw write/readback round trip against heap memory we own
    fn test_write_bytes() {
        let mut data = vec![0u8; 8];
        unsafe { write_bytes(data.as_mut_ptr() as usize, &[9, 8, 7]).unwrap() };
        assert_eq!(&data[..4], &[9, 8, 7, 0]);
    }

    #[test]
    fn test_read_ptr() {
        let value = 0xdead_beefusize;
        let bytes = value.to_le_bytes().to_vec();
        let source = testing::FakeMemory {
            base: 0x4000,
            bytes,
        };
        assert_eq!(source.read_ptr(0x4000), Some(value));
        assert_eq!(source.read_ptr(0x4001), None);
    }
}
