//! # Patch
//!
//! A [`Patch`] is a pending, unconditional overwrite of process memory:
//! an address plus the bytes that belong there. Applying one is idempotent,
//! so patches can be re-applied freely; they are the unit in which hook
//! activation and foreign-hook repair are expressed.

use crate::mem::{self, MemoryError};
use crate::range::AddressRange;

/// A pending byte overwrite at a fixed address.
///
/// A patch is computed ahead of time (construction never touches memory) and
/// applied later. Applying the same patch twice leaves memory in the same
/// state as applying it once. A patch does *not* make the write atomic with
/// respect to threads currently executing at the target address; that window
/// is an accepted hazard of in-process patching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    /// Destination address of the overwrite
    address: usize,
    /// Bytes to place at the destination
    bytes: Vec<u8>,
}

impl Patch {
    /// Creates a patch writing `bytes` at `address`.
    pub fn new(address: usize, bytes: Vec<u8>) -> Self {
        Self { address, bytes }
    }

    /// Destination address of the patch.
    pub fn address(&self) -> usize {
        self.address
    }

    /// The bytes the patch will write.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The address range the patch overwrites.
    pub fn range(&self) -> AddressRange {
        AddressRange::with_len(self.address, self.bytes.len())
    }

    /// Applies the patch, lifting page protections for the write.
    ///
    /// # Safety
    ///
    /// The destination must be mapped memory not tracked by any Rust object,
    /// valid for the full length of the patch.
    pub unsafe fn apply(&self) -> Result<(), MemoryError> {
        mem::write_bytes(self.address, &self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Applying a patch writes exactly its bytes, nothing around them
    fn test_apply() {
        let data = vec![1u8, 2, 3, 4];
        let patch = Patch::new(data.as_ptr() as usize + 1, vec![9, 9]);
        unsafe { patch.apply().unwrap() };
        assert_eq!(data, [1, 9, 9, 4]);
    }

    #[test]
    /// Applying the same patch twice is the same as applying it once
    fn test_apply_idempotent() {
        let data = vec![0u8; 8];
        let patch = Patch::new(data.as_ptr() as usize, vec![1, 2, 3, 4]);
        unsafe { patch.apply().unwrap() };
        let after_once = data.clone();
        unsafe { patch.apply().unwrap() };
        assert_eq!(data, after_once);
        assert_eq!(&data[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_range() {
        let patch = Patch::new(0x1000, vec![0; 5]);
        assert_eq!(patch.range(), AddressRange::new(0x1000, 0x1004));
    }
}
