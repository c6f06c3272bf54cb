//! Range-constrained executable memory pools
//!
//! Adapted from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};

use super::search as region_search;
use super::AllocError;
use crate::range::AddressRange;

/// A chunk handed out by a pool.
pub type Allocation = SliceBox<u8>;

/// Minimum size of a newly mapped pool, so many small stubs share one map.
const POOL_CHUNK: usize = 0x10000;

/// The set of executable memory pools the process has mapped so far.
///
/// Pools are never unmapped: generated code may be reachable from in-flight
/// calls for the rest of the process lifetime.
pub struct ProximityAllocator {
    /// Memory pools used for allocations
    pub pools: Vec<SlicePool<u8>>,
}

impl ProximityAllocator {
    /// Creates an allocator with no pools mapped yet.
    pub fn new() -> Self {
        Self { pools: Vec::new() }
    }

    /// Allocates `size` bytes from a pool lying entirely inside `range`,
    /// mapping a new pool near `origin` if no existing one fits.
    pub fn allocate(
        &mut self,
        origin: usize,
        range: AddressRange,
        size: usize,
    ) -> Result<Allocation, AllocError> {
        if let Some(allocation) = self.allocate_existing(&range, size) {
            return Ok(allocation);
        }
        let pool = self.allocate_pool(&range, origin, size)?;
        let allocation = pool.alloc(size).ok_or(AllocError::OutOfMemory)?;
        self.pools.push(pool);
        Ok(allocation)
    }

    /// Tries to allocate a chunk from any existing in-range pool.
    fn allocate_existing(&mut self, range: &AddressRange, size: usize) -> Option<Allocation> {
        // Returns true if the pool's memory is entirely within the range
        let is_pool_in_range = |pool: &SlicePool<u8>| {
            let lower = pool.as_ptr() as usize;
            range.contains_range(&AddressRange::with_len(lower, pool.len()))
        };

        self.pools
            .iter_mut()
            .filter(|pool| is_pool_in_range(pool))
            .find_map(|pool| pool.alloc(size))
    }

    /// Maps a new pool close to `origin`, entirely inside `range`.
    fn allocate_pool(
        &mut self,
        range: &AddressRange,
        origin: usize,
        size: usize,
    ) -> Result<SlicePool<u8>, AllocError> {
        let chunk = size.max(POOL_CHUNK);
        let before = region_search::before(origin, *range);
        let after = region_search::after(origin, *range);

        // Try to allocate after the specified address first (mostly because
        // macOS cannot allocate memory before the process's address).
        after
            .chain(before)
            .find_map(|result| match result {
                Ok(address) => {
                    // the whole pool must stay inside the range, otherwise an
                    // allocation from its far end could be out of reach
                    let fits =
                        |len: usize| range.contains_range(&AddressRange::with_len(address, len));
                    if fits(chunk) {
                        Self::allocate_fixed_pool(address, chunk).ok().map(Ok)
                    } else if fits(size) {
                        Self::allocate_fixed_pool(address, size).ok().map(Ok)
                    } else {
                        None
                    }
                }
                Err(error) => Some(Err(AllocError::Region(error))),
            })
            .unwrap_or(Err(AllocError::OutOfRange))
    }

    /// Tries to map executable memory at the specified fixed address.
    fn allocate_fixed_pool(address: usize, size: usize) -> Result<SlicePool<u8>, AllocError> {
        mmap::MemoryMap::new(
            size,
            &[
                mmap::MapOption::MapReadable,
                mmap::MapOption::MapWritable,
                mmap::MapOption::MapExecutable,
                mmap::MapOption::MapAddr(address as *const _),
            ],
        )
        .map_err(|e| match e {
            mmap::MapError::ErrNoMem => AllocError::OutOfMemory,
            e => AllocError::from(e),
        })
        .map(SliceableMemoryMap)
        .map(SlicePool::new)
    }
}

impl Default for ProximityAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A wrapper for making a memory map compatible with `SlicePool`.
struct SliceableMemoryMap(mmap::MemoryMap);

impl SliceableMemoryMap {
    /// Get a slice of the memory map
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
    }

    /// Get a mutable slice of the memory map
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
    }
}

impl AsRef<[u8]> for SliceableMemoryMap {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for SliceableMemoryMap {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

unsafe impl Send for SliceableMemoryMap {}
unsafe impl Sync for SliceableMemoryMap {}
