//! Searches memory for free regions close to a specified address
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

use crate::range::AddressRange;

/// Returns an iterator over free addresses at or after `origin`, staying
/// inside `range`.
pub fn after(
    origin: usize,
    range: AddressRange,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::After)
}

/// Returns an iterator over free addresses before `origin`, staying inside
/// `range`.
pub fn before(
    origin: usize,
    range: AddressRange,
) -> impl Iterator<Item = Result<usize, region::Error>> {
    FreeRegionIter::new(origin, range, SearchDirection::Before)
}

/// Direction for the region search.
enum SearchDirection {
    /// Walk towards lower addresses
    Before,
    /// Walk towards higher addresses
    After,
}

/// An iterator walking the process's region map looking for unmapped gaps.
struct FreeRegionIter {
    /// Window the search must stay inside
    range: AddressRange,
    /// Direction we're searching
    search: SearchDirection,
    /// Current location in the search
    current: usize,
}

impl FreeRegionIter {
    /// Creates a new iterator for free regions.
    fn new(origin: usize, range: AddressRange, search: SearchDirection) -> Self {
        FreeRegionIter {
            range,
            current: origin,
            search,
        }
    }
}

impl Iterator for FreeRegionIter {
    type Item = Result<usize, region::Error>;

    /// Returns the next free address in the search direction.
    fn next(&mut self) -> Option<Self::Item> {
        let page_size = region::page::size();

        while self.current > 0 && self.range.contains(self.current) {
            match region::query(self.current as *const ()) {
                Ok(region) => {
                    // mapped: step over the whole region
                    self.current = match self.search {
                        SearchDirection::Before => {
                            region.as_range().start.saturating_sub(page_size)
                        }
                        SearchDirection::After => region.as_range().end,
                    }
                }
                Err(error) => {
                    // Check whether the region is free, otherwise return the error
                    let result = Some(match error {
                        region::Error::UnmappedRegion => Ok(self.current),
                        inner => Err(inner),
                    });

                    // Adjust the offset for repeated calls.
                    self.current = match self.search {
                        SearchDirection::Before => self.current.saturating_sub(page_size),
                        SearchDirection::After => self.current + page_size,
                    };

                    return result;
                }
            }
        }

        None
    }
}
