//! Closed address intervals and reachability windows for relative branches

/// A closed interval of addresses. Both endpoints are part of the range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    /// First address in the range
    pub start: usize,
    /// Last address in the range (inclusive)
    pub end: usize,
}

impl AddressRange {
    /// Creates a new range. `start` must not be greater than `end`.
    pub fn new(start: usize, end: usize) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Creates the range covering `len` bytes starting at `base`.
    ///
    /// An empty `len` yields the single-address range at `base`.
    pub fn with_len(base: usize, len: usize) -> Self {
        Self {
            start: base,
            end: base + len.saturating_sub(1),
        }
    }

    /// Returns whether `address` lies inside the range.
    pub fn contains(&self, address: usize) -> bool {
        self.start <= address && address <= self.end
    }

    /// Returns whether `other` lies entirely inside this range.
    pub fn contains_range(&self, other: &AddressRange) -> bool {
        self.contains(other.start) && self.contains(other.end)
    }

    /// Number of addresses covered by the range.
    pub fn span(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Computes the inclusive address window reachable by a signed-displacement
/// relative jump located at `target`.
///
/// Saturates instead of wrapping when `target` is close to either end of the
/// address space, so the result is always a valid window for the current
/// process (on 32-bit processes the ceiling is `usize::MAX`).
pub fn relative_jump_range(target: usize, max_displacement: usize) -> AddressRange {
    AddressRange {
        start: target.saturating_sub(max_displacement),
        end: target.saturating_add(max_displacement),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Containment at and around the endpoints
    fn test_contains() {
        let range = AddressRange::new(0x1000, 0x1fff);
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1fff));
        assert!(range.contains(0x1234));
        assert!(!range.contains(0xfff));
        assert!(!range.contains(0x2000));
    }

    #[test]
    fn test_contains_range() {
        let range = AddressRange::new(0x1000, 0x1fff);
        assert!(range.contains_range(&AddressRange::new(0x1000, 0x1fff)));
        assert!(range.contains_range(&AddressRange::new(0x1100, 0x1200)));
        assert!(!range.contains_range(&AddressRange::new(0xf00, 0x1200)));
        assert!(!range.contains_range(&AddressRange::new(0x1100, 0x2200)));
    }

    #[test]
    fn test_with_len() {
        let range = AddressRange::with_len(0x1000, 0x10);
        assert_eq!(range.start, 0x1000);
        assert_eq!(range.end, 0x100f);
        assert_eq!(range.span(), 0x10);
    }

    #[test]
    /// The jump window saturates at the ends of the address space
    fn test_jump_range_saturates() {
        let range = relative_jump_range(0x100, i32::MAX as usize);
        assert_eq!(range.start, 0);
        assert_eq!(range.end, 0x100 + i32::MAX as usize);

        let range = relative_jump_range(usize::MAX - 0x100, i32::MAX as usize);
        assert_eq!(range.end, usize::MAX);
    }

    #[test]
    /// Every address inside the window is within the displacement of the target
    fn test_jump_range_symmetry() {
        let target = 0x7fff_0000usize;
        let disp = 0x1000usize;
        let range = relative_jump_range(target, disp);
        assert!(range.contains(target));
        assert!(range.contains(target - disp));
        assert!(range.contains(target + disp));
        assert!(!range.contains(target - disp - 1));
        assert!(!range.contains(target + disp + 1));
    }
}
