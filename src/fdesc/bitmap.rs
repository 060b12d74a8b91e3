//! Descriptor Occupancy Bitmap
//!
//! One bit per descriptor, `NDENTRIES` descriptors per word. Bits at or beyond
//! the table size are always clear.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::{nd_slots, NDENTRIES};

/// Occupancy map of a descriptor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdMap {
    words: Vec<u64>,
}

impl FdMap {
    /// Map covering at least `nfiles` descriptors, all free.
    pub fn new(nfiles: usize) -> Self {
        Self {
            words: vec![0; nd_slots(nfiles)],
        }
    }

    /// Number of descriptors the map can track.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len() * NDENTRIES
    }

    /// Extend the map to cover `nfiles` descriptors. Never shrinks.
    pub fn grow(&mut self, nfiles: usize) {
        let words = nd_slots(nfiles);
        if words > self.words.len() {
            self.words.resize(words, 0);
        }
    }

    #[inline]
    pub fn is_set(&self, fd: usize) -> bool {
        self.words
            .get(fd / NDENTRIES)
            .is_some_and(|w| w & bit(fd) != 0)
    }

    #[inline]
    pub fn set(&mut self, fd: usize) {
        self.words[fd / NDENTRIES] |= bit(fd);
    }

    #[inline]
    pub fn clear(&mut self, fd: usize) {
        self.words[fd / NDENTRIES] &= !bit(fd);
    }

    /// Lowest clear index in `low..size`, or `size` if there is none.
    ///
    /// A `low` at or beyond `size` is returned unchanged.
    pub fn first_free(&self, low: usize, size: usize) -> usize {
        if low >= size {
            return low;
        }
        let last_word = nd_slots(size).min(self.words.len());
        let mut word = low / NDENTRIES;
        // Treat everything below `low` in the first word as used.
        let mut below = bit(low) - 1;
        while word < last_word {
            let map = self.words[word] | below;
            if map != !0 {
                let fd = word * NDENTRIES + (!map).trailing_zeros() as usize;
                return fd.min(size);
            }
            below = 0;
            word += 1;
        }
        size
    }

    /// Highest set index below `size`.
    pub fn last_used(&self, size: usize) -> Option<usize> {
        let size = size.min(self.capacity());
        if size == 0 {
            return None;
        }
        let top = size - 1;
        let mut word = top / NDENTRIES;
        // Ignore bits at or above `size` in the top word.
        let mut mask = if top % NDENTRIES == NDENTRIES - 1 {
            !0
        } else {
            bit(top + 1) - 1
        };
        loop {
            let map = self.words[word] & mask;
            if map != 0 {
                return Some(word * NDENTRIES + (NDENTRIES - 1 - map.leading_zeros() as usize));
            }
            if word == 0 {
                return None;
            }
            word -= 1;
            mask = !0;
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[inline]
const fn bit(fd: usize) -> u64 {
    1u64 << (fd % NDENTRIES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_free_skips_used() {
        let mut map = FdMap::new(128);
        for fd in 0..70 {
            map.set(fd);
        }
        assert_eq!(map.first_free(0, 128), 70);
        assert_eq!(map.first_free(71, 128), 71);
        map.clear(3);
        assert_eq!(map.first_free(0, 128), 3);
        assert_eq!(map.first_free(4, 128), 70);
    }

    #[test]
    fn test_first_free_full_returns_size() {
        let mut map = FdMap::new(20);
        for fd in 0..20 {
            map.set(fd);
        }
        assert_eq!(map.first_free(0, 20), 20);
        assert_eq!(map.first_free(25, 20), 25);
    }

    #[test]
    fn test_last_used() {
        let mut map = FdMap::new(192);
        assert_eq!(map.last_used(192), None);
        map.set(0);
        map.set(64);
        map.set(130);
        assert_eq!(map.last_used(192), Some(130));
        assert_eq!(map.last_used(130), Some(64));
        assert_eq!(map.last_used(64), Some(0));
        assert_eq!(map.last_used(0), None);
    }

    #[test]
    fn test_grow_preserves_bits() {
        let mut map = FdMap::new(20);
        map.set(5);
        map.grow(200);
        assert!(map.is_set(5));
        assert_eq!(map.capacity(), 256);
        assert_eq!(map.first_free(64, 200), 64);
    }

    proptest! {
        #[test]
        fn test_first_free_matches_linear_scan(
            ops in prop::collection::vec((any::<bool>(), 0usize..300), 0..200),
            low in 0usize..320,
        ) {
            let size = 300;
            let mut map = FdMap::new(size);
            let mut model = vec![false; size];
            for (set, fd) in ops {
                if set { map.set(fd) } else { map.clear(fd) }
                model[fd] = set;
            }
            let expected = if low >= size {
                low
            } else {
                (low..size).find(|&fd| !model[fd]).unwrap_or(size)
            };
            prop_assert_eq!(map.first_free(low, size), expected);
            prop_assert_eq!(
                map.last_used(size),
                (0..size).rev().find(|&fd| model[fd])
            );
            prop_assert_eq!(map.count(), model.iter().filter(|&&b| b).count());
        }
    }
}
