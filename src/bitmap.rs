//! Node bitmaps: one bit per configured node, stored in `u64` words.
//!
//! Jobs, steps, and reservations all reference node sets through these
//! bitmaps; indices are positions in the node table, resolved through the
//! entity store under lock. Padding bits beyond the logical length are kept
//! zero so counting and equality never see phantom bits.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBitmap {
    words: Vec<u64>,
    bit_len: usize,
}

impl NodeBitmap {
    /// Creates an empty bitmap sized for `bit_len` nodes.
    pub fn new(bit_len: usize) -> Self {
        Self {
            words: vec![0; bit_len.div_ceil(64)],
            bit_len,
        }
    }

    /// Creates a bitmap with every bit in `[0, bit_len)` set.
    pub fn full(bit_len: usize) -> Self {
        let mut bm = Self::new(bit_len);
        for w in &mut bm.words {
            *w = u64::MAX;
        }
        bm.mask_padding();
        bm
    }

    /// Builds a bitmap from explicit indices. Panics on out-of-range input.
    pub fn from_indices(bit_len: usize, indices: &[usize]) -> Self {
        let mut bm = Self::new(bit_len);
        for &i in indices {
            bm.set(i);
        }
        bm
    }

    fn mask_padding(&mut self) {
        if let Some(last) = self.words.last_mut() {
            let mask = match self.bit_len % 64 {
                0 => u64::MAX,
                rem => (1u64 << rem) - 1,
            };
            *last &= mask;
        }
    }

    pub fn len(&self) -> usize {
        self.bit_len
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline]
    pub fn is_set(&self, idx: usize) -> bool {
        assert!(idx < self.bit_len, "node index out of bounds");
        self.words[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, idx: usize) {
        assert!(idx < self.bit_len, "node index out of bounds");
        self.words[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline]
    pub fn unset(&mut self, idx: usize) {
        assert!(idx < self.bit_len, "node index out of bounds");
        self.words[idx / 64] &= !(1u64 << (idx % 64));
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// True when every bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &NodeBitmap) -> bool {
        debug_assert_eq!(self.bit_len, other.bit_len);
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & !b == 0)
    }

    /// True when `self` and `other` share at least one set bit.
    pub fn intersects(&self, other: &NodeBitmap) -> bool {
        self.words.iter().zip(&other.words).any(|(a, b)| a & b != 0)
    }

    pub fn and(&self, other: &NodeBitmap) -> NodeBitmap {
        debug_assert_eq!(self.bit_len, other.bit_len);
        NodeBitmap {
            words: self
                .words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| a & b)
                .collect(),
            bit_len: self.bit_len,
        }
    }

    pub fn or(&self, other: &NodeBitmap) -> NodeBitmap {
        debug_assert_eq!(self.bit_len, other.bit_len);
        NodeBitmap {
            words: self
                .words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| a | b)
                .collect(),
            bit_len: self.bit_len,
        }
    }

    /// Bits set in `self` but not in `other`.
    pub fn minus(&self, other: &NodeBitmap) -> NodeBitmap {
        debug_assert_eq!(self.bit_len, other.bit_len);
        NodeBitmap {
            words: self
                .words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| a & !b)
                .collect(),
            bit_len: self.bit_len,
        }
    }

    /// First set bit at or after `from`, if any.
    pub fn next_set(&self, from: usize) -> Option<usize> {
        (from..self.bit_len).find(|&i| self.is_set(i))
    }

    /// Iterates set bit indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.bit_len).filter(move |&i| self.is_set(i))
    }
}
