//! Fixed-capacity occupancy bitmap for RBGs and RBs.
//!
//! The scheduler builds and discards several of these every TTI, so the
//! storage is inline and never reallocates. Capacity covers the largest NR
//! carrier (275 RBs).

/// Maximum number of bits a mask can hold.
pub const MAX_RESOURCES: usize = 320;

const WORDS: usize = MAX_RESOURCES / 64;

/// Bitmap over `len` resources (RBGs or RBs).
///
/// Invariant: bits at positions `>= len` are always zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceMask {
    words: [u64; WORDS],
    len: u16,
}

impl ResourceMask {
    /// Empty mask of `len` resources. `len` is clamped to [`MAX_RESOURCES`].
    pub fn new(len: u16) -> Self {
        Self {
            words: [0; WORDS],
            len: len.min(MAX_RESOURCES as u16),
        }
    }

    /// Mask with every resource set.
    pub fn full(len: u16) -> Self {
        let mut mask = Self::new(len);
        mask.set_range(0, mask.len);
        mask
    }

    #[inline]
    pub fn len(&self) -> u16 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn get(&self, idx: u16) -> bool {
        if idx >= self.len {
            return false;
        }
        let i = idx as usize;
        self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    #[inline]
    pub fn set(&mut self, idx: u16) {
        if idx < self.len {
            let i = idx as usize;
            self.words[i / 64] |= 1u64 << (i % 64);
        }
    }

    #[inline]
    pub fn clear(&mut self, idx: u16) {
        if idx < self.len {
            let i = idx as usize;
            self.words[i / 64] &= !(1u64 << (i % 64));
        }
    }

    /// Set `[start, start + count)`, truncated at `len`.
    pub fn set_range(&mut self, start: u16, count: u16) {
        let end = start.saturating_add(count).min(self.len);
        for idx in start..end {
            self.set(idx);
        }
    }

    /// True if every bit in `[start, start + count)` is set.
    pub fn all_set(&self, start: u16, count: u16) -> bool {
        let end = start as u32 + count as u32;
        if end > self.len as u32 {
            return false;
        }
        (start..start + count).all(|idx| self.get(idx))
    }

    /// Number of set bits.
    pub fn count(&self) -> u16 {
        self.words.iter().map(|w| w.count_ones() as u16).sum()
    }

    /// True if no bit is set.
    pub fn none(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// True if the two masks share any set bit.
    pub fn intersects(&self, other: &ResourceMask) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .any(|(a, b)| a & b != 0)
    }

    /// Set every bit that is set in `other`.
    pub fn union_with(&mut self, other: &ResourceMask) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= *b;
        }
        self.truncate_tail();
    }

    /// Clear every bit that is set in `other`.
    pub fn subtract(&mut self, other: &ResourceMask) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a &= !*b;
        }
    }

    /// Indices of set bits in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.len).filter(move |idx| self.get(*idx))
    }

    /// Maximal runs of consecutive set bits as `(start, len)`.
    pub fn runs(&self) -> Vec<(u16, u16)> {
        let mut runs = Vec::new();
        let mut idx = 0;
        while idx < self.len {
            if !self.get(idx) {
                idx += 1;
                continue;
            }
            let start = idx;
            while idx < self.len && self.get(idx) {
                idx += 1;
            }
            runs.push((start, idx - start));
        }
        runs
    }

    /// Longest run of set bits; earliest wins ties.
    pub fn longest_run(&self) -> Option<(u16, u16)> {
        self.runs()
            .into_iter()
            .fold(None, |best: Option<(u16, u16)>, run| match best {
                Some(b) if b.1 >= run.1 => Some(b),
                _ => Some(run),
            })
    }

    pub fn to_vec(&self) -> Vec<bool> {
        (0..self.len).map(|idx| self.get(idx)).collect()
    }

    fn truncate_tail(&mut self) {
        let len = self.len as usize;
        for (w, word) in self.words.iter_mut().enumerate() {
            let lo = w * 64;
            if lo >= len {
                *word = 0;
            } else if lo + 64 > len {
                *word &= (1u64 << (len - lo)) - 1;
            }
        }
    }
}

impl std::fmt::Debug for ResourceMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits: String = (0..self.len)
            .map(|idx| if self.get(idx) { '1' } else { '0' })
            .collect();
        write!(f, "ResourceMask({})", bits)
    }
}
