//! Commit Bitmap - Tracking Backed Regions
//!
//! One bit per logical region. A set bit means every page the region depends
//! on is committed.
//!
//! Bitmap Structure:
//! ```text
//! Regions:   0 1 2 3 4 5 6 7 ... 63 | 64 65 ...
//! Words:     [       word 0        ] [ word 1 ...
//!
//! Region 66:
//! - Word index: 66 / 64 = 1
//! - Bit offset: 66 % 64 = 2
//! ```
//!
//! The bitmap is owned by a single mapper and only mutated through `&mut`,
//! so plain words are enough. Readers on other threads go through the lock
//! that serializes the mapper.

const BITS_PER_WORD: usize = 64;

/// CommitBitmap - fixed-size bitmap indexed by region
#[derive(Debug, Clone)]
pub struct CommitBitmap {
    /// Raw bitmap words
    words: Vec<u64>,

    /// Number of valid bits
    len: usize,
}

impl CommitBitmap {
    /// Create a cleared bitmap with `len` bits
    pub fn new(len: usize) -> Self {
        let word_count = len.div_ceil(BITS_PER_WORD);
        Self {
            words: vec![0; word_count],
            len,
        }
    }

    /// Number of bits
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the bitmap covers no regions
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check bit at index
    ///
    /// # Panics
    /// If `index >= len()`.
    pub fn at(&self, index: usize) -> bool {
        assert!(index < self.len, "bit {} out of bounds for {}", index, self.len);
        let (word, bit) = Self::indices(index);
        self.words[word] & (1u64 << bit) != 0
    }

    /// Set bit at index
    pub fn set_bit(&mut self, index: usize) {
        assert!(index < self.len, "bit {} out of bounds for {}", index, self.len);
        let (word, bit) = Self::indices(index);
        self.words[word] |= 1u64 << bit;
    }

    /// Clear bit at index
    pub fn clear_bit(&mut self, index: usize) {
        assert!(index < self.len, "bit {} out of bounds for {}", index, self.len);
        let (word, bit) = Self::indices(index);
        self.words[word] &= !(1u64 << bit);
    }

    /// Set all bits in `[start, end)`
    pub fn set_range(&mut self, start: usize, end: usize) {
        self.apply_range(start, end, |word, mask| *word |= mask);
    }

    /// Clear all bits in `[start, end)`
    pub fn clear_range(&mut self, start: usize, end: usize) {
        self.apply_range(start, end, |word, mask| *word &= !mask);
    }

    /// True if every bit in `[start, end)` is clear
    pub fn is_range_clear(&self, start: usize, end: usize) -> bool {
        self.first_set_in(start, end).is_none()
    }

    /// True if every bit in `[start, end)` is set
    pub fn is_range_set(&self, start: usize, end: usize) -> bool {
        self.first_clear_in(start, end).is_none()
    }

    /// First set bit in `[start, end)`
    pub fn first_set_in(&self, start: usize, end: usize) -> Option<usize> {
        self.find_in(start, end, |word| word)
    }

    /// First clear bit in `[start, end)`
    pub fn first_clear_in(&self, start: usize, end: usize) -> Option<usize> {
        self.find_in(start, end, |word| !word)
    }

    /// Count set bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over indices of set bits
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| {
                let mut remaining = word;
                std::iter::from_fn(move || {
                    if remaining == 0 {
                        return None;
                    }
                    let bit = remaining.trailing_zeros() as usize;
                    remaining &= remaining - 1;
                    Some(word_index * BITS_PER_WORD + bit)
                })
            })
    }

    fn indices(index: usize) -> (usize, usize) {
        (index / BITS_PER_WORD, index % BITS_PER_WORD)
    }

    /// Visit each word overlapping `[start, end)` with the mask of bits
    /// inside the range.
    fn apply_range(&mut self, start: usize, end: usize, mut f: impl FnMut(&mut u64, u64)) {
        assert!(
            start <= end && end <= self.len,
            "range [{}, {}) out of bounds for {}",
            start,
            end,
            self.len
        );
        let mut index = start;
        while index < end {
            let (word, bit) = Self::indices(index);
            let bits_in_word = (BITS_PER_WORD - bit).min(end - index);
            let mask = if bits_in_word == BITS_PER_WORD {
                u64::MAX
            } else {
                ((1u64 << bits_in_word) - 1) << bit
            };
            f(&mut self.words[word], mask);
            index += bits_in_word;
        }
    }

    fn find_in(&self, start: usize, end: usize, transform: impl Fn(u64) -> u64) -> Option<usize> {
        assert!(
            start <= end && end <= self.len,
            "range [{}, {}) out of bounds for {}",
            start,
            end,
            self.len
        );
        let mut index = start;
        while index < end {
            let (word, bit) = Self::indices(index);
            let bits_in_word = (BITS_PER_WORD - bit).min(end - index);
            let candidates = transform(self.words[word]) >> bit;
            let candidates = if bits_in_word == BITS_PER_WORD {
                candidates
            } else {
                candidates & ((1u64 << bits_in_word) - 1)
            };
            if candidates != 0 {
                return Some(index + candidates.trailing_zeros() as usize);
            }
            index += bits_in_word;
        }
        None
    }
}
