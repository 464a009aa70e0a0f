#![forbid(unsafe_code)]

/// A compact bit vector used for validity and boolean storage.
///
/// Bit `i` lives in word `i / 64` at position `i % 64` (LSB first).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u64>,
    len: usize,
    ones: usize,
}

impl BitVec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_bits(bits: usize) -> Self {
        Self {
            words: Vec::with_capacity(bits.div_ceil(64)),
            len: 0,
            ones: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: bool) {
        let bit = self.len % 64;
        if bit == 0 {
            self.words.push(0);
        }
        if value {
            let last = self.words.len() - 1;
            self.words[last] |= 1u64 << bit;
            self.ones += 1;
        }
        self.len += 1;
    }

    pub fn get(&self, index: usize) -> bool {
        debug_assert!(index < self.len, "BitVec index out of bounds");
        (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    pub fn count_ones(&self) -> usize {
        self.ones
    }

    pub fn count_zeros(&self) -> usize {
        self.len - self.ones
    }

    pub fn all_true(&self) -> bool {
        self.ones == self.len
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.len = 0;
        self.ones = 0;
    }

    /// Heap bytes held by the word buffer.
    pub fn size_bytes(&self) -> usize {
        self.words.capacity() * std::mem::size_of::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_get_and_counts_across_word_boundary() {
        let mut bits = BitVec::with_capacity_bits(130);
        for i in 0..130 {
            bits.push(i % 3 == 0);
        }
        assert_eq!(bits.len(), 130);
        assert!(bits.get(0));
        assert!(!bits.get(64));
        assert!(bits.get(129));
        assert_eq!(bits.count_ones(), 44);
        assert_eq!(bits.count_zeros(), 86);
        assert!(!bits.all_true());

        bits.clear();
        assert!(bits.is_empty());
        assert!(bits.all_true());
    }
}
