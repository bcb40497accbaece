use alloc::vec;
use alloc::vec::Vec;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitArray<T>(pub T);

macro_rules! impl_bitarray {
    ($($t: ty),*) => {
        $(
            impl BitArray<$t> {
                pub const BITS: usize = <$t>::BITS as usize;

                pub const fn get(&self, idx: usize) -> bool {
                    (self.0 >> idx & 1) != 0
                }

                pub const fn with(self, value: bool, idx: usize) -> Self {
                    BitArray((self.0 & !(1 << idx)) | (value as $t) << idx)
                }

                pub const fn is_full(&self) -> bool {
                    self.0 == <$t>::MAX
                }

                pub const fn first_zero(&self) -> usize {
                    (!self.0).trailing_zeros() as usize
                }

                pub const fn count_ones(&self) -> usize {
                    self.0.count_ones() as usize
                }

                pub const fn load(self) -> $t { self.0 }
            }
        )*
    };
}

impl_bitarray!(u8, u16, u32, u64);

/// A fixed-size set of bits, used to track which slots of a resource are in
/// use. A set bit means the slot is taken.
#[derive(Clone, Debug)]
pub struct Bitmap {
    words: Vec<BitArray<u64>>,
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![BitArray(0); len.div_ceil(BitArray::<u64>::BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        self.words[idx / BitArray::<u64>::BITS].get(idx % BitArray::<u64>::BITS)
    }

    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range (len {})", self.len);
        let word = &mut self.words[idx / BitArray::<u64>::BITS];
        *word = word.with(value, idx % BitArray::<u64>::BITS);
    }

    /// Finds the first clear bit, sets it, and returns its index.
    pub fn scan_and_flip(&mut self) -> Option<usize> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if word.is_full() {
                continue;
            }
            let idx = i * BitArray::<u64>::BITS + word.first_zero();
            // The tail of the last word lies beyond `len`.
            if idx >= self.len {
                return None;
            }
            *word = word.with(true, idx % BitArray::<u64>::BITS);
            return Some(idx);
        }
        None
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|word| word.count_ones()).sum()
    }
}
