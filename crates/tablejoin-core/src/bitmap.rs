//! Growable bit vector tracking matched rows by dense insertion index.

#[derive(Debug, Clone, Default)]
pub struct MatchBitmap {
    words: Vec<u64>,
    len: usize,
}

impl MatchBitmap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bitmap of `len` clear bits.
    #[must_use]
    pub fn with_len(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append one clear bit.
    pub fn push_clear(&mut self) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        self.len += 1;
    }

    /// Set bit `index`, growing the bitmap if needed.
    pub fn set(&mut self, index: usize) {
        if index >= self.len {
            self.len = index + 1;
            self.words.resize(self.len.div_ceil(64), 0);
        }
        self.words[index / 64] |= 1 << (index % 64);
    }

    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.words[index / 64] & (1 << (index % 64)) != 0
    }

    #[must_use]
    pub fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Indices of clear bits, ascending.
    pub fn iter_clear(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(|&i| !self.get(i))
    }

    pub fn clear(&mut self) {
        self.words.clear();
        self.len = 0;
    }
}
