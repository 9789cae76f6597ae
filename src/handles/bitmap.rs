//! Fixed-capacity set of fd numbers owned by the shim

/// One bit per possible fd below `capacity`
#[derive(Debug, Clone)]
pub struct HandleBitmap {
    words: Vec<u64>,
    capacity: usize,
    count: usize,
}

impl HandleBitmap {
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(64)],
            capacity,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of set bits
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether `fd` fits in the bitmap
    pub fn in_range(&self, fd: i32) -> bool {
        fd >= 0 && (fd as usize) < self.capacity
    }

    pub fn contains(&self, fd: i32) -> bool {
        if !self.in_range(fd) {
            return false;
        }
        let fd = fd as usize;
        self.words[fd / 64] & (1 << (fd % 64)) != 0
    }

    /// Set the bit for `fd`; false if it was out of range or already set
    pub fn set(&mut self, fd: i32) -> bool {
        if !self.in_range(fd) || self.contains(fd) {
            return false;
        }
        let fd = fd as usize;
        self.words[fd / 64] |= 1 << (fd % 64);
        self.count += 1;
        true
    }

    /// Clear the bit for `fd`; false if it was not set
    pub fn clear(&mut self, fd: i32) -> bool {
        if !self.contains(fd) {
            return false;
        }
        let fd = fd as usize;
        self.words[fd / 64] &= !(1 << (fd % 64));
        self.count -= 1;
        true
    }

    /// Set fds in ascending order
    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        (0..self.capacity as i32).filter(|&fd| self.contains(fd))
    }
}
