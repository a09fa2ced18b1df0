//! Recycling allocator for small dense integer keys.
//!
//! Shared render objects (pipelines, texture configurations, vertex arrays,
//! instances) are identified by a key from a [`UniqueKeyPool`]. Returned keys
//! are handed out again before new ones, so the keys stay dense and can index
//! flat lookup tables directly.

use crate::error::PoolError;

/// Process-wide style key allocator: `get` a free key, `put` it back when done.
#[derive(Debug, Default)]
pub struct UniqueKeyPool {
    free: Vec<u32>,
    in_use: Vec<bool>,
    next_key: u32,
}

impl UniqueKeyPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a recycled key, or the next unused one.
    pub fn get(&mut self) -> u32 {
        let key = match self.free.pop() {
            Some(key) => key,
            None => {
                let key = self.next_key;
                self.next_key += 1;
                self.in_use.push(false);
                key
            }
        };
        self.in_use[key as usize] = true;
        key
    }

    /// Return a key for reuse.
    ///
    /// # Errors
    ///
    /// Fails if the key was never handed out or is already returned.
    pub fn put(&mut self, key: u32) -> Result<(), PoolError> {
        match self.in_use.get_mut(key as usize) {
            None => Err(PoolError::UnknownKey(key)),
            Some(false) => Err(PoolError::DoubleReturn(key)),
            Some(used) => {
                *used = false;
                self.free.push(key);
                Ok(())
            }
        }
    }

    /// Number of keys currently handed out.
    pub fn in_use_count(&self) -> usize {
        self.next_key as usize - self.free.len()
    }

    /// One past the largest key ever handed out.
    pub fn next_key(&self) -> u32 {
        self.next_key
    }
}
