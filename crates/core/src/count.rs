//! Atomic reference counter for intrusively counted records.
//!
//! Flyweight string placeholders embed one of these directly in front of
//! their character data. Increments are relaxed (a new reference can only
//! be minted by someone who already holds one); the decrement uses
//! acquire-release ordering so a sweep that observes zero also observes
//! every write made while the reference was held.

use std::sync::atomic::{AtomicI32, Ordering};

/// An atomic signed reference count. Must never go negative.
#[derive(Debug)]
pub struct RefCount(AtomicI32);

impl RefCount {
    pub const fn new(initial: i32) -> Self {
        Self(AtomicI32::new(initial))
    }

    /// Increment by `n`; returns the new count.
    #[inline]
    pub fn add(&self, n: i32) -> i32 {
        self.0.fetch_add(n, Ordering::Relaxed) + n
    }

    /// Decrement by `n`; returns the new count.
    #[inline]
    pub fn sub(&self, n: i32) -> i32 {
        let count = self.0.fetch_sub(n, Ordering::AcqRel) - n;
        debug_assert!(count >= 0, "reference count went negative: {count}");
        count
    }

    #[inline]
    pub fn load(&self) -> i32 {
        self.0.load(Ordering::Acquire)
    }
}
