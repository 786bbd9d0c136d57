//! Slot accounting: never below zero, never above the configured limit

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct Slots {
    available: AtomicU32,
    max: u32,
}

impl Slots {
    pub fn new(max: u32) -> Self {
        Self {
            available: AtomicU32::new(max),
            max,
        }
    }

    /// Take one slot; false when none are free
    pub fn acquire(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .is_ok()
    }

    /// Return one slot; false if already at the limit
    pub fn release(&self) -> bool {
        let max = self.max;
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                v.checked_add(1).filter(|n| *n <= max)
            })
            .is_ok()
    }

    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn in_use(&self) -> u32 {
        self.max.saturating_sub(self.available())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_bounds() {
        let slots = Slots::new(2);
        assert!(!slots.release());
        assert!(slots.acquire());
        assert!(slots.acquire());
        assert!(!slots.acquire());
        assert_eq!(slots.available(), 0);
        assert_eq!(slots.in_use(), 2);
        assert!(slots.release());
        assert!(slots.release());
        assert!(!slots.release());
        assert_eq!(slots.available(), 2);
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        let slots = Arc::new(Slots::new(3));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let slots = Arc::clone(&slots);
                std::thread::spawn(move || slots.acquire())
            })
            .collect();
        let acquired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(acquired, 3);
        assert_eq!(slots.available(), 0);
    }
}
