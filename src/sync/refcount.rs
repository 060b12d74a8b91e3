//! Reference Count Helpers
//!
//! Counters for objects that lock-free readers may find through a raw
//! pointer. Once a count has reached zero the object is dying and must not be
//! revived, so readers use `acquire_if_not_zero` instead of a plain increment.

use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// Take a reference unconditionally. The caller must already own one.
#[inline]
pub fn acquire(count: &AtomicUsize) {
    let old = count.fetch_add(1, Ordering::Relaxed);
    debug_assert!(old != 0, "refcount resurrected from zero");
}

/// Take a reference unless the count has already dropped to zero.
#[inline]
pub fn acquire_if_not_zero(count: &AtomicUsize) -> bool {
    let mut cur = count.load(Ordering::Relaxed);
    loop {
        if cur == 0 {
            return false;
        }
        match count.compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return true,
            Err(seen) => cur = seen,
        }
    }
}

/// Drop a reference. Returns `true` if it was the last one.
#[inline]
pub fn release(count: &AtomicUsize) -> bool {
    let old = count.fetch_sub(1, Ordering::Release);
    debug_assert!(old != 0, "refcount underflow");
    if old == 1 {
        fence(Ordering::Acquire);
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_if_not_zero() {
        let count = AtomicUsize::new(1);
        assert!(acquire_if_not_zero(&count));
        assert_eq!(count.load(Ordering::Relaxed), 2);

        let dead = AtomicUsize::new(0);
        assert!(!acquire_if_not_zero(&dead));
        assert_eq!(dead.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_release_reports_last() {
        let count = AtomicUsize::new(2);
        assert!(!release(&count));
        assert!(release(&count));
    }
}
