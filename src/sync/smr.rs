//! Safe Memory Reclamation
//!
//! Epoch-based deferred freeing for objects that lock-free readers reach
//! through raw pointers (dying files, replaced working-directory snapshots).
//!
//! # Design
//! - A global epoch counter and one reader counter per epoch (three epochs)
//! - Readers pin the current epoch for the duration of a read section
//! - Retired objects are parked in the limbo list of the epoch they were
//!   retired in, and freed once the epoch has advanced twice past it
//! - The epoch only advances when nobody is still pinned in the previous one
//!
//! An object retired in epoch `e` was unlinked before the retirement, so any
//! reader able to see it pinned `e` or `e - 1`. Both are drained before the
//! epoch can reach `e + 2`.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{fence, AtomicUsize, Ordering};
use spin::Mutex;

/// Number of epochs tracked at once.
const EPOCHS: usize = 3;

/// A parked allocation and the function that frees it.
struct Retired {
    ptr: *mut (),
    free: unsafe fn(*mut ()),
}

// SAFETY: `retire` requires `T: Send`, so the pointee may be dropped on any thread.
unsafe impl Send for Retired {}

impl Retired {
    fn reclaim(self) {
        // SAFETY: built by `Smr::retire` from a live `Box<T>` that nothing else frees.
        unsafe { (self.free)(self.ptr) }
    }
}

unsafe fn drop_box<T>(ptr: *mut ()) {
    // SAFETY: `retire` only records pointers obtained from `Box::into_raw::<T>`.
    drop(unsafe { Box::from_raw(ptr.cast::<T>()) });
}

/// A reclamation domain.
pub struct Smr {
    epoch: AtomicUsize,
    readers: [AtomicUsize; EPOCHS],
    limbo: Mutex<[Vec<Retired>; EPOCHS]>,
}

/// Domain shared by files and working-directory snapshots.
pub static SMR: Smr = Smr::new();

impl Smr {
    pub const fn new() -> Self {
        Self {
            epoch: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0), AtomicUsize::new(0)],
            limbo: Mutex::new([Vec::new(), Vec::new(), Vec::new()]),
        }
    }

    /// Enter a read section. Objects reachable when it starts stay allocated
    /// until the guard is dropped.
    pub fn enter(&self) -> SmrGuard<'_> {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let slot = epoch % EPOCHS;
            self.readers[slot].fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return SmrGuard {
                    smr: self,
                    slot,
                    _not_send: PhantomData,
                };
            }
            // Pinned a stale epoch; undo and try again.
            self.readers[slot].fetch_sub(1, Ordering::Release);
        }
    }

    /// Current epoch.
    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Number of retired objects not yet freed.
    pub fn pending(&self) -> usize {
        self.limbo.lock().iter().map(Vec::len).sum()
    }

    /// Park `ptr` until no reader can still hold it, then drop it as a `Box<T>`.
    ///
    /// # Safety
    /// - `ptr` must come from `Box::into_raw`
    /// - it must already be unreachable for readers entering after this call
    /// - it must not be retired twice or freed by anyone else
    pub unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        let retired = Retired {
            ptr: ptr.cast(),
            free: drop_box::<T>,
        };
        let reclaimable = {
            let mut limbo = self.limbo.lock();
            let epoch = self.epoch.load(Ordering::SeqCst);
            limbo[epoch % EPOCHS].push(retired);
            self.advance(&mut limbo)
        };
        // Destructors run without the limbo lock held.
        reclaimable.into_iter().for_each(Retired::reclaim);
    }

    /// Try to advance the epoch and free whatever became unreachable.
    ///
    /// Never waits for readers. Returns the number of objects freed.
    pub fn poll(&self) -> usize {
        let reclaimable = {
            let mut limbo = self.limbo.lock();
            self.advance(&mut limbo)
        };
        let freed = reclaimable.len();
        reclaimable.into_iter().for_each(Retired::reclaim);
        freed
    }

    /// Advance at most twice, collecting the limbo lists that became safe.
    fn advance(&self, limbo: &mut [Vec<Retired>; EPOCHS]) -> Vec<Retired> {
        let mut out = Vec::new();
        for _ in 0..2 {
            fence(Ordering::SeqCst);
            let epoch = self.epoch.load(Ordering::SeqCst);
            let prev = (epoch + EPOCHS - 1) % EPOCHS;
            if self.readers[prev].load(Ordering::SeqCst) != 0 {
                break;
            }
            self.epoch.store(epoch + 1, Ordering::SeqCst);
            // Retired in `epoch - 1`; the epoch is now `epoch + 1`.
            out.append(&mut limbo[prev]);
        }
        out
    }
}

impl Default for Smr {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Smr {
    fn drop(&mut self) {
        // No guard can outlive the borrow of `self`.
        let limbo = self.limbo.get_mut();
        for list in limbo.iter_mut() {
            list.drain(..).for_each(Retired::reclaim);
        }
    }
}

/// An active read section.
pub struct SmrGuard<'a> {
    smr: &'a Smr,
    slot: usize,
    _not_send: PhantomData<*const ()>,
}

impl SmrGuard<'_> {
    /// Epoch slot this guard pinned.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SmrGuard<'_> {
    fn drop(&mut self) {
        self.smr.readers[self.slot].fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicBool;
    use std::thread;

    struct Tracked(Arc<AtomicBool>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn tracked() -> (*mut Tracked, Arc<AtomicBool>) {
        let freed = Arc::new(AtomicBool::new(false));
        (Box::into_raw(Box::new(Tracked(freed.clone()))), freed)
    }

    #[test]
    fn test_retire_without_readers_frees() {
        let smr = Smr::new();
        let (ptr, freed) = tracked();
        unsafe { smr.retire(ptr) };
        // Two advances happen inside retire, which covers the retirement epoch.
        assert!(freed.load(Ordering::SeqCst));
        assert_eq!(smr.pending(), 0);
    }

    #[test]
    fn test_reader_delays_free() {
        let smr = Smr::new();
        let guard = smr.enter();
        let (ptr, freed) = tracked();
        unsafe { smr.retire(ptr) };
        smr.poll();
        smr.poll();
        assert!(!freed.load(Ordering::SeqCst));
        assert_eq!(smr.pending(), 1);

        drop(guard);
        smr.poll();
        smr.poll();
        assert!(freed.load(Ordering::SeqCst));
        assert_eq!(smr.pending(), 0);
    }

    #[test]
    fn test_reader_entering_later_does_not_block() {
        let smr = Smr::new();
        let (ptr, freed) = tracked();
        let early = smr.enter();
        unsafe { smr.retire(ptr) };
        drop(early);
        // A reader that starts after the retirement cannot see the object.
        let _late = smr.enter();
        for _ in 0..4 {
            smr.poll();
        }
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_frees_limbo() {
        let (ptr, freed) = tracked();
        {
            let smr = Smr::new();
            let guard = smr.enter();
            unsafe { smr.retire(ptr) };
            drop(guard);
        }
        assert!(freed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_concurrent_enter_and_retire() {
        let smr = Smr::new();
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..2_000 {
                        let _g = smr.enter();
                    }
                });
            }
            for _ in 0..500 {
                let (ptr, _freed) = tracked();
                unsafe { smr.retire(ptr) };
            }
        });
        for _ in 0..4 {
            smr.poll();
        }
        assert_eq!(smr.pending(), 0);
    }
}
