//! Sequence Counters
//!
//! A writer makes the counter odd for the duration of a mutation and even
//! again afterwards. A reader captures an even value, reads the protected
//! fields (which must themselves be atomics), and accepts the read only if the
//! counter is unchanged.
//!
//! Writers must already be serialised by some other lock; the counter only
//! tells readers that they raced.

use core::hint::spin_loop;
use core::sync::atomic::{fence, AtomicU32, Ordering};

/// A captured, even sequence value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqToken(u32);

impl SeqToken {
    /// Raw counter value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

/// Sequence counter guarding a group of atomically-stored fields.
#[derive(Debug)]
pub struct SeqCount(AtomicU32);

impl SeqCount {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Create a counter continuing from `value` (used when entries are copied).
    pub(crate) const fn with_value(value: u32) -> Self {
        Self(AtomicU32::new(value))
    }

    /// Raw value, for copying into a replacement slot.
    #[inline]
    pub(crate) fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// Whether a writer is currently inside a write section.
    #[inline]
    pub fn in_modify(&self) -> bool {
        self.0.load(Ordering::Relaxed) & 1 == 1
    }

    /// Enter a write section. The caller must hold the writer lock.
    #[inline]
    pub fn write_begin(&self) {
        let v = self.0.load(Ordering::Relaxed);
        debug_assert!(v & 1 == 0, "nested seqcount write section");
        self.0.store(v.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
    }

    /// Leave a write section.
    #[inline]
    pub fn write_end(&self) {
        let v = self.0.load(Ordering::Relaxed);
        debug_assert!(v & 1 == 1, "seqcount write_end without write_begin");
        self.0.store(v.wrapping_add(1), Ordering::Release);
    }

    /// RAII write section.
    #[inline]
    pub fn write(&self) -> SeqWriteGuard<'_> {
        self.write_begin();
        SeqWriteGuard { seqc: self }
    }

    /// Capture the counter, or `None` while a write is in progress.
    #[inline]
    pub fn begin(&self) -> Option<SeqToken> {
        let v = self.0.load(Ordering::Acquire);
        if v & 1 == 0 {
            Some(SeqToken(v))
        } else {
            None
        }
    }

    /// Whether no write section started since `token` was captured.
    ///
    /// Orders all preceding reads before the re-check.
    #[inline]
    pub fn unchanged(&self, token: SeqToken) -> bool {
        fence(Ordering::Acquire);
        self.0.load(Ordering::Relaxed) == token.0
    }

    /// One optimistic read attempt.
    ///
    /// Returns the value read by `f` together with the token it is consistent
    /// with, or `None` if a writer interfered.
    #[inline]
    pub fn try_read<T>(&self, f: impl FnOnce() -> T) -> Option<(T, SeqToken)> {
        let token = self.begin()?;
        let value = f();
        if self.unchanged(token) {
            Some((value, token))
        } else {
            None
        }
    }

    /// Optimistic read, retried until it observes a consistent state.
    ///
    /// Never blocks: each retry follows a completed or in-progress write.
    pub fn read<T>(&self, mut f: impl FnMut() -> T) -> (T, SeqToken) {
        loop {
            if let Some(read) = self.try_read(&mut f) {
                return read;
            }
            spin_loop();
        }
    }
}

impl Default for SeqCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Ends the write section on drop.
pub struct SeqWriteGuard<'a> {
    seqc: &'a SeqCount,
}

impl Drop for SeqWriteGuard<'_> {
    fn drop(&mut self) {
        self.seqc.write_end();
    }
}
