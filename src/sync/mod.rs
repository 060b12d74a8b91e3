//! Synchronisation Primitives
//!
//! Lock-free building blocks shared by the descriptor table and the
//! working-directory snapshot:
//! - `seqc`: per-slot sequence counters for optimistic reads
//! - `refcount`: counters that can refuse to resurrect a dying object
//! - `smr`: epoch-based deferred reclamation

pub mod refcount;
pub mod seqc;
pub mod smr;

pub use seqc::{SeqCount, SeqToken};
pub use smr::{Smr, SmrGuard, SMR};

/// Marks a point where a lock-free reader may lose a race.
///
/// Test builds yield here so concurrent mutators get a chance to run in the
/// middle of a lookup.
#[inline(always)]
pub(crate) fn race_window() {
    #[cfg(test)]
    std::thread::yield_now();
}
