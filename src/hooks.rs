//! Collaborator Hooks
//!
//! The descriptor subsystem calls out to three collaborators it does not own:
//! resource accounting, event-registration cleanup and advisory locking.
//! Every hook has a permissive default so embedders only override what they
//! actually track.

use crate::file::File;

/// Identity under which POSIX advisory locks are held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u32);

/// Callbacks into the rest of the kernel.
pub trait FdHooks: Send + Sync {
    /// Charge `pid` for a descriptor table of `nfiles` entries.
    ///
    /// Returning `false` refuses the growth; the table is left untouched and
    /// the allocation fails with `TooManyOpen`.
    fn reserve_nofile(&self, _pid: u32, _nfiles: usize) -> bool {
        true
    }

    /// Descriptor `fd` of `pid` was closed; drop event registrations on it.
    ///
    /// Called with the table's exclusive lock held.
    fn fd_closed(&self, _pid: u32, _fd: usize) {}

    /// Release every POSIX lock `owner` holds on the vnode behind `file`.
    ///
    /// Called without the table lock.
    fn release_posix_locks(&self, _owner: LockOwner, _file: &File) {}
}

/// Hooks that account nothing and hold no locks.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl FdHooks for NoHooks {}
