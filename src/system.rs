//! System-Wide Descriptor State
//!
//! The open-file counter and limit, the chroot policy and the root vnode that
//! fresh working-directory snapshots start from.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::warn;
use spin::RwLock;

use crate::config::{ChrootPolicy, DEFAULT_MAXFILES};
use crate::error::{FdError, FdResult};
use crate::file::VnodeRef;

/// State shared by every process of one kernel instance.
pub struct FdSystem {
    openfiles: AtomicUsize,
    maxfiles: usize,
    chroot_policy: ChrootPolicy,
    rootvnode: RwLock<Option<VnodeRef>>,
}

impl FdSystem {
    pub fn new(maxfiles: usize, chroot_policy: ChrootPolicy) -> Arc<Self> {
        Arc::new(Self {
            openfiles: AtomicUsize::new(0),
            maxfiles,
            chroot_policy,
            rootvnode: RwLock::new(None),
        })
    }

    /// Number of file objects currently charged against `maxfiles`.
    #[inline]
    pub fn openfiles(&self) -> usize {
        self.openfiles.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn maxfiles(&self) -> usize {
        self.maxfiles
    }

    #[inline]
    pub fn chroot_policy(&self) -> ChrootPolicy {
        self.chroot_policy
    }

    /// Charge one file object. Fails with `FileTableFull` at the limit.
    pub(crate) fn charge_file(&self) -> FdResult<()> {
        let prev = self.openfiles.fetch_add(1, Ordering::Relaxed);
        if prev >= self.maxfiles {
            self.openfiles.fetch_sub(1, Ordering::Relaxed);
            warn!("fdesc: kern.maxfiles limit exceeded ({})", self.maxfiles);
            return Err(FdError::FileTableFull);
        }
        Ok(())
    }

    /// Return the charge taken by `charge_file`.
    pub(crate) fn uncharge_file(&self) {
        let prev = self.openfiles.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev != 0, "openfiles underflow");
    }

    /// Root vnode of the system, once mounted.
    pub fn rootvnode(&self) -> Option<VnodeRef> {
        self.rootvnode.read().clone()
    }

    pub(crate) fn store_rootvnode(&self, vnode: VnodeRef) {
        *self.rootvnode.write() = Some(vnode);
    }
}

impl Default for FdSystem {
    fn default() -> Self {
        Self {
            openfiles: AtomicUsize::new(0),
            maxfiles: DEFAULT_MAXFILES,
            chroot_policy: ChrootPolicy::default(),
            rootvnode: RwLock::new(None),
        }
    }
}
