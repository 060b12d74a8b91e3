//! Descriptor Lookup
//!
//! Resolution of a descriptor number to a counted `File` reference.
//!
//! The fast path takes no lock. It reads the slot under its sequence counter,
//! checks rights on that snapshot, takes a reference with "increment if not
//! zero", and then verifies that neither the backing array nor the slot
//! changed meanwhile. Any race restarts the loop, and each restart observes a
//! strictly later table state. The whole loop runs inside an `SMR` read
//! section, so a file released concurrently cannot be freed before the
//! reference attempt has been made.
//!
//! The locked path takes the shared table lock instead and can also return
//! the variable-length parts of the capability set.

use core::hint::spin_loop;

use log::trace;

use super::{FdFlags, FileDesc};
use crate::cap::filecaps::{check_fcntl, check_rights};
use crate::cap::{CapRights, FcntlRights, Filecaps};
use crate::error::{FdError, FdResult};
use crate::file::{FileFlags, FileRef, VnodeRef};
use crate::sync::{race_window, SeqToken, SMR};
use crate::RawFd;

/// Result of a successful lock-free resolution.
pub(crate) struct Resolved {
    pub file: FileRef,
    pub rights: CapRights,
    pub fcntls: FcntlRights,
    pub flags: FdFlags,
    pub token: SeqToken,
}

#[inline]
fn index(fd: RawFd) -> FdResult<usize> {
    usize::try_from(fd).map_err(|_| FdError::BadDescriptor)
}

impl FileDesc {
    pub(crate) fn resolve(&self, fd: RawFd, needed: CapRights) -> FdResult<Resolved> {
        let fd = index(fd)?;
        let _smr = SMR.enter();
        loop {
            let files_ptr = self.files_raw();
            // SAFETY: arrays stay allocated as long as the table does.
            let files = unsafe { &*files_ptr };
            let slot = files.get(fd).ok_or(FdError::BadDescriptor)?;

            let Some((view, token)) = slot.seqc().try_read(|| slot.view()) else {
                race_window();
                spin_loop();
                continue;
            };
            if view.file.is_null() {
                return Err(FdError::BadDescriptor);
            }
            check_rights(view.rights, needed)?;

            race_window();
            // SAFETY: the pointer was installed when our read section was
            // already active, so its memory outlives the section.
            let Some(file) = (unsafe { FileRef::try_acquire(view.file) }) else {
                trace!("fdesc: fd {} lost race with final release, retrying", fd);
                continue;
            };

            race_window();
            if self.files_raw() != files_ptr || !slot.seqc().unchanged(token) {
                trace!("fdesc: fd {} modified during lookup, retrying", fd);
                drop(file);
                continue;
            }
            return Ok(Resolved {
                file,
                rights: view.rights,
                fcntls: view.fcntls,
                flags: view.flags,
                token,
            });
        }
    }

    /// Resolve `fd` without locking, requiring `needed` rights.
    #[inline]
    pub fn get_unlocked(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        self.resolve(fd, needed).map(|r| r.file)
    }

    /// As `get_unlocked`, also returning a token for `modified`.
    pub fn get_unlocked_seq(&self, fd: RawFd, needed: CapRights) -> FdResult<(FileRef, SeqToken)> {
        self.resolve(fd, needed).map(|r| (r.file, r.token))
    }

    /// As `get_unlocked`, also returning the descriptor flags.
    pub fn get_unlocked_flags(&self, fd: RawFd, needed: CapRights) -> FdResult<(FileRef, FdFlags)> {
        self.resolve(fd, needed).map(|r| (r.file, r.flags))
    }

    /// Whether the slot of `fd` changed since `token` was taken.
    pub fn modified(&self, fd: RawFd, token: SeqToken) -> bool {
        let Ok(fd) = index(fd) else { return true };
        // SAFETY: arrays stay allocated as long as the table does.
        let files = unsafe { &*self.files_raw() };
        files.get(fd).map_or(true, |slot| !slot.seqc().unchanged(token))
    }

    /// Resolve `fd` under the shared lock.
    pub fn get_locked(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        let fd = index(fd)?;
        let fdt = self.read();
        let view = fdt.view(fd).ok_or(FdError::BadDescriptor)?;
        check_rights(view.rights, needed)?;
        fdt.file_ref(fd).ok_or(FdError::BadDescriptor)
    }

    /// Resolve `fd` under the shared lock together with a copy of its full
    /// capability set.
    pub fn get_cap(&self, fd: RawFd, needed: CapRights) -> FdResult<(FileRef, Filecaps)> {
        let fd = index(fd)?;
        let fdt = self.read();
        let caps = fdt.caps(fd).ok_or(FdError::BadDescriptor)?;
        caps.check(needed)?;
        let file = fdt.file_ref(fd).ok_or(FdError::BadDescriptor)?;
        Ok((file, caps))
    }

    /// Resolve `fd` for a generic operation.
    #[inline]
    pub fn fget(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        self.get_unlocked(fd, needed)
    }

    /// Resolve `fd` for reading. The file must have been opened for reading.
    pub fn fget_read(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        let file = self.get_unlocked(fd, needed | CapRights::READ)?;
        if file.flags().contains(FileFlags::READ) {
            Ok(file)
        } else {
            Err(FdError::BadDescriptor)
        }
    }

    /// Resolve `fd` for writing. The file must have been opened for writing.
    pub fn fget_write(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        let file = self.get_unlocked(fd, needed | CapRights::WRITE)?;
        if file.flags().contains(FileFlags::WRITE) {
            Ok(file)
        } else {
            Err(FdError::BadDescriptor)
        }
    }

    /// Resolve `fd` for fcntl command `cmd`.
    pub fn fget_fcntl(&self, fd: RawFd, cmd: u32) -> FdResult<FileRef> {
        let r = self.resolve(fd, CapRights::FCNTL)?;
        check_fcntl(r.rights, r.fcntls, cmd)?;
        Ok(r.file)
    }

    /// Vnode behind `fd`. Files without one are `InvalidArgument`.
    pub fn fgetvp(&self, fd: RawFd, needed: CapRights) -> FdResult<VnodeRef> {
        self.get_unlocked(fd, needed)?
            .vnode()
            .ok_or(FdError::InvalidArgument)
    }

    /// Whether ioctl `cmd` is allowed on `fd`.
    pub fn cap_ioctl_check(&self, fd: RawFd, cmd: u64) -> FdResult<()> {
        let fd = index(fd)?;
        let fdt = self.read();
        fdt.caps(fd).ok_or(FdError::BadDescriptor)?.check_ioctl(cmd)
    }
}
