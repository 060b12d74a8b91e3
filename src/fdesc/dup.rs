//! Duplication, Close and Entry Updates
//!
//! Every operation here mutates the table under its exclusive lock and
//! publishes each slot change in a single sequence write section. A file
//! displaced from the table is closed only after the lock has been dropped.

use alloc::vec::Vec;

use bitflags::bitflags;
use log::trace;

use super::{FdCtx, FdFlags, FdWriteGuard, FileDesc};
use crate::cap::{CapRights, FcntlRights, Filecaps, IoctlList};
use crate::error::{FdError, FdResult};
use crate::file::{File, FileType};
use crate::RawFd;

/// Where a duplicate may land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupMode {
    /// Lowest free descriptor (dup).
    Normal,
    /// Lowest free descriptor at or above the target (F_DUPFD).
    Fcntl,
    /// Exactly the target, replacing any occupant (dup2).
    Fixed,
    /// Exactly the target, which must already be open.
    MustReplace,
}

bitflags! {
    /// Options for `dup`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DupFlags: u32 {
        /// Set close-on-exec on the new descriptor.
        const CLOEXEC = 1 << 0;
    }
}

bitflags! {
    /// Options for `close_range`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CloseRangeFlags: u32 {
        /// Mark the range close-on-exec instead of closing it.
        const CLOEXEC = 1 << 2;
    }
}

/// Flags of a duplicate: everything but close-on-exec is inherited.
fn dup_flags(src: FdFlags, cloexec: bool) -> FdFlags {
    let mut flags = src - FdFlags::CLOEXEC;
    flags.set(FdFlags::CLOEXEC, cloexec);
    flags
}

impl FileDesc {
    /// Duplicate `old`. See `DupMode` for where the copy lands.
    ///
    /// Rights and allow-lists are copied unchanged. On failure the table is
    /// left as it was.
    pub(crate) fn dup(
        &self,
        cx: &FdCtx<'_>,
        mode: DupMode,
        flags: DupFlags,
        old: RawFd,
        new: RawFd,
    ) -> FdResult<RawFd> {
        let oldfd = usize::try_from(old).map_err(|_| FdError::BadDescriptor)?;
        let newfd = match mode {
            DupMode::Normal => 0,
            _ => usize::try_from(new).map_err(|_| FdError::InvalidArgument)?,
        };
        if newfd >= cx.maxfd {
            return Err(match mode {
                DupMode::Fcntl => FdError::InvalidArgument,
                _ => FdError::TooManyOpen,
            });
        }
        let cloexec = flags.contains(DupFlags::CLOEXEC);

        let mut fdt = self.write();
        let caps = fdt.caps(oldfd).ok_or(FdError::BadDescriptor)?;
        let src_flags = fdt.flags(oldfd).ok_or(FdError::BadDescriptor)?;

        if oldfd == newfd && matches!(mode, DupMode::Fixed | DupMode::MustReplace) {
            if cloexec {
                fdt.set_flags(newfd, src_flags | FdFlags::CLOEXEC);
            }
            return Ok(new);
        }

        let file = fdt.file_ref(oldfd).ok_or(FdError::BadDescriptor)?;
        let new_flags = dup_flags(src_flags, cloexec);

        let target = match mode {
            DupMode::Normal | DupMode::Fcntl => {
                let fd = fdt.alloc(newfd, cx.maxfd, |n| cx.reserve(n))?;
                fdt.install(fd, file, caps, new_flags);
                fd
            }
            DupMode::MustReplace => {
                if fdt.file(newfd).is_none() {
                    return Err(FdError::BadDescriptor);
                }
                let displaced = fdt.replace(newfd, file, caps, new_flags);
                self.closefp(cx, fdt, newfd, displaced);
                return Ok(new);
            }
            DupMode::Fixed => {
                if newfd >= fdt.nfiles() {
                    if !cx.reserve(newfd + 1) {
                        return Err(FdError::TooManyOpen);
                    }
                    fdt.grow(newfd + 1);
                }
                if fdt.file(newfd).is_some() {
                    let displaced = fdt.replace(newfd, file, caps, new_flags);
                    trace!("fdesc: dup {} over open fd {}", oldfd, newfd);
                    self.closefp(cx, fdt, newfd, displaced);
                    return Ok(new);
                }
                fdt.install_at(newfd, file, caps, new_flags);
                newfd
            }
        };
        RawFd::try_from(target).map_err(|_| FdError::TooManyOpen)
    }

    /// Duplicate `old` into the lowest free descriptor with narrowed
    /// capabilities. Asking for anything `old` does not have fails.
    pub(crate) fn derive(
        &self,
        cx: &FdCtx<'_>,
        old: RawFd,
        caps: &Filecaps,
        cloexec: bool,
    ) -> FdResult<RawFd> {
        let oldfd = usize::try_from(old).map_err(|_| FdError::BadDescriptor)?;
        let mut fdt = self.write();
        let src = fdt.caps(oldfd).ok_or(FdError::BadDescriptor)?;
        let narrowed = src.narrow(caps)?;
        let src_flags = fdt.flags(oldfd).ok_or(FdError::BadDescriptor)?;
        let file = fdt.file_ref(oldfd).ok_or(FdError::BadDescriptor)?;
        let fd = fdt.alloc(0, cx.maxfd, |n| cx.reserve(n))?;
        fdt.install(fd, file, narrowed, dup_flags(src_flags, cloexec));
        RawFd::try_from(fd).map_err(|_| FdError::TooManyOpen)
    }

    /// Close `fd`.
    pub(crate) fn close(&self, cx: &FdCtx<'_>, fd: RawFd) -> FdResult<()> {
        let fd = usize::try_from(fd).map_err(|_| FdError::BadDescriptor)?;
        let mut fdt = self.write();
        let file = fdt.take(fd).ok_or(FdError::BadDescriptor)?;
        self.closefp(cx, fdt, fd, file);
        Ok(())
    }

    /// Close, or mark close-on-exec, every open descriptor in `low..=high`.
    pub(crate) fn close_range(
        &self,
        cx: &FdCtx<'_>,
        low: usize,
        high: usize,
        flags: CloseRangeFlags,
    ) -> FdResult<()> {
        if low > high {
            return Err(FdError::InvalidArgument);
        }
        if flags.contains(CloseRangeFlags::CLOEXEC) {
            let mut fdt = self.write();
            let Some(last) = fdt.lastfile() else {
                return Ok(());
            };
            for fd in low..=high.min(last) {
                if let Some(cur) = fdt.flags(fd) {
                    fdt.set_flags(fd, cur | FdFlags::CLOEXEC);
                }
            }
            return Ok(());
        }
        self.close_matching(cx, low, high, |_, _| true);
        Ok(())
    }

    /// Close every descriptor at or above `low`.
    pub(crate) fn closefrom(&self, cx: &FdCtx<'_>, low: usize) {
        self.close_matching(cx, low, usize::MAX, |_, _| true);
    }

    /// Exec: close close-on-exec descriptors and message queues.
    pub(crate) fn closeexec(&self, cx: &FdCtx<'_>) {
        self.close_matching(cx, 0, usize::MAX, |file, flags| {
            flags.contains(FdFlags::CLOEXEC) || file.file_type() == FileType::Mqueue
        });
    }

    /// Privilege-changing exec: close standard descriptors that are unsafe to
    /// hand to a more privileged image.
    pub(crate) fn setugid_safety(&self, cx: &FdCtx<'_>) {
        self.close_matching(cx, 0, 2, |file, _| file.ops().is_setugid_unsafe());
    }

    /// Close every open descriptor in `low..=high` accepted by `pred`.
    ///
    /// The lock is dropped around each close, so the table bounds are
    /// re-read on every step.
    fn close_matching(
        &self,
        cx: &FdCtx<'_>,
        low: usize,
        high: usize,
        pred: impl Fn(&File, FdFlags) -> bool,
    ) {
        let mut fd = low;
        loop {
            let mut fdt = self.write();
            let Some(last) = fdt.lastfile() else { return };
            let last = last.min(high);
            while fd <= last && !matches_at(&fdt, fd, &pred) {
                fd += 1;
            }
            if fd > last {
                return;
            }
            if let Some(file) = fdt.take(fd) {
                self.closefp(cx, fdt, fd, file);
            }
            fd += 1;
        }
    }

    /// F_GETFD.
    pub fn fd_flags(&self, fd: RawFd) -> FdResult<FdFlags> {
        let fd = usize::try_from(fd).map_err(|_| FdError::BadDescriptor)?;
        self.read()
            .view(fd)
            .map(|v| v.flags)
            .ok_or(FdError::BadDescriptor)
    }

    /// F_SETFD.
    pub fn set_fd_flags(&self, fd: RawFd, flags: FdFlags) -> FdResult<()> {
        self.update(fd, |fdt, fd| {
            fdt.set_flags(fd, flags);
            Ok(())
        })
    }

    /// Restrict the rights of `fd`.
    pub fn cap_rights_limit(&self, fd: RawFd, rights: CapRights) -> FdResult<()> {
        self.update_caps(fd, |caps| caps.limit_rights(rights))
    }

    /// Restrict the fcntl commands allowed on `fd`.
    pub fn cap_fcntls_limit(&self, fd: RawFd, mask: u32) -> FdResult<()> {
        self.update_caps(fd, |caps| {
            caps.check(CapRights::FCNTL)?;
            caps.limit_fcntls(mask)
        })
    }

    /// Restrict the ioctl commands allowed on `fd`.
    pub fn cap_ioctls_limit(&self, fd: RawFd, cmds: &[u64]) -> FdResult<()> {
        self.update_caps(fd, |caps| {
            caps.check(CapRights::IOCTL)?;
            caps.limit_ioctls(cmds)
        })
    }

    pub fn cap_rights_get(&self, fd: RawFd) -> FdResult<CapRights> {
        self.caps_of(fd).map(|c| c.rights)
    }

    pub fn cap_fcntls_get(&self, fd: RawFd) -> FdResult<FcntlRights> {
        self.caps_of(fd).map(|c| c.fcntls)
    }

    pub fn cap_ioctls_get(&self, fd: RawFd) -> FdResult<IoctlList> {
        self.caps_of(fd).map(|c| c.ioctls)
    }

    fn caps_of(&self, fd: RawFd) -> FdResult<Filecaps> {
        let fd = usize::try_from(fd).map_err(|_| FdError::BadDescriptor)?;
        self.read().caps(fd).ok_or(FdError::BadDescriptor)
    }

    fn update_caps(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut Filecaps) -> FdResult<()>,
    ) -> FdResult<()> {
        self.update(fd, |fdt, fd| {
            let mut caps = fdt.caps(fd).ok_or(FdError::BadDescriptor)?;
            f(&mut caps)?;
            fdt.set_caps(fd, caps);
            Ok(())
        })
    }

    fn update(
        &self,
        fd: RawFd,
        f: impl FnOnce(&mut FdWriteGuard<'_>, usize) -> FdResult<()>,
    ) -> FdResult<()> {
        let fd = usize::try_from(fd).map_err(|_| FdError::BadDescriptor)?;
        let mut fdt = self.write();
        if fdt.file(fd).is_none() {
            return Err(FdError::BadDescriptor);
        }
        f(&mut fdt, fd)
    }

    /// Open descriptors, for callers that need a consistent list.
    pub fn open_fds(&self) -> Vec<usize> {
        let fdt = self.read();
        match fdt.lastfile() {
            Some(last) => (0..=last).filter(|&fd| fdt.file(fd).is_some()).collect(),
            None => Vec::new(),
        }
    }
}

fn matches_at(fdt: &FdWriteGuard<'_>, fd: usize, pred: &impl Fn(&File, FdFlags) -> bool) -> bool {
    match (fdt.file(fd), fdt.flags(fd)) {
        (Some(file), Some(flags)) => pred(file, flags),
        _ => false,
    }
}
