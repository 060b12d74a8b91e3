//! Process Descriptor Context
//!
//! `Process` is everything a system call needs to act on "the current
//! process's" descriptors: its table share, its working-directory descriptor,
//! its lock-owner identity and ring link, its limits, the system it is charged
//! against and the collaborator hooks.
//!
//! # Lifecycle
//! - `fork` copies, clears or shares the table and the pwd descriptor
//! - `exec` makes the table private, then drops close-on-exec entries
//! - `exit` (or dropping the `Process`) releases advisory locks, leaves the
//!   leader ring and drops the share

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::debug;

use crate::cap::{CapRights, Filecaps};
use crate::config::{ChrootPolicy, FdLimits};
use crate::error::{FdError, FdResult};
use crate::fdesc::{CloseRangeFlags, FdCtx, FdFlags, FdescRef, FileDesc, Leader, LeaderLink};
use crate::file::{File, FileFlags, FileOps, FileRef, VnodeRef};
use crate::hooks::{FdHooks, LockOwner};
use crate::pwd::{Pwd, PwdDesc, PwdFields, PwdRef};
use crate::system::FdSystem;
use crate::RawFd;

pub use crate::fdesc::{DupFlags, DupMode};

/// How a child obtains its descriptor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkMode {
    /// Private copy of the table and the pwd descriptor.
    Copy,
    /// Empty table; same directories, default creation mask.
    Clean,
    /// Share the table and pwd descriptor; the child is a new lock owner.
    Share,
    /// Share the table and pwd descriptor under the parent's lock owner.
    ShareThread,
}

/// Descriptor state of one process.
pub struct Process {
    pid: u32,
    fd: FdescRef,
    pd: Arc<PwdDesc>,
    leader: Arc<Leader>,
    /// Link on the table's leader ring; set once the table is shared.
    fdtol: Option<Arc<LeaderLink>>,
    limits: FdLimits,
    sys: Arc<FdSystem>,
    hooks: Arc<dyn FdHooks>,
}

impl Process {
    /// A process with an empty table and empty directories.
    pub fn new(pid: u32, sys: Arc<FdSystem>, hooks: Arc<dyn FdHooks>) -> Self {
        Self {
            pid,
            fd: FdescRef::new(),
            pd: PwdDesc::new(),
            leader: Leader::new(LockOwner(pid)),
            fdtol: None,
            limits: FdLimits::default(),
            sys,
            hooks,
        }
    }

    pub fn with_limits(mut self, limits: FdLimits) -> Self {
        self.limits = limits;
        self
    }

    #[inline]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The descriptor table share.
    #[inline]
    pub fn fd(&self) -> &FdescRef {
        &self.fd
    }

    #[inline]
    pub fn pwd_desc(&self) -> &Arc<PwdDesc> {
        &self.pd
    }

    #[inline]
    pub fn leader(&self) -> &Arc<Leader> {
        &self.leader
    }

    #[inline]
    pub fn leader_link(&self) -> Option<&Arc<LeaderLink>> {
        self.fdtol.as_ref()
    }

    #[inline]
    pub fn limits(&self) -> FdLimits {
        self.limits
    }

    pub fn set_limits(&mut self, limits: FdLimits) {
        self.limits = limits;
    }

    #[inline]
    pub fn system(&self) -> &Arc<FdSystem> {
        &self.sys
    }

    fn cx(&self) -> FdCtx<'_> {
        FdCtx {
            pid: self.pid,
            maxfd: self.limits.max_fd().min(RawFd::MAX as usize),
            hooks: &*self.hooks,
            leader: &self.leader,
            fdtol: self.fdtol.as_ref(),
        }
    }

    /// Record that this process's leader has taken a POSIX advisory lock.
    pub fn mark_advlock(&self) {
        self.leader.mark_advlock();
    }

    /// Create a file charged against the system's open-file limit, without
    /// installing it.
    pub fn falloc_noinstall(&self, ops: Box<dyn FileOps>, flags: FileFlags) -> FdResult<FileRef> {
        File::new_charged(self.sys.clone(), ops, flags)
    }

    /// Create a file and install it at the lowest free descriptor with full
    /// rights.
    pub fn falloc(&self, ops: Box<dyn FileOps>, flags: FileFlags) -> FdResult<(FileRef, RawFd)> {
        let file = self.falloc_noinstall(ops, flags)?;
        let fd = self.finstall(file.clone(), Filecaps::all(), FdFlags::empty())?;
        Ok((file, fd))
    }

    /// Install `file` at the lowest free descriptor.
    pub fn finstall(&self, file: FileRef, caps: Filecaps, flags: FdFlags) -> FdResult<RawFd> {
        let cx = self.cx();
        let mut fdt = self.fd.write();
        let fd = fdt.alloc(0, cx.maxfd, |n| cx.reserve(n))?;
        fdt.install(fd, file, caps, flags);
        Ok(fd as RawFd)
    }

    /// Install every file or none of them.
    pub fn finstall_n(&self, files: Vec<(FileRef, Filecaps)>, flags: FdFlags) -> FdResult<Vec<RawFd>> {
        let cx = self.cx();
        let mut fdt = self.fd.write();
        let fds = fdt.alloc_n(files.len(), cx.maxfd, |n| cx.reserve(n))?;
        let mut raws = Vec::with_capacity(fds.len());
        for (fd, (file, caps)) in fds.into_iter().zip(files) {
            fdt.install(fd, file, caps, flags);
            raws.push(fd as RawFd);
        }
        Ok(raws)
    }

    pub fn fget(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        self.fd.fget(fd, needed)
    }

    pub fn fget_read(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        self.fd.fget_read(fd, needed)
    }

    pub fn fget_write(&self, fd: RawFd, needed: CapRights) -> FdResult<FileRef> {
        self.fd.fget_write(fd, needed)
    }

    pub fn fget_cap(&self, fd: RawFd, needed: CapRights) -> FdResult<(FileRef, Filecaps)> {
        self.fd.get_cap(fd, needed)
    }

    pub fn fgetvp(&self, fd: RawFd, needed: CapRights) -> FdResult<VnodeRef> {
        self.fd.fgetvp(fd, needed)
    }

    /// Duplicate `old` according to `mode`.
    pub fn dup_with(&self, mode: DupMode, flags: DupFlags, old: RawFd, new: RawFd) -> FdResult<RawFd> {
        self.fd.dup(&self.cx(), mode, flags, old, new)
    }

    /// dup(2).
    pub fn dup(&self, old: RawFd) -> FdResult<RawFd> {
        self.dup_with(DupMode::Normal, DupFlags::empty(), old, 0)
    }

    /// dup2(2).
    pub fn dup2(&self, old: RawFd, new: RawFd) -> FdResult<RawFd> {
        self.dup_with(DupMode::Fixed, DupFlags::empty(), old, new)
    }

    /// F_DUPFD / F_DUPFD_CLOEXEC.
    pub fn fcntl_dupfd(&self, old: RawFd, min: RawFd, cloexec: bool) -> FdResult<RawFd> {
        let flags = if cloexec {
            DupFlags::CLOEXEC
        } else {
            DupFlags::empty()
        };
        self.dup_with(DupMode::Fcntl, flags, old, min)
    }

    /// Duplicate `old` with narrowed capabilities.
    pub fn derive(&self, old: RawFd, caps: &Filecaps, cloexec: bool) -> FdResult<RawFd> {
        self.fd.derive(&self.cx(), old, caps, cloexec)
    }

    pub fn close(&self, fd: RawFd) -> FdResult<()> {
        self.fd.close(&self.cx(), fd)
    }

    /// close_range(2).
    pub fn close_range(&self, low: u32, high: u32, flags: CloseRangeFlags) -> FdResult<()> {
        self.fd
            .close_range(&self.cx(), low as usize, high as usize, flags)
    }

    /// closefrom(2). Negative values close everything.
    pub fn closefrom(&self, low: RawFd) {
        let low = usize::try_from(low).unwrap_or(0);
        self.fd.closefrom(&self.cx(), low);
    }

    /// Descriptor state for a child `child_pid`.
    pub fn fork(&mut self, child_pid: u32, mode: ForkMode) -> Process {
        let (fd, pd, leader, fdtol) = match mode {
            ForkMode::Copy => (
                self.fd.copy(),
                self.pd.copy(),
                Leader::new(LockOwner(child_pid)),
                None,
            ),
            ForkMode::Clean => (
                FdescRef::new(),
                self.pd.init_from(),
                Leader::new(LockOwner(child_pid)),
                None,
            ),
            ForkMode::Share | ForkMode::ShareThread => {
                let parent_link = self.ensure_leader_link();
                let (leader, link) = if mode == ForkMode::ShareThread {
                    self.fd.share_link(&parent_link);
                    (self.leader.clone(), parent_link)
                } else {
                    let leader = Leader::new(LockOwner(child_pid));
                    let link = self.fd.join_leaders(leader.clone());
                    (leader, link)
                };
                (self.fd.share(), self.pd.clone(), leader, Some(link))
            }
        };
        debug!("proc: pid {} forked {} ({:?})", self.pid, child_pid, mode);
        Process {
            pid: child_pid,
            fd,
            pd,
            leader,
            fdtol,
            limits: self.limits,
            sys: self.sys.clone(),
            hooks: self.hooks.clone(),
        }
    }

    fn ensure_leader_link(&mut self) -> Arc<LeaderLink> {
        match &self.fdtol {
            Some(link) => link.clone(),
            None => {
                let link = self.fd.join_leaders(self.leader.clone());
                self.fdtol = Some(link.clone());
                link
            }
        }
    }

    /// Release locks and leave the leader ring of the current table.
    fn leave_table(&mut self) {
        self.fd.clear_locks(&self.cx());
        self.fdtol = None;
    }

    /// Leave the leader ring of the current table, keeping locks.
    fn leave_ring(&mut self) {
        self.fd.leave_leaders(&self.cx());
        self.fdtol = None;
    }

    /// Exec a new image.
    ///
    /// A shared table is replaced with a private copy; close-on-exec entries
    /// are closed; with `setugid`, unsafe standard descriptors are closed too.
    pub fn exec(&mut self, setugid: bool) {
        if self.fd.is_shared() {
            let copy = self.fd.copy();
            self.leave_ring();
            let old = core::mem::replace(&mut self.fd, copy);
            drop(old);
        }
        let cx = self.cx();
        self.fd.closeexec(&cx);
        if setugid {
            self.fd.setugid_safety(&cx);
        }
        self.pd = PwdDesc::unshare(self.pd.clone());
    }

    /// Process exit. Teardown happens in `Drop`.
    pub fn exit(self) {
        debug!("proc: pid {} exiting", self.pid);
    }

    /// Current snapshot.
    pub fn pwd(&self) -> PwdRef {
        self.pd.hold()
    }

    pub fn chdir(&self, vp: VnodeRef) -> FdResult<()> {
        if !vp.is_dir() {
            return Err(FdError::NotDirectory);
        }
        self.pd.replace(PwdFields {
            cdir: Some(vp),
            ..PwdFields::default()
        });
        Ok(())
    }

    /// Change directory to the vnode behind `fd`.
    pub fn fchdir(&self, fd: RawFd) -> FdResult<()> {
        let vp = self.fd.fgetvp(fd, CapRights::FCHDIR)?;
        self.chdir(vp)
    }

    pub fn chroot(&self, vp: VnodeRef) -> FdResult<()> {
        self.chroot_with(vp, false)
    }

    /// chroot and chdir to the same directory in one step.
    pub fn chroot_chdir(&self, vp: VnodeRef) -> FdResult<()> {
        self.chroot_with(vp, true)
    }

    fn chroot_with(&self, vp: VnodeRef, chdir: bool) -> FdResult<()> {
        if !vp.is_dir() {
            return Err(FdError::NotDirectory);
        }
        self.pd.update(|old| {
            self.check_chroot(old)?;
            Ok(PwdFields {
                cdir: chdir.then(|| vp.clone()),
                rdir: Some(vp.clone()),
                jdir: old.jdir().is_none().then(|| vp.clone()),
                adir: None,
            })
        })
    }

    fn check_chroot(&self, old: &Pwd) -> FdResult<()> {
        let refuse = match self.sys.chroot_policy() {
            ChrootPolicy::RefuseOpenDirs => true,
            ChrootPolicy::RefuseIfChrooted => old.is_chrooted(self.sys.rootvnode().as_ref()),
            ChrootPolicy::AllowOpenDirs => false,
        };
        if refuse && has_open_dirs(&self.fd) {
            debug!("proc: pid {} chroot refused, open directory", self.pid);
            return Err(FdError::PermissionDenied);
        }
        Ok(())
    }

    /// Set the alternate root used by emulated ABIs.
    pub fn altroot(&self, vp: VnodeRef) -> FdResult<()> {
        if !vp.is_dir() {
            return Err(FdError::NotDirectory);
        }
        self.pd.replace(PwdFields {
            adir: Some(vp),
            ..PwdFields::default()
        });
        Ok(())
    }

    /// Fill a missing current or root directory with the system root.
    pub fn ensure_dirs(&self) {
        {
            let pwd = self.pd.borrow();
            if pwd.cdir().is_some() && pwd.rdir().is_some() {
                return;
            }
        }
        let Some(root) = self.sys.rootvnode() else { return };
        let _ = self.pd.update(|old| {
            Ok(PwdFields {
                cdir: old.cdir().is_none().then(|| root.clone()),
                rdir: old.rdir().is_none().then(|| root.clone()),
                ..PwdFields::default()
            })
        });
    }

    /// Mount `vp` as the system root and move this process into it.
    pub fn set_rootvnode(&self, vp: VnodeRef) {
        self.sys.store_rootvnode(vp.clone());
        self.pd.replace(PwdFields {
            cdir: Some(vp.clone()),
            rdir: Some(vp),
            ..PwdFields::default()
        });
    }

    /// umask(2): set the creation mask and return the previous one.
    pub fn umask(&self, mask: u16) -> u16 {
        self.pd.set_cmask(mask)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.leave_table();
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("fd", &self.fd)
            .field("leader", &self.leader.owner())
            .field("linked", &self.fdtol.is_some())
            .finish()
    }
}

/// Whether any open descriptor refers to a directory.
fn has_open_dirs(fdp: &FileDesc) -> bool {
    let fdt = fdp.read();
    let Some(last) = fdt.lastfile() else {
        return false;
    };
    (0..=last).any(|fd| fdt.file(fd).is_some_and(File::is_dir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::FileType;
    use crate::pwd::same_vnode;
    use crate::testutil::{RecordingHooks, TestFile, TestVnode};

    fn process(pid: u32, policy: ChrootPolicy) -> (Process, Arc<RecordingHooks>) {
        let hooks = Arc::new(RecordingHooks::default());
        let sys = FdSystem::new(64, policy);
        (Process::new(pid, sys, hooks.clone()), hooks)
    }

    fn open(p: &Process, ftype: FileType) -> RawFd {
        p.falloc(TestFile::new(ftype).0, FileFlags::READ).unwrap().1
    }

    fn open_dir(p: &Process) -> RawFd {
        let (ops, _) = TestFile::with_vnode(TestVnode::dir());
        p.falloc(ops, FileFlags::READ).unwrap().1
    }

    #[test]
    fn test_falloc_lowest_with_full_rights() {
        let (p, _) = process(1, ChrootPolicy::default());
        assert_eq!(open(&p, FileType::Pipe), 0);
        assert_eq!(open(&p, FileType::Pipe), 1);
        p.close(0).unwrap();
        assert_eq!(open(&p, FileType::Pipe), 0);
        assert_eq!(p.fd().cap_rights_get(0), Ok(CapRights::all()));
        assert_eq!(p.system().openfiles(), 2);
    }

    #[test]
    fn test_falloc_process_limit() {
        let (p, _) = process(1, ChrootPolicy::default());
        let p = p.with_limits(FdLimits::with_rlimit(3));
        for fd in 0..3 {
            assert_eq!(open(&p, FileType::Pipe), fd);
        }
        let err = p.falloc(TestFile::new(FileType::Pipe).0, FileFlags::READ);
        assert_eq!(err.unwrap_err(), FdError::TooManyOpen);
        // The refused file is released and uncharged.
        assert_eq!(p.system().openfiles(), 3);
        assert_eq!(p.fd().count(), 3);
    }

    #[test]
    fn test_falloc_system_limit() {
        let hooks = Arc::new(RecordingHooks::default());
        let p = Process::new(1, FdSystem::new(1, ChrootPolicy::default()), hooks);
        open(&p, FileType::Pipe);
        let err = p.falloc(TestFile::new(FileType::Pipe).0, FileFlags::READ);
        assert_eq!(err.unwrap_err(), FdError::FileTableFull);
        assert_eq!(p.fd().count(), 1);
    }

    #[test]
    fn test_finstall_n_all_or_nothing() {
        let (p, _) = process(1, ChrootPolicy::default());
        let p = p.with_limits(FdLimits::with_rlimit(4));
        open(&p, FileType::Pipe);
        let files = |n: usize| {
            (0..n)
                .map(|_| (File::new(TestFile::new(FileType::Socket).0, FileFlags::READ), Filecaps::all()))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            p.finstall_n(files(4), FdFlags::CLOEXEC),
            Err(FdError::TooManyOpen)
        );
        assert_eq!(p.fd().count(), 1);
        assert_eq!(p.finstall_n(files(3), FdFlags::CLOEXEC), Ok(vec![1, 2, 3]));
        assert_eq!(p.fd().fd_flags(2), Ok(FdFlags::CLOEXEC));
    }

    #[test]
    fn test_dup_family() {
        let (p, hooks) = process(1, ChrootPolicy::default());
        let fd = open(&p, FileType::Pipe);
        assert_eq!(p.dup(fd), Ok(1));
        assert_eq!(p.dup2(fd, 9), Ok(9));
        assert_eq!(p.fcntl_dupfd(fd, 5, true), Ok(5));
        assert_eq!(p.fd().fd_flags(5), Ok(FdFlags::CLOEXEC));
        assert_eq!(p.dup(-1), Err(FdError::BadDescriptor));

        p.close_range(5, 9, CloseRangeFlags::empty()).unwrap();
        assert_eq!(p.fd().open_fds(), [0, 1]);
        p.closefrom(-3);
        assert_eq!(p.fd().count(), 0);
        assert_eq!(hooks.closed(), [(1, 5), (1, 9), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_derive_narrows() {
        let (p, _) = process(1, ChrootPolicy::default());
        let fd = open(&p, FileType::Pipe);
        let narrow = Filecaps::with_rights(CapRights::READ);
        let copy = p.derive(fd, &narrow, false).unwrap();
        assert_eq!(p.fd().cap_rights_get(copy), Ok(CapRights::READ));
        assert_eq!(p.fget(copy, CapRights::WRITE).unwrap_err(), FdError::NotCapable);
        let wider = Filecaps::with_rights(CapRights::READ | CapRights::WRITE);
        assert_eq!(p.derive(copy, &wider, false), Err(FdError::NotCapable));
    }

    #[test]
    fn test_fork_copy_is_independent() {
        let (mut p, _) = process(1, ChrootPolicy::default());
        let (file, fd) = p
            .falloc(TestFile::new(FileType::Pipe).0, FileFlags::READ)
            .unwrap();
        p.umask(0o077);
        let child = p.fork(2, ForkMode::Copy);

        assert!(!FdescRef::ptr_eq(p.fd(), child.fd()));
        assert_eq!(file.refcount(), 3);
        child.close(fd).unwrap();
        assert!(p.fget(fd, CapRights::READ).is_ok());
        assert_eq!(child.umask(0o022), 0o077);
        assert!(child.leader_link().is_none());
    }

    #[test]
    fn test_fork_clean() {
        let (mut p, _) = process(1, ChrootPolicy::default());
        let root = TestVnode::dir();
        p.set_rootvnode(root.clone());
        open(&p, FileType::Pipe);
        p.umask(0o077);

        let child = p.fork(2, ForkMode::Clean);
        assert_eq!(child.fd().count(), 0);
        assert_eq!(child.pwd_desc().cmask(), crate::config::CMASK);
        assert!(same_vnode(child.pwd().cdir().unwrap(), &root));
    }

    #[test]
    fn test_fork_share_joins_ring() {
        let (mut p, _) = process(1, ChrootPolicy::default());
        let child = p.fork(2, ForkMode::Share);
        assert!(FdescRef::ptr_eq(p.fd(), child.fd()));
        assert!(Arc::ptr_eq(p.pwd_desc(), child.pwd_desc()));
        assert_eq!(p.fd().leader_count(), 2);
        assert_eq!(child.leader().owner(), LockOwner(2));

        let fd = open(&child, FileType::Pipe);
        assert!(p.fget(fd, CapRights::READ).is_ok());

        let link = child.leader_link().cloned().unwrap();
        child.exit();
        assert!(!link.is_linked());
        assert_eq!(p.fd().leader_count(), 1);
        assert!(p.fget(fd, CapRights::READ).is_ok());
    }

    #[test]
    fn test_fork_share_thread_shares_link() {
        let (mut p, _) = process(1, ChrootPolicy::default());
        let child = p.fork(2, ForkMode::ShareThread);
        assert!(Arc::ptr_eq(p.leader(), child.leader()));
        let link = p.leader_link().cloned().unwrap();
        assert!(Arc::ptr_eq(&link, child.leader_link().unwrap()));
        assert_eq!(link.refcount(), 2);
        assert_eq!(p.fd().leader_count(), 1);

        child.exit();
        assert!(link.is_linked());
        assert_eq!(link.refcount(), 1);
    }

    #[test]
    fn test_exec_unshares_then_closes_cloexec() {
        let (mut p, _) = process(1, ChrootPolicy::default());
        let keep = open(&p, FileType::Pipe);
        let gone = open(&p, FileType::Pipe);
        p.fd().set_fd_flags(gone, FdFlags::CLOEXEC).unwrap();
        let mq = open(&p, FileType::Mqueue);

        let mut child = p.fork(2, ForkMode::Share);
        child.exec(false);

        assert!(!FdescRef::ptr_eq(p.fd(), child.fd()));
        assert!(!Arc::ptr_eq(p.pwd_desc(), child.pwd_desc()));
        assert!(child.leader_link().is_none());
        assert_eq!(p.fd().leader_count(), 1);
        assert_eq!(child.fd().open_fds(), [keep as usize]);
        assert_eq!(p.fd().open_fds(), [keep as usize, gone as usize, mq as usize]);
    }

    #[test]
    fn test_exec_setugid_closes_unsafe_stdio() {
        let (mut p, _) = process(1, ChrootPolicy::default());
        let unsafe_fd = p
            .falloc(TestFile::setugid_unsafe(FileType::Vnode).0, FileFlags::READ)
            .unwrap()
            .1;
        let safe_fd = open(&p, FileType::Pipe);
        p.exec(false);
        assert_eq!(p.fd().count(), 2);
        p.exec(true);
        assert!(!p.fd().is_used(unsafe_fd as usize));
        assert!(p.fd().is_used(safe_fd as usize));
    }

    #[test]
    fn test_exit_releases_own_locks() {
        let (p, hooks) = process(5, ChrootPolicy::default());
        let (ops, _) = TestFile::with_vnode(TestVnode::file());
        p.falloc(ops, FileFlags::READ).unwrap();
        open(&p, FileType::Socket);
        p.mark_advlock();
        let sys = p.system().clone();
        p.exit();
        assert_eq!(hooks.released(), [LockOwner(5)]);
        assert_eq!(sys.openfiles(), 0);
    }

    #[test]
    fn test_exec_keeps_advisory_locks() {
        let (mut p, hooks) = process(1, ChrootPolicy::default());
        let mut child = p.fork(2, ForkMode::Share);
        let (ops, _) = TestFile::with_vnode(TestVnode::file());
        let (_, fd) = child.falloc(ops, FileFlags::READ).unwrap();
        child.mark_advlock();

        child.exec(false);
        assert!(child.fd().is_used(fd as usize));
        assert!(child.leader_link().is_none());
        assert_eq!(p.fd().leader_count(), 1);
        assert!(hooks.released().is_empty());

        child.exit();
        assert_eq!(hooks.released(), [LockOwner(2)]);
    }

    #[test]
    fn test_dropped_share_child_leaves_ring() {
        let (mut p, _) = process(1, ChrootPolicy::default());
        let child = p.fork(2, ForkMode::Share);
        let link = child.leader_link().cloned().unwrap();
        assert_eq!(p.fd().leader_count(), 2);

        drop(child);
        assert!(!link.is_linked());
        assert_eq!(p.fd().leader_count(), 1);
    }

    #[test]
    fn test_chdir_and_fchdir() {
        let (p, _) = process(1, ChrootPolicy::default());
        assert_eq!(p.chdir(TestVnode::file()), Err(FdError::NotDirectory));

        let dir = TestVnode::dir();
        p.chdir(dir.clone()).unwrap();
        assert!(same_vnode(p.pwd().cdir().unwrap(), &dir));

        let pipe = open(&p, FileType::Pipe);
        assert_eq!(p.fchdir(pipe), Err(FdError::InvalidArgument));
        let (ops, _) = TestFile::with_vnode(TestVnode::file());
        let (_, plain) = p.falloc(ops, FileFlags::READ).unwrap();
        assert_eq!(p.fchdir(plain), Err(FdError::NotDirectory));
        let target = TestVnode::dir();
        let (ops, _) = TestFile::with_vnode(target.clone());
        let (_, dfd) = p.falloc(ops, FileFlags::READ).unwrap();
        p.fd().cap_rights_limit(dfd, CapRights::READ).unwrap();
        assert_eq!(p.fchdir(dfd), Err(FdError::NotCapable));
        let (ops, _) = TestFile::with_vnode(target.clone());
        let (_, dfd) = p.falloc(ops, FileFlags::READ).unwrap();
        p.fchdir(dfd).unwrap();
        assert!(same_vnode(p.pwd().cdir().unwrap(), &target));
    }

    #[test]
    fn test_chroot_refuses_open_dirs() {
        let (p, _) = process(1, ChrootPolicy::RefuseOpenDirs);
        p.chroot(TestVnode::dir()).unwrap();
        open_dir(&p);
        assert_eq!(p.chroot(TestVnode::dir()), Err(FdError::PermissionDenied));
    }

    #[test]
    fn test_chroot_refuses_only_when_chrooted() {
        let (p, _) = process(1, ChrootPolicy::RefuseIfChrooted);
        let root = TestVnode::dir();
        p.set_rootvnode(root.clone());
        open_dir(&p);

        let jail = TestVnode::dir();
        p.chroot(jail.clone()).unwrap();
        let pwd = p.pwd();
        assert!(same_vnode(pwd.rdir().unwrap(), &jail));
        assert!(same_vnode(pwd.jdir().unwrap(), &jail));
        assert!(same_vnode(pwd.cdir().unwrap(), &root));

        assert_eq!(p.chroot(TestVnode::dir()), Err(FdError::PermissionDenied));
        assert!(PwdRef::ptr_eq(&pwd, &p.pwd()));
    }

    #[test]
    fn test_chroot_allowed_by_policy() {
        let (p, _) = process(1, ChrootPolicy::AllowOpenDirs);
        open_dir(&p);
        let first = TestVnode::dir();
        p.chroot(first.clone()).unwrap();
        let second = TestVnode::dir();
        p.chroot_chdir(second.clone()).unwrap();
        let pwd = p.pwd();
        assert!(same_vnode(pwd.rdir().unwrap(), &second));
        assert!(same_vnode(pwd.cdir().unwrap(), &second));
        // The jail root is set once.
        assert!(same_vnode(pwd.jdir().unwrap(), &first));
    }

    #[test]
    fn test_altroot_and_ensure_dirs() {
        let (p, _) = process(1, ChrootPolicy::default());
        p.ensure_dirs();
        assert!(p.pwd().cdir().is_none());

        let root = TestVnode::dir();
        p.system().store_rootvnode(root.clone());
        let cwd = TestVnode::dir();
        p.chdir(cwd.clone()).unwrap();
        p.ensure_dirs();
        let pwd = p.pwd();
        assert!(same_vnode(pwd.cdir().unwrap(), &cwd));
        assert!(same_vnode(pwd.rdir().unwrap(), &root));

        assert_eq!(p.altroot(TestVnode::file()), Err(FdError::NotDirectory));
        let alt = TestVnode::dir();
        p.altroot(alt.clone()).unwrap();
        assert!(same_vnode(p.pwd().adir().unwrap(), &alt));
    }

    #[test]
    fn test_umask() {
        let (p, _) = process(1, ChrootPolicy::default());
        assert_eq!(p.umask(0o027), crate::config::CMASK);
        assert_eq!(p.umask(0o022), 0o027);
    }
}
