//! Lock-Owner Coordination
//!
//! POSIX record locks belong to a process leader, not to a descriptor. When
//! several leaders share one table, closing a vnode file through any of them
//! has to drop the locks every sharing leader holds on that vnode.
//!
//! # Design
//! - Each leader sharing a table has a `LeaderLink` on the table's ring
//! - A closer releasing a sibling's locks pins the sibling's link
//!   (`holdcount`) while it runs without the table lock
//! - Closes that may touch the ring are counted in `FdState::holdleaders`
//! - A leader leaving the ring waits until nobody pins its link and, if it
//!   holds locks, until no close is in flight
//!
//! Waits spin with the table lock dropped.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use log::debug;

use super::{FdCtx, FdWriteGuard, FileDesc};
use crate::file::{FileRef, FileType};
use crate::hooks::LockOwner;
use crate::sync::race_window;

/// A process leader, as seen by advisory locking.
#[derive(Debug)]
pub struct Leader {
    owner: LockOwner,
    advlock: AtomicBool,
}

impl Leader {
    pub fn new(owner: LockOwner) -> Arc<Self> {
        Arc::new(Self {
            owner,
            advlock: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Whether this leader ever took a POSIX lock.
    #[inline]
    pub fn has_advlock(&self) -> bool {
        self.advlock.load(Ordering::Acquire)
    }

    /// Record that this leader took a POSIX lock.
    pub fn mark_advlock(&self) {
        self.advlock.store(true, Ordering::Release);
    }
}

/// A leader's membership in a shared table's ring.
///
/// Counters are only changed under the table's exclusive lock.
#[derive(Debug)]
pub struct LeaderLink {
    leader: Arc<Leader>,
    /// Processes using this link.
    refcount: AtomicUsize,
    /// Closers currently releasing this leader's locks.
    holdcount: AtomicUsize,
    linked: AtomicBool,
}

impl LeaderLink {
    #[inline]
    pub fn leader(&self) -> &Arc<Leader> {
        &self.leader
    }

    #[inline]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn holdcount(&self) -> usize {
        self.holdcount.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Relaxed)
    }
}

impl FileDesc {
    /// Put `leader` on this table's ring.
    pub(crate) fn join_leaders(&self, leader: Arc<Leader>) -> Arc<LeaderLink> {
        let link = Arc::new(LeaderLink {
            leader,
            refcount: AtomicUsize::new(1),
            holdcount: AtomicUsize::new(0),
            linked: AtomicBool::new(true),
        });
        self.write().state().leaders.push(link.clone());
        link
    }

    /// Another process (a thread-sharing child) starts using `link`.
    pub(crate) fn share_link(&self, link: &Arc<LeaderLink>) {
        let _fdt = self.write();
        link.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of links on the ring.
    pub fn leader_count(&self) -> usize {
        self.read().st.leaders.len()
    }

    /// Finish closing `fd`, whose entry has already been taken out.
    ///
    /// Notifies the event hook, drops the lock, then runs `closef`.
    pub(crate) fn closefp(&self, cx: &FdCtx<'_>, mut fdt: FdWriteGuard<'_>, fd: usize, file: FileRef) {
        let holdleaders = cx.fdtol.is_some();
        if holdleaders {
            fdt.state().holdleaders += 1;
        }
        cx.hooks.fd_closed(cx.pid, fd);
        drop(fdt);

        self.closef(cx, file);

        if holdleaders {
            self.write().state().holdleaders -= 1;
        }
    }

    /// Release advisory locks on `file` for every leader that may hold them,
    /// then drop the reference.
    pub(crate) fn closef(&self, cx: &FdCtx<'_>, file: FileRef) {
        if file.file_type() == FileType::Vnode {
            if cx.leader.has_advlock() {
                cx.hooks.release_posix_locks(cx.leader.owner(), &file);
            }
            if let Some(own) = cx.fdtol {
                self.release_sibling_locks(cx, own, &file);
            }
        }
        drop(file);
    }

    fn release_sibling_locks(&self, cx: &FdCtx<'_>, own: &Arc<LeaderLink>, file: &FileRef) {
        let siblings: Vec<Arc<LeaderLink>> = {
            let fdt = self.read();
            fdt.st
                .leaders
                .iter()
                .filter(|link| !Arc::ptr_eq(link, own))
                .cloned()
                .collect()
        };
        for link in siblings {
            {
                let _fdt = self.write();
                if !link.is_linked() || !link.leader.has_advlock() {
                    continue;
                }
                link.holdcount.fetch_add(1, Ordering::Relaxed);
            }
            race_window();
            cx.hooks.release_posix_locks(link.leader.owner(), file);
            let _fdt = self.write();
            link.holdcount.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Exit path: release this leader's locks on every vnode file and leave
    /// the ring once nobody depends on the link.
    pub(crate) fn clear_locks(&self, cx: &FdCtx<'_>) {
        self.release_own_locks(cx);
        self.leave_leaders(cx);
    }

    /// Release the locks `cx.leader` owns on every vnode file in the table.
    pub(crate) fn release_own_locks(&self, cx: &FdCtx<'_>) {
        if cx.leader.has_advlock() {
            let mut fd = 0;
            loop {
                let next = {
                    let fdt = self.write();
                    let Some(last) = fdt.lastfile() else { break };
                    while fd <= last
                        && !fdt
                            .file(fd)
                            .is_some_and(|f| f.file_type() == FileType::Vnode)
                    {
                        fd += 1;
                    }
                    if fd > last {
                        break;
                    }
                    fdt.file_ref(fd)
                };
                if let Some(file) = next {
                    cx.hooks.release_posix_locks(cx.leader.owner(), &file);
                }
                fd += 1;
            }
        }
    }

    /// Drop the caller's share of `cx.fdtol`, unlinking it from the ring when
    /// that was the last one. Locks stay in place.
    pub(crate) fn leave_leaders(&self, cx: &FdCtx<'_>) {
        let Some(link) = cx.fdtol else { return };
        loop {
            let mut fdt = self.write();
            if link.refcount() == 1 {
                let st = fdt.state();
                if st.holdleaders > 0 && cx.leader.has_advlock() {
                    debug!("fdesc: pid {} waiting for {} closes", cx.pid, st.holdleaders);
                    drop(fdt);
                    race_window();
                    spin_loop();
                    continue;
                }
                if link.holdcount() > 0 {
                    debug!("fdesc: pid {} waiting for link holders", cx.pid);
                    drop(fdt);
                    race_window();
                    spin_loop();
                    continue;
                }
            }
            if link.refcount.fetch_sub(1, Ordering::Relaxed) == 1 && link.holdcount() == 0 {
                link.linked.store(false, Ordering::Relaxed);
                fdt.state().leaders.retain(|l| !Arc::ptr_eq(l, link));
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::Filecaps;
    use crate::fdesc::{FdFlags, FdescRef};
    use crate::file::{File, FileFlags};
    use crate::testutil::{RecordingHooks, TestFile, TestVnode};
    use crate::RawFd;
    use std::thread;
    use std::time::Duration;

    fn ctx<'a>(
        hooks: &'a RecordingHooks,
        leader: &'a Leader,
        fdtol: Option<&'a Arc<LeaderLink>>,
    ) -> FdCtx<'a> {
        FdCtx {
            pid: leader.owner().0,
            maxfd: 1000,
            hooks,
            leader,
            fdtol,
        }
    }

    fn open_vnode(fdp: &FdescRef) -> RawFd {
        let (ops, _) = TestFile::with_vnode(TestVnode::file());
        let mut fdt = fdp.write();
        let fd = fdt.alloc(0, usize::MAX, |_| true).unwrap();
        fdt.install(fd, File::new(ops, FileFlags::READ), Filecaps::all(), FdFlags::empty());
        fd as RawFd
    }

    #[test]
    fn test_close_releases_own_locks_only_for_vnodes() {
        let fdp = FdescRef::new();
        let hooks = RecordingHooks::default();
        let leader = Leader::new(LockOwner(7));
        leader.mark_advlock();

        let vn = open_vnode(&fdp);
        let mut fdt = fdp.write();
        let pipe = fdt.alloc(0, usize::MAX, |_| true).unwrap();
        fdt.install(
            pipe,
            File::new(TestFile::new(FileType::Pipe).0, FileFlags::READ),
            Filecaps::all(),
            FdFlags::empty(),
        );
        drop(fdt);

        let cx = ctx(&hooks, &leader, None);
        fdp.close(&cx, pipe as RawFd).unwrap();
        assert!(hooks.released().is_empty());
        fdp.close(&cx, vn).unwrap();
        assert_eq!(hooks.released(), [LockOwner(7)]);
    }

    #[test]
    fn test_close_releases_sibling_locks() {
        let fdp = FdescRef::new();
        let hooks = RecordingHooks::default();
        let a = Leader::new(LockOwner(1));
        let b = Leader::new(LockOwner(2));
        let c = Leader::new(LockOwner(3));
        b.mark_advlock();
        let link_a = fdp.join_leaders(a.clone());
        let _link_b = fdp.join_leaders(b.clone());
        let _link_c = fdp.join_leaders(c.clone());
        assert_eq!(fdp.leader_count(), 3);

        let fd = open_vnode(&fdp);
        fdp.close(&ctx(&hooks, &a, Some(&link_a)), fd).unwrap();
        // `a` holds no locks itself and `c` never locked anything.
        assert_eq!(hooks.released(), [LockOwner(2)]);
        assert_eq!(fdp.read().st.holdleaders, 0);
    }

    #[test]
    fn test_clear_locks_unlinks() {
        let fdp = FdescRef::new();
        let hooks = RecordingHooks::default();
        let a = Leader::new(LockOwner(1));
        a.mark_advlock();
        let link = fdp.join_leaders(a.clone());
        open_vnode(&fdp);
        open_vnode(&fdp);

        fdp.clear_locks(&ctx(&hooks, &a, Some(&link)));
        assert_eq!(hooks.released(), [LockOwner(1), LockOwner(1)]);
        assert!(!link.is_linked());
        assert_eq!(fdp.leader_count(), 0);
    }

    #[test]
    fn test_clear_locks_shared_link_stays() {
        let fdp = FdescRef::new();
        let hooks = RecordingHooks::default();
        let a = Leader::new(LockOwner(1));
        let link = fdp.join_leaders(a.clone());
        fdp.share_link(&link);

        fdp.clear_locks(&ctx(&hooks, &a, Some(&link)));
        assert!(link.is_linked());
        assert_eq!(link.refcount(), 1);
        fdp.clear_locks(&ctx(&hooks, &a, Some(&link)));
        assert!(!link.is_linked());
    }

    #[test]
    fn test_clear_locks_waits_for_in_flight_close() {
        let fdp = FdescRef::new();
        let hooks = RecordingHooks::default();
        let a = Leader::new(LockOwner(1));
        a.mark_advlock();
        let link = fdp.join_leaders(a.clone());
        fdp.write().state().holdleaders += 1;

        thread::scope(|s| {
            let waiter = s.spawn(|| fdp.clear_locks(&ctx(&hooks, &a, Some(&link))));
            thread::sleep(Duration::from_millis(20));
            assert!(link.is_linked());
            fdp.write().state().holdleaders -= 1;
            waiter.join().unwrap();
        });
        assert!(!link.is_linked());
    }

    #[test]
    fn test_clear_locks_waits_for_link_holders() {
        let fdp = FdescRef::new();
        let hooks = RecordingHooks::default();
        let a = Leader::new(LockOwner(1));
        let link = fdp.join_leaders(a.clone());
        link.holdcount.fetch_add(1, Ordering::Relaxed);

        thread::scope(|s| {
            let waiter = s.spawn(|| fdp.clear_locks(&ctx(&hooks, &a, Some(&link))));
            thread::sleep(Duration::from_millis(20));
            assert!(link.is_linked());
            {
                let _fdt = fdp.write();
                link.holdcount.fetch_sub(1, Ordering::Relaxed);
            }
            waiter.join().unwrap();
        });
        assert!(!link.is_linked());
    }
}
