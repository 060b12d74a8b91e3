//! Test doubles for files, vnodes and hooks.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::file::{File, FileOps, FileType, Vnode, VnodeRef};
use crate::hooks::{FdHooks, LockOwner};

pub struct TestVnode {
    dir: bool,
}

impl TestVnode {
    pub fn dir() -> VnodeRef {
        Arc::new(TestVnode { dir: true })
    }

    pub fn file() -> VnodeRef {
        Arc::new(TestVnode { dir: false })
    }
}

impl Vnode for TestVnode {
    fn is_dir(&self) -> bool {
        self.dir
    }
}

/// Observes whether a `TestFile` has been closed.
#[derive(Clone, Default)]
pub struct CloseWatch {
    closed: Arc<AtomicBool>,
}

impl CloseWatch {
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct TestFile {
    ftype: FileType,
    vnode: Option<VnodeRef>,
    setugid_unsafe: bool,
    watch: CloseWatch,
}

impl TestFile {
    fn build(ftype: FileType, vnode: Option<VnodeRef>, setugid_unsafe: bool) -> (Box<dyn FileOps>, CloseWatch) {
        let watch = CloseWatch::default();
        let ops = TestFile {
            ftype,
            vnode,
            setugid_unsafe,
            watch: watch.clone(),
        };
        (Box::new(ops), watch)
    }

    pub fn new(ftype: FileType) -> (Box<dyn FileOps>, CloseWatch) {
        Self::build(ftype, None, false)
    }

    pub fn with_vnode(vnode: VnodeRef) -> (Box<dyn FileOps>, CloseWatch) {
        Self::build(FileType::Vnode, Some(vnode), false)
    }

    pub fn setugid_unsafe(ftype: FileType) -> (Box<dyn FileOps>, CloseWatch) {
        Self::build(ftype, None, true)
    }
}

impl FileOps for TestFile {
    fn file_type(&self) -> FileType {
        self.ftype
    }

    fn vnode(&self) -> Option<VnodeRef> {
        self.vnode.clone()
    }

    fn is_setugid_unsafe(&self) -> bool {
        self.setugid_unsafe
    }

    fn close(&self, _file: &File) {
        let was = self.watch.closed.swap(true, Ordering::AcqRel);
        assert!(!was, "file closed twice");
    }
}

/// Hooks that record every call.
pub struct RecordingHooks {
    nofile_limit: AtomicUsize,
    closed: Mutex<Vec<(u32, usize)>>,
    released: Mutex<Vec<LockOwner>>,
}

impl Default for RecordingHooks {
    fn default() -> Self {
        Self {
            nofile_limit: AtomicUsize::new(usize::MAX),
            closed: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
        }
    }
}

impl RecordingHooks {
    pub fn set_nofile_limit(&self, limit: usize) {
        self.nofile_limit.store(limit, Ordering::Relaxed);
    }

    pub fn closed(&self) -> Vec<(u32, usize)> {
        self.closed.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<LockOwner> {
        self.released.lock().unwrap().clone()
    }
}

impl FdHooks for RecordingHooks {
    fn reserve_nofile(&self, _pid: u32, nfiles: usize) -> bool {
        nfiles <= self.nofile_limit.load(Ordering::Relaxed)
    }

    fn fd_closed(&self, pid: u32, fd: usize) {
        self.closed.lock().unwrap().push((pid, fd));
    }

    fn release_posix_locks(&self, owner: LockOwner, _file: &File) {
        self.released.lock().unwrap().push(owner);
    }
}
