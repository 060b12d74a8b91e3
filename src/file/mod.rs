//! File Objects
//!
//! A `File` is the open-file object a descriptor entry points at. Its
//! behaviour comes from a `FileOps` implementation supplied by the owning
//! subsystem (vnode layer, sockets, pipes, ...); this crate only manages its
//! lifetime.
//!
//! # Lifetime
//! - `FileRef` owns one reference; cloning takes another
//! - Lock-free lookups take references with "increment if not zero", so a file
//!   whose count reached zero is never revived
//! - When the last reference goes, `FileOps::close` runs and the memory is
//!   retired through `sync::SMR`, never freed synchronously

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::error::{FdError, FdResult};
use crate::fdesc::FileInfo;
use crate::sync::{refcount, SMR};
use crate::system::FdSystem;

/// Kind of object behind a file.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Vnode = 1,
    Socket = 2,
    Pipe = 3,
    Fifo = 4,
    Kqueue = 5,
    Mqueue = 6,
    Shm = 7,
    ProcDesc = 8,
    EventFd = 9,
    Dev = 10,
}

bitflags! {
    /// Open-file status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileFlags: u32 {
        const READ     = 1 << 0;
        const WRITE    = 1 << 1;
        const NONBLOCK = 1 << 2;
        const APPEND   = 1 << 3;
        const ASYNC    = 1 << 6;
        const DIRECT   = 1 << 16;
        /// A flock(2) lock is held through this file.
        const HASLOCK  = 1 << 14;
    }
}

impl FileFlags {
    /// Flags that F_SETFL may change.
    pub const SETTABLE: Self = Self::NONBLOCK
        .union(Self::APPEND)
        .union(Self::ASYNC)
        .union(Self::DIRECT);
}

/// A directory or file node of the filesystem layer.
pub trait Vnode: Send + Sync {
    fn is_dir(&self) -> bool;
}

/// Counted vnode reference.
pub type VnodeRef = Arc<dyn Vnode>;

/// Subset of stat(2) a file reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
}

/// Behaviour of a file. Every operation defaults to `NotSupported`.
pub trait FileOps: Send + Sync {
    fn file_type(&self) -> FileType;

    /// Whether the file may be copied into another process's table.
    fn is_passable(&self) -> bool {
        self.file_type() != FileType::Kqueue
    }

    /// Vnode backing the file, if any.
    fn vnode(&self) -> Option<VnodeRef> {
        None
    }

    /// Whether the file must not survive a privilege-changing exec on fds 0-2.
    fn is_setugid_unsafe(&self) -> bool {
        false
    }

    fn read(&self, _file: &File, _buf: &mut [u8]) -> FdResult<usize> {
        Err(FdError::NotSupported)
    }

    fn write(&self, _file: &File, _buf: &[u8]) -> FdResult<usize> {
        Err(FdError::NotSupported)
    }

    fn truncate(&self, _file: &File, _len: u64) -> FdResult<()> {
        Err(FdError::NotSupported)
    }

    fn ioctl(&self, _file: &File, _cmd: u64, _arg: usize) -> FdResult<usize> {
        Err(FdError::NotSupported)
    }

    fn poll(&self, _file: &File, _events: u32) -> FdResult<u32> {
        Err(FdError::NotSupported)
    }

    fn kqfilter(&self, _file: &File, _filter: i16) -> FdResult<()> {
        Err(FdError::NotSupported)
    }

    fn stat(&self, _file: &File) -> FdResult<FileStat> {
        Err(FdError::NotSupported)
    }

    fn chmod(&self, _file: &File, _mode: u32) -> FdResult<()> {
        Err(FdError::NotSupported)
    }

    fn chown(&self, _file: &File, _uid: u32, _gid: u32) -> FdResult<()> {
        Err(FdError::NotSupported)
    }

    fn sendfile(&self, _file: &File, _offset: u64, _len: usize) -> FdResult<usize> {
        Err(FdError::NotSupported)
    }

    /// Add type-specific details to an enumeration record.
    fn fill_kinfo(&self, _file: &File, _info: &mut FileInfo) {}

    /// Last reference dropped.
    fn close(&self, _file: &File) {}
}

/// An open file object.
pub struct File {
    count: AtomicUsize,
    flags: AtomicU32,
    ftype: FileType,
    ops: Box<dyn FileOps>,
    /// System the file is charged against, for files created by `falloc`.
    sys: Option<Arc<FdSystem>>,
}

impl File {
    /// Create an uncharged file holding one reference.
    pub fn new(ops: Box<dyn FileOps>, flags: FileFlags) -> FileRef {
        Self::alloc(ops, flags, None)
    }

    /// Create a file charged against `sys`'s open-file count.
    pub(crate) fn new_charged(
        sys: Arc<FdSystem>,
        ops: Box<dyn FileOps>,
        flags: FileFlags,
    ) -> FdResult<FileRef> {
        sys.charge_file()?;
        Ok(Self::alloc(ops, flags, Some(sys)))
    }

    fn alloc(ops: Box<dyn FileOps>, flags: FileFlags, sys: Option<Arc<FdSystem>>) -> FileRef {
        let file = Box::new(File {
            count: AtomicUsize::new(1),
            flags: AtomicU32::new(flags.bits()),
            ftype: ops.file_type(),
            ops,
            sys,
        });
        FileRef {
            ptr: NonNull::from(Box::leak(file)),
        }
    }

    #[inline]
    pub fn file_type(&self) -> FileType {
        self.ftype
    }

    #[inline]
    pub fn flags(&self) -> FileFlags {
        FileFlags::from_bits_truncate(self.flags.load(Ordering::Relaxed))
    }

    /// Replace the F_SETFL-settable flags, keeping the access mode.
    pub fn set_status_flags(&self, flags: FileFlags) {
        let settable = FileFlags::SETTABLE.bits();
        let _ = self
            .flags
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some((cur & !settable) | (flags.bits() & settable))
            });
    }

    /// Current reference count, for diagnostics.
    #[inline]
    pub fn refcount(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ops(&self) -> &dyn FileOps {
        &*self.ops
    }

    #[inline]
    pub fn is_passable(&self) -> bool {
        self.ops.is_passable()
    }

    #[inline]
    pub fn vnode(&self) -> Option<VnodeRef> {
        self.ops.vnode()
    }

    /// Whether the file is a directory vnode.
    pub fn is_dir(&self) -> bool {
        self.ftype == FileType::Vnode && self.vnode().is_some_and(|vp| vp.is_dir())
    }

    pub fn read(&self, buf: &mut [u8]) -> FdResult<usize> {
        self.ops.read(self, buf)
    }

    pub fn write(&self, buf: &[u8]) -> FdResult<usize> {
        self.ops.write(self, buf)
    }

    pub fn truncate(&self, len: u64) -> FdResult<()> {
        self.ops.truncate(self, len)
    }

    pub fn ioctl(&self, cmd: u64, arg: usize) -> FdResult<usize> {
        self.ops.ioctl(self, cmd, arg)
    }

    pub fn poll(&self, events: u32) -> FdResult<u32> {
        self.ops.poll(self, events)
    }

    pub fn kqfilter(&self, filter: i16) -> FdResult<()> {
        self.ops.kqfilter(self, filter)
    }

    pub fn stat(&self) -> FdResult<FileStat> {
        self.ops.stat(self)
    }

    pub fn chmod(&self, mode: u32) -> FdResult<()> {
        self.ops.chmod(self, mode)
    }

    pub fn chown(&self, uid: u32, gid: u32) -> FdResult<()> {
        self.ops.chown(self, uid, gid)
    }

    pub fn sendfile(&self, offset: u64, len: usize) -> FdResult<usize> {
        self.ops.sendfile(self, offset, len)
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("type", &self.ftype)
            .field("flags", &self.flags())
            .field("count", &self.refcount())
            .finish()
    }
}

/// An owned reference to a `File`.
pub struct FileRef {
    ptr: NonNull<File>,
}

// SAFETY: `File` is only accessed through shared references and atomics.
unsafe impl Send for FileRef {}
unsafe impl Sync for FileRef {}

impl FileRef {
    /// Take a reference on a file found through a raw pointer, unless the
    /// file is already dying.
    ///
    /// # Safety
    /// `ptr` must point to a `File` whose memory cannot be reclaimed for the
    /// duration of the call, i.e. the caller is inside an `SMR` read section
    /// entered while the file was reachable.
    #[inline]
    pub(crate) unsafe fn try_acquire(ptr: *mut File) -> Option<FileRef> {
        // SAFETY: memory kept alive by the caller's read section.
        let file = unsafe { &*ptr };
        if refcount::acquire_if_not_zero(&file.count) {
            NonNull::new(ptr).map(|ptr| FileRef { ptr })
        } else {
            None
        }
    }

    /// Take a reference on a file the caller knows is live.
    ///
    /// # Safety
    /// `ptr` must point to a `File` with a nonzero count that cannot drop to
    /// zero during the call (e.g. it is installed and the table lock is held).
    #[inline]
    pub(crate) unsafe fn acquire_raw(ptr: *mut File) -> FileRef {
        // SAFETY: guaranteed live by the caller.
        refcount::acquire(unsafe { &(*ptr).count });
        FileRef {
            // SAFETY: a live file pointer is never null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    /// Give up ownership of the reference without dropping it.
    #[inline]
    pub(crate) fn into_raw(self) -> *mut File {
        let ptr = self.ptr.as_ptr();
        core::mem::forget(self);
        ptr
    }

    /// Reclaim a reference given up by `into_raw`.
    ///
    /// # Safety
    /// `ptr` must come from `into_raw` and be reclaimed exactly once.
    #[inline]
    pub(crate) unsafe fn from_raw(ptr: *mut File) -> FileRef {
        FileRef {
            // SAFETY: `into_raw` never yields null.
            ptr: unsafe { NonNull::new_unchecked(ptr) },
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut File {
        self.ptr.as_ptr()
    }

    /// Whether both references name the same file.
    #[inline]
    pub fn ptr_eq(a: &FileRef, b: &FileRef) -> bool {
        a.ptr == b.ptr
    }
}

impl Deref for FileRef {
    type Target = File;

    #[inline]
    fn deref(&self) -> &File {
        // SAFETY: the owned reference keeps the memory alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for FileRef {
    fn clone(&self) -> Self {
        refcount::acquire(&self.count);
        FileRef { ptr: self.ptr }
    }
}

impl Drop for FileRef {
    fn drop(&mut self) {
        if !refcount::release(&self.count) {
            return;
        }
        let file: &File = self;
        file.ops.close(file);
        if let Some(sys) = &file.sys {
            sys.uncharge_file();
        }
        // SAFETY: the count reached zero, so no table holds the pointer any
        // more; lock-free readers that still see it are covered by SMR.
        unsafe { SMR.retire(self.ptr.as_ptr()) };
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChrootPolicy;
    use crate::testutil::TestFile;

    #[test]
    fn test_last_reference_closes() {
        let (ops, watch) = TestFile::new(FileType::Pipe);
        let file = File::new(ops, FileFlags::READ);
        let second = file.clone();
        assert_eq!(file.refcount(), 2);
        drop(file);
        assert!(!watch.closed());
        drop(second);
        assert!(watch.closed());
    }

    #[test]
    fn test_try_acquire_refuses_dead_file() {
        let (ops, _watch) = TestFile::new(FileType::Pipe);
        let file = File::new(ops, FileFlags::READ);
        let guard = SMR.enter();
        let raw = file.as_ptr();
        let extra = unsafe { FileRef::try_acquire(raw) }.unwrap();
        drop(extra);
        drop(file);
        // Memory is still parked by the read section; the count is zero.
        assert!(unsafe { FileRef::try_acquire(raw) }.is_none());
        drop(guard);
    }

    #[test]
    fn test_charged_file_uncharges() {
        let sys = FdSystem::new(1, ChrootPolicy::default());
        let (ops, _) = TestFile::new(FileType::Vnode);
        let file = File::new_charged(sys.clone(), ops, FileFlags::READ).unwrap();
        assert_eq!(sys.openfiles(), 1);
        let (ops, _) = TestFile::new(FileType::Vnode);
        assert_eq!(
            File::new_charged(sys.clone(), ops, FileFlags::READ).unwrap_err(),
            FdError::FileTableFull
        );
        drop(file);
        assert_eq!(sys.openfiles(), 0);
    }

    #[test]
    fn test_status_flags_keep_access_mode() {
        let (ops, _) = TestFile::new(FileType::Pipe);
        let file = File::new(ops, FileFlags::READ | FileFlags::WRITE);
        file.set_status_flags(FileFlags::NONBLOCK | FileFlags::READ);
        assert_eq!(
            file.flags(),
            FileFlags::READ | FileFlags::WRITE | FileFlags::NONBLOCK
        );
        assert_eq!(file.read(&mut [0u8; 4]), Err(FdError::NotSupported));
    }
}
