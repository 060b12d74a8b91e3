//! Descriptor Tables
//!
//! A `FileDesc` maps small integers to `File` references. Each occupied slot
//! also stores the descriptor's capability rights and flags.
//!
//! # Design
//! - The backing array is published through an atomic pointer and replaced
//!   wholesale on growth; replaced arrays stay allocated until the table
//!   memory itself is freed, so lock-free readers never touch freed memory
//! - Every slot field is an atomic guarded by a per-slot sequence counter;
//!   writers bump it around each mutation, readers use it to detect tearing
//! - All mutation goes through `FdWriteGuard`, which owns the exclusive lock
//! - Variable-length ioctl allow-lists live behind the lock, not in slots
//!
//! # Ownership
//! - `FdescRef` is a share: it keeps the entries alive. The last share to go
//!   closes every entry
//! - `FdescHold` only keeps the memory alive, for enumeration from outside
//!   the owning process
//!
//! # Invariants
//! - `freefile` never names an occupied index and every index below it is
//!   occupied
//! - `lastfile` is the highest occupied index
//! - A slot holds a file pointer iff its bitmap bit is set and it has been
//!   installed; allocation reserves the bit before installation

pub mod bitmap;
pub mod dup;
pub mod leader;
pub mod lookup;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use log::{debug, trace, warn};
use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use bitmap::FdMap;
pub use dup::{CloseRangeFlags, DupFlags, DupMode};
pub use leader::{Leader, LeaderLink};

use crate::cap::{CapRights, FcntlRights, Filecaps, IoctlList};
use crate::config::{nd_slots, ENUM_BATCH, NDENTRIES, NDFILE};
use crate::error::{FdError, FdResult};
use crate::file::{File, FileFlags, FileRef, FileType};
use crate::hooks::FdHooks;
use crate::sync::{refcount, SeqCount};

bitflags! {
    /// Per-descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FdFlags: u8 {
        /// Close on exec.
        const CLOEXEC         = 1 << 0;
        /// Lookups relative to this descriptor may not escape it.
        const RESOLVE_BENEATH = 1 << 1;
    }
}

/// One descriptor entry.
pub(crate) struct FdSlot {
    file: AtomicPtr<File>,
    rights: AtomicU64,
    fcntls: AtomicU32,
    flags: AtomicU8,
    seqc: SeqCount,
}

/// Snapshot of a slot's fixed-size fields.
#[derive(Clone, Copy)]
pub(crate) struct SlotView {
    pub file: *mut File,
    pub rights: CapRights,
    pub fcntls: FcntlRights,
    pub flags: FdFlags,
}

impl FdSlot {
    fn empty() -> Self {
        Self {
            file: AtomicPtr::new(ptr::null_mut()),
            rights: AtomicU64::new(0),
            fcntls: AtomicU32::new(0),
            flags: AtomicU8::new(0),
            seqc: SeqCount::new(),
        }
    }

    /// Copy of `src` for a grown array, sequence value included.
    ///
    /// The file pointer changes owner; `src` must not be released afterwards.
    fn moved_from(src: &FdSlot) -> Self {
        Self {
            file: AtomicPtr::new(src.file.load(Ordering::Relaxed)),
            rights: AtomicU64::new(src.rights.load(Ordering::Relaxed)),
            fcntls: AtomicU32::new(src.fcntls.load(Ordering::Relaxed)),
            flags: AtomicU8::new(src.flags.load(Ordering::Relaxed)),
            seqc: SeqCount::with_value(src.seqc.raw()),
        }
    }

    /// Read every field. Only consistent inside a sequence read or under lock.
    #[inline]
    pub(crate) fn view(&self) -> SlotView {
        SlotView {
            file: self.file.load(Ordering::Acquire),
            rights: CapRights::from_bits_retain(self.rights.load(Ordering::Relaxed)),
            fcntls: FcntlRights::from_bits_retain(self.fcntls.load(Ordering::Relaxed)),
            flags: FdFlags::from_bits_retain(self.flags.load(Ordering::Relaxed)),
        }
    }

    #[inline]
    pub(crate) fn seqc(&self) -> &SeqCount {
        &self.seqc
    }

    #[inline]
    fn file_ptr(&self) -> *mut File {
        self.file.load(Ordering::Relaxed)
    }

    #[inline]
    fn flags(&self) -> FdFlags {
        FdFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    /// Store all fields. Caller is inside a write section.
    fn store(&self, file: *mut File, rights: CapRights, fcntls: FcntlRights, flags: FdFlags) {
        self.rights.store(rights.bits(), Ordering::Relaxed);
        self.fcntls.store(fcntls.bits(), Ordering::Relaxed);
        self.flags.store(flags.bits(), Ordering::Relaxed);
        self.file.store(file, Ordering::Release);
    }
}

/// Backing array of a table.
pub(crate) struct FdArray {
    slots: Box<[FdSlot]>,
}

impl FdArray {
    fn alloc(slots: Vec<FdSlot>) -> *mut FdArray {
        Box::into_raw(Box::new(FdArray {
            slots: slots.into_boxed_slice(),
        }))
    }

    fn empty(nfiles: usize) -> *mut FdArray {
        Self::alloc((0..nfiles).map(|_| FdSlot::empty()).collect())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub(crate) fn get(&self, fd: usize) -> Option<&FdSlot> {
        self.slots.get(fd)
    }
}

/// A replaced backing array, freed with the table.
struct RetiredArray(NonNull<FdArray>);

// SAFETY: only dereferenced to free it, once, from the table's destructor.
unsafe impl Send for RetiredArray {}
unsafe impl Sync for RetiredArray {}

/// Lock-protected part of a table.
pub(crate) struct FdState {
    map: FdMap,
    freefile: usize,
    lastfile: Option<usize>,
    ioctls: Vec<IoctlList>,
    retired: Vec<RetiredArray>,
    /// Closes in flight that hold the leader ring.
    pub(crate) holdleaders: usize,
    /// Leaders sharing this table.
    pub(crate) leaders: Vec<Arc<LeaderLink>>,
}

/// A descriptor table.
pub struct FileDesc {
    files: AtomicPtr<FdArray>,
    state: RwLock<FdState>,
    refcnt: AtomicUsize,
}

impl FileDesc {
    fn with_size(nfiles: usize) -> Self {
        let nfiles = if nfiles <= NDFILE {
            NDFILE
        } else {
            nd_slots(nfiles) * NDENTRIES
        };
        Self {
            files: AtomicPtr::new(FdArray::empty(nfiles)),
            state: RwLock::new(FdState {
                map: FdMap::new(nfiles),
                freefile: 0,
                lastfile: None,
                ioctls: (0..nfiles).map(|_| IoctlList::none()).collect(),
                retired: Vec::new(),
                holdleaders: 0,
                leaders: Vec::new(),
            }),
            refcnt: AtomicUsize::new(1),
        }
    }

    /// Current backing array, as seen by a lock-free reader.
    #[inline]
    pub(crate) fn files_raw(&self) -> *mut FdArray {
        self.files.load(Ordering::Acquire)
    }

    /// Size of the current backing array.
    pub fn nfiles(&self) -> usize {
        // SAFETY: arrays are freed only with the table.
        unsafe { (*self.files_raw()).len() }
    }

    /// Number of shares.
    #[inline]
    pub fn share_count(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Lowest index that may be free.
    pub fn freefile(&self) -> usize {
        self.state.read().freefile
    }

    /// Highest occupied index.
    pub fn lastfile(&self) -> Option<usize> {
        self.state.read().lastfile
    }

    /// Number of occupied (or reserved) indices.
    pub fn count(&self) -> usize {
        self.state.read().map.count()
    }

    /// Whether `fd` is occupied or reserved.
    pub fn is_used(&self, fd: usize) -> bool {
        self.state.read().map.is_set(fd)
    }

    /// Take the exclusive lock.
    pub(crate) fn write(&self) -> FdWriteGuard<'_> {
        FdWriteGuard {
            fdp: self,
            st: self.state.write(),
        }
    }

    /// Take the shared lock.
    pub(crate) fn read(&self) -> FdReadGuard<'_> {
        FdReadGuard {
            fdp: self,
            st: self.state.read(),
        }
    }

    /// Close every entry. Runs when the last share goes away.
    fn teardown(&self) {
        let mut fdt = self.write();
        let files: Vec<FileRef> = match fdt.lastfile() {
            Some(last) => (0..=last).filter_map(|fd| fdt.take(fd)).collect(),
            None => Vec::new(),
        };
        drop(fdt);
        trace!("fdesc: teardown released {} files", files.len());
        drop(files);
    }

    /// Enumeration records for every occupied descriptor.
    ///
    /// Takes the shared lock in batches so mutators are not starved.
    fn collect_info(&self) -> Vec<FileInfo> {
        let mut out = Vec::new();
        let mut next = 0;
        loop {
            let fdt = self.read();
            if self.share_count() == 0 {
                break;
            }
            let Some(last) = fdt.lastfile() else { break };
            let mut batch = 0;
            while next <= last && batch < ENUM_BATCH {
                if let Some(info) = fdt.info(next) {
                    out.push(info);
                    batch += 1;
                }
                next += 1;
            }
            if next > last {
                break;
            }
        }
        out
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let current = *self.files.get_mut();
        // SAFETY: the table is unreachable; nothing can observe its arrays.
        unsafe {
            let files = Box::from_raw(current);
            for slot in files.slots.iter() {
                let fp = slot.file_ptr();
                if !fp.is_null() {
                    drop(FileRef::from_raw(fp));
                }
            }
            for old in st.retired.drain(..) {
                drop(Box::from_raw(old.0.as_ptr()));
            }
        }
    }
}

impl fmt::Debug for FileDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDesc")
            .field("nfiles", &self.nfiles())
            .field("refcnt", &self.share_count())
            .finish()
    }
}

/// Exclusive access to a table.
pub(crate) struct FdWriteGuard<'a> {
    fdp: &'a FileDesc,
    st: RwLockWriteGuard<'a, FdState>,
}

impl<'a> FdWriteGuard<'a> {
    #[inline]
    fn files(&self) -> &FdArray {
        // SAFETY: replaced only through `&mut self`, freed only with the table.
        unsafe { &*self.fdp.files.load(Ordering::Relaxed) }
    }

    #[inline]
    pub(crate) fn nfiles(&self) -> usize {
        self.files().len()
    }

    #[inline]
    pub(crate) fn lastfile(&self) -> Option<usize> {
        self.st.lastfile
    }

    /// Whether `fd` is reserved or installed.
    #[inline]
    pub(crate) fn is_used(&self, fd: usize) -> bool {
        self.st.map.is_set(fd)
    }

    #[inline]
    pub(crate) fn state(&mut self) -> &mut FdState {
        &mut self.st
    }

    /// The file installed at `fd`, without taking a reference.
    #[inline]
    pub(crate) fn file(&self, fd: usize) -> Option<&File> {
        let fp = self.files().get(fd)?.file_ptr();
        // SAFETY: an installed file holds a reference that only a holder of
        // this lock can drop.
        unsafe { fp.as_ref() }
    }

    /// Take a new reference on the file at `fd`.
    pub(crate) fn file_ref(&self, fd: usize) -> Option<FileRef> {
        let fp = self.files().get(fd)?.file_ptr();
        // SAFETY: as in `file`.
        (!fp.is_null()).then(|| unsafe { FileRef::acquire_raw(fp) })
    }

    pub(crate) fn flags(&self, fd: usize) -> Option<FdFlags> {
        self.file(fd)?;
        self.files().get(fd).map(FdSlot::flags)
    }

    /// Full capability set of the entry at `fd`.
    pub(crate) fn caps(&self, fd: usize) -> Option<Filecaps> {
        let view = self.files().get(fd)?.view();
        (!view.file.is_null()).then(|| Filecaps {
            rights: view.rights,
            fcntls: view.fcntls,
            ioctls: self.st.ioctls[fd].clone(),
        })
    }

    /// Reserve the lowest free index in `max(minfd, freefile)..maxfd`.
    ///
    /// Grows the table if the index lies beyond it, after `reserve` agreed to
    /// the new size. Nothing changes on failure.
    pub(crate) fn alloc(
        &mut self,
        minfd: usize,
        maxfd: usize,
        reserve: impl FnOnce(usize) -> bool,
    ) -> FdResult<usize> {
        let nfiles = self.nfiles();
        let start = minfd.max(self.st.freefile);
        let fd = self.st.map.first_free(start, nfiles);
        if fd >= maxfd {
            warn!("fdesc: descriptor limit {} reached", maxfd);
            return Err(FdError::TooManyOpen);
        }
        if fd >= nfiles {
            let want = fd.saturating_mul(2).min(maxfd);
            if !reserve(want) {
                return Err(FdError::TooManyOpen);
            }
            self.grow(want);
        }
        debug_assert!(self.files().get(fd).is_some_and(|s| s.file_ptr().is_null()));
        self.mark_used(fd);
        Ok(fd)
    }

    /// Reserve the `n` lowest free indices, or none.
    ///
    /// The whole request is checked against `maxfd` first; the table grows at
    /// most once, after `reserve` agreed to the final size.
    pub(crate) fn alloc_n(
        &mut self,
        n: usize,
        maxfd: usize,
        reserve: impl FnOnce(usize) -> bool,
    ) -> FdResult<Vec<usize>> {
        let nfiles = self.nfiles();
        let mut fds = Vec::with_capacity(n);
        let mut fd = self.st.freefile;
        while fds.len() < n {
            fd = self.st.map.first_free(fd, nfiles);
            if fd >= maxfd {
                warn!("fdesc: descriptor limit {} reached", maxfd);
                return Err(FdError::TooManyOpen);
            }
            fds.push(fd);
            fd += 1;
        }
        if let Some(&last) = fds.last().filter(|&&last| last >= nfiles) {
            let want = last.saturating_mul(2).min(maxfd).max(last + 1);
            if !reserve(want) {
                return Err(FdError::TooManyOpen);
            }
            self.grow(want);
        }
        for &fd in &fds {
            self.mark_used(fd);
        }
        Ok(fds)
    }

    /// Grow the backing array to hold at least `want` entries.
    ///
    /// A no-op if it already does.
    pub(crate) fn grow(&mut self, want: usize) {
        let old_ptr = self.fdp.files.load(Ordering::Relaxed);
        // SAFETY: stays allocated after replacement; see `RetiredArray`.
        let old = unsafe { &*old_ptr };
        let onfiles = old.len();
        if want <= onfiles {
            return;
        }
        let nnfiles = nd_slots(want.max(onfiles.saturating_mul(2))) * NDENTRIES;
        let slots: Vec<FdSlot> = old
            .slots
            .iter()
            .map(FdSlot::moved_from)
            .chain((onfiles..nnfiles).map(|_| FdSlot::empty()))
            .collect();
        self.st.map.grow(nnfiles);
        self.st.ioctls.resize_with(nnfiles, IoctlList::none);
        self.fdp.files.store(FdArray::alloc(slots), Ordering::Release);
        if let Some(old) = NonNull::new(old_ptr) {
            self.st.retired.push(RetiredArray(old));
        }
        trace!("fdesc: grew table {} -> {}", onfiles, nnfiles);
    }

    fn mark_used(&mut self, fd: usize) {
        debug_assert!(!self.st.map.is_set(fd), "fd {} already used", fd);
        self.st.map.set(fd);
        if self.st.lastfile.map_or(true, |last| fd > last) {
            self.st.lastfile = Some(fd);
        }
        if fd == self.st.freefile {
            let nfiles = self.nfiles();
            self.st.freefile = self.st.map.first_free(fd, nfiles);
        }
    }

    fn mark_unused(&mut self, fd: usize) {
        debug_assert!(self.st.map.is_set(fd), "fd {} is not used", fd);
        self.st.map.clear(fd);
        if fd < self.st.freefile {
            self.st.freefile = fd;
        }
        if self.st.lastfile == Some(fd) {
            self.st.lastfile = self.st.map.last_used(fd);
        }
    }

    /// Release an index reserved by `alloc` that was never installed.
    pub(crate) fn free(&mut self, fd: usize) {
        debug_assert!(self.files().get(fd).is_some_and(|s| s.file_ptr().is_null()));
        self.mark_unused(fd);
    }

    /// Write an entry into a reserved, empty index.
    pub(crate) fn install(&mut self, fd: usize, file: FileRef, caps: Filecaps, flags: FdFlags) {
        debug_assert!(self.st.map.is_set(fd), "installing into unreserved fd {}", fd);
        let Filecaps {
            rights,
            fcntls,
            ioctls,
        } = caps;
        self.st.ioctls[fd] = ioctls;
        let slot = &self.files().slots[fd];
        debug_assert!(slot.file_ptr().is_null(), "fd {} already installed", fd);
        let _w = slot.seqc.write();
        slot.store(file.into_raw(), rights, fcntls, flags);
    }

    /// Reserve `fd` and install into it.
    pub(crate) fn install_at(&mut self, fd: usize, file: FileRef, caps: Filecaps, flags: FdFlags) {
        self.mark_used(fd);
        self.install(fd, file, caps, flags);
    }

    /// Swap the entry at occupied `fd` in one write section.
    ///
    /// Returns the previous file; dropping it is the caller's job, after the
    /// lock is released.
    pub(crate) fn replace(
        &mut self,
        fd: usize,
        file: FileRef,
        caps: Filecaps,
        flags: FdFlags,
    ) -> FileRef {
        let Filecaps {
            rights,
            fcntls,
            ioctls,
        } = caps;
        self.st.ioctls[fd] = ioctls;
        let slot = &self.files().slots[fd];
        let old = slot.file_ptr();
        debug_assert!(!old.is_null(), "replacing empty fd {}", fd);
        {
            let _w = slot.seqc.write();
            slot.store(file.into_raw(), rights, fcntls, flags);
        }
        // SAFETY: the slot owned this reference and no longer points at it.
        unsafe { FileRef::from_raw(old) }
    }

    /// Remove the entry at `fd` and free the index.
    pub(crate) fn take(&mut self, fd: usize) -> Option<FileRef> {
        let slot = self.files().get(fd)?;
        let fp = slot.file_ptr();
        if fp.is_null() {
            return None;
        }
        {
            let _w = slot.seqc.write();
            slot.store(
                ptr::null_mut(),
                CapRights::empty(),
                FcntlRights::empty(),
                FdFlags::empty(),
            );
        }
        self.st.ioctls[fd] = IoctlList::none();
        self.mark_unused(fd);
        // SAFETY: the slot owned this reference and no longer points at it.
        Some(unsafe { FileRef::from_raw(fp) })
    }

    /// Replace the capabilities of an occupied entry.
    pub(crate) fn set_caps(&mut self, fd: usize, caps: Filecaps) {
        let Filecaps {
            rights,
            fcntls,
            ioctls,
        } = caps;
        self.st.ioctls[fd] = ioctls;
        let slot = &self.files().slots[fd];
        let view = slot.view();
        let _w = slot.seqc.write();
        slot.store(view.file, rights, fcntls, view.flags);
    }

    /// Replace the flags of an occupied entry.
    pub(crate) fn set_flags(&mut self, fd: usize, flags: FdFlags) {
        let slot = &self.files().slots[fd];
        let _w = slot.seqc.write();
        slot.flags.store(flags.bits(), Ordering::Relaxed);
    }
}

/// Shared access to a table.
pub(crate) struct FdReadGuard<'a> {
    fdp: &'a FileDesc,
    st: RwLockReadGuard<'a, FdState>,
}

impl FdReadGuard<'_> {
    #[inline]
    fn files(&self) -> &FdArray {
        // SAFETY: not replaced while any lock is held.
        unsafe { &*self.fdp.files.load(Ordering::Relaxed) }
    }

    #[inline]
    pub(crate) fn lastfile(&self) -> Option<usize> {
        self.st.lastfile
    }

    #[inline]
    pub(crate) fn file(&self, fd: usize) -> Option<&File> {
        let fp = self.files().get(fd)?.file_ptr();
        // SAFETY: installed files cannot be released under the shared lock.
        unsafe { fp.as_ref() }
    }

    pub(crate) fn file_ref(&self, fd: usize) -> Option<FileRef> {
        let fp = self.files().get(fd)?.file_ptr();
        // SAFETY: as in `file`.
        (!fp.is_null()).then(|| unsafe { FileRef::acquire_raw(fp) })
    }

    pub(crate) fn view(&self, fd: usize) -> Option<SlotView> {
        let view = self.files().get(fd)?.view();
        (!view.file.is_null()).then_some(view)
    }

    pub(crate) fn caps(&self, fd: usize) -> Option<Filecaps> {
        let view = self.view(fd)?;
        Some(Filecaps {
            rights: view.rights,
            fcntls: view.fcntls,
            ioctls: self.st.ioctls[fd].clone(),
        })
    }

    pub(crate) fn ioctls(&self, fd: usize) -> Option<&IoctlList> {
        self.view(fd)?;
        self.st.ioctls.get(fd)
    }

    /// Enumeration record for `fd`.
    fn info(&self, fd: usize) -> Option<FileInfo> {
        let view = self.view(fd)?;
        let file = self.file(fd)?;
        let mut info = FileInfo {
            fd,
            file_type: file.file_type(),
            file_flags: file.flags(),
            fd_flags: view.flags,
            rights: view.rights,
            refcount: file.refcount(),
            offset: None,
            path: None,
        };
        file.ops().fill_kinfo(file, &mut info);
        Some(info)
    }
}

/// Description of one open descriptor, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub fd: usize,
    pub file_type: FileType,
    pub file_flags: FileFlags,
    pub fd_flags: FdFlags,
    pub rights: CapRights,
    pub refcount: usize,
    /// Filled in by the file type, when meaningful.
    pub offset: Option<u64>,
    pub path: Option<String>,
}

/// A share of a descriptor table.
///
/// Cloning adds a share. Dropping the last share closes every descriptor.
pub struct FdescRef {
    fdp: Arc<FileDesc>,
}

impl FdescRef {
    /// Empty table of the default size.
    pub fn new() -> Self {
        Self::with_size(NDFILE)
    }

    /// Empty table with room for at least `nfiles` descriptors.
    pub fn with_size(nfiles: usize) -> Self {
        Self {
            fdp: Arc::new(FileDesc::with_size(nfiles)),
        }
    }

    /// Add a share. Equivalent to `clone`.
    #[inline]
    pub fn share(&self) -> Self {
        self.clone()
    }

    /// Keep the table memory alive without keeping its entries.
    pub fn hold(&self) -> FdescHold {
        FdescHold {
            fdp: self.fdp.clone(),
        }
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.fdp.share_count() > 1
    }

    /// Shares plus holds.
    #[inline]
    pub fn hold_count(&self) -> usize {
        Arc::strong_count(&self.fdp)
    }

    #[inline]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.fdp, &b.fdp)
    }

    /// Fresh table holding every passable entry of this one.
    ///
    /// Each copied file gains a reference. Entries whose file refuses to be
    /// passed (kqueues) are left out.
    pub fn copy(&self) -> FdescRef {
        let src = self.fdp.read();
        let size = src.lastfile().map_or(NDFILE, |last| last + 1);
        let new = FdescRef::with_size(size);
        {
            let mut dst = new.fdp.write();
            if let Some(last) = src.lastfile() {
                for fd in 0..=last {
                    let Some(file) = src.file_ref(fd) else { continue };
                    if !file.is_passable() {
                        continue;
                    }
                    let (Some(caps), Some(view)) = (src.caps(fd), src.view(fd)) else {
                        continue;
                    };
                    dst.install_at(fd, file, caps, view.flags);
                }
            }
        }
        new
    }

    /// Make sure this process has a private table.
    ///
    /// Returns `self` when it is the only share, otherwise a copy.
    pub fn unshare(self) -> FdescRef {
        let shares = self.fdp.share_count();
        if shares == 1 {
            return self;
        }
        let copy = self.copy();
        debug!("fdesc: unshared table with {} sharers", shares);
        drop(self);
        copy
    }
}

impl Default for FdescRef {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for FdescRef {
    fn clone(&self) -> Self {
        refcount::acquire(&self.fdp.refcnt);
        Self {
            fdp: self.fdp.clone(),
        }
    }
}

impl Drop for FdescRef {
    fn drop(&mut self) {
        if refcount::release(&self.fdp.refcnt) {
            self.fdp.teardown();
        }
    }
}

impl Deref for FdescRef {
    type Target = FileDesc;

    #[inline]
    fn deref(&self) -> &FileDesc {
        &self.fdp
    }
}

impl fmt::Debug for FdescRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.fdp, f)
    }
}

/// Keeps a table's memory alive for inspection.
#[derive(Clone)]
pub struct FdescHold {
    fdp: Arc<FileDesc>,
}

impl FdescHold {
    /// Whether any share is left.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.fdp.share_count() > 0
    }

    /// One record per open descriptor, or nothing once every share is gone.
    pub fn files(&self) -> Vec<FileInfo> {
        self.fdp.collect_info()
    }

    /// Number of open descriptors.
    pub fn count(&self) -> usize {
        if self.is_live() {
            self.fdp.count()
        } else {
            0
        }
    }
}

/// Who is acting on a table.
pub(crate) struct FdCtx<'a> {
    pub pid: u32,
    /// Exclusive upper bound on descriptor numbers.
    pub maxfd: usize,
    pub hooks: &'a dyn FdHooks,
    pub leader: &'a Leader,
    pub fdtol: Option<&'a Arc<LeaderLink>>,
}

impl FdCtx<'_> {
    /// Ask the accounting hook for a table of `nfiles` entries.
    pub(crate) fn reserve(&self, nfiles: usize) -> bool {
        let ok = self.hooks.reserve_nofile(self.pid, nfiles);
        if !ok {
            warn!("fdesc: pid {} refused table of {} entries", self.pid, nfiles);
        }
        ok
    }
}
