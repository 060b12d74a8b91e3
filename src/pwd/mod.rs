//! Working-Directory Snapshots
//!
//! A process's current, root, jail and alternate-root directories are kept
//! together in an immutable, reference-counted `Pwd`. Changing any of them
//! builds a new snapshot and swaps the pointer.
//!
//! # Design
//! - Readers take a reference lock-free (`SMR` read section plus "increment
//!   if not zero") and fall back to the writer lock if they lose a race
//! - Writers serialise on `PwdDesc`'s lock, fill unset fields from the
//!   previous snapshot, publish, then drop the previous snapshot's reference
//! - A snapshot whose count reaches zero is retired through `SMR`; its memory
//!   and directory references go away only once no reader can see it
//!
//! The file-creation mask lives here too because it is shared and copied
//! along with the directories.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU16, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::CMASK;
use crate::error::FdResult;
use crate::file::VnodeRef;
use crate::sync::{refcount, SmrGuard, SMR};

/// Whether two vnode references name the same vnode.
#[inline]
pub fn same_vnode(a: &VnodeRef, b: &VnodeRef) -> bool {
    core::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Directory fields of a snapshot. `None` means "keep the current value".
#[derive(Clone, Default)]
pub struct PwdFields {
    pub cdir: Option<VnodeRef>,
    pub rdir: Option<VnodeRef>,
    pub jdir: Option<VnodeRef>,
    pub adir: Option<VnodeRef>,
}

/// An immutable working-directory snapshot.
pub struct Pwd {
    refcount: AtomicUsize,
    cdir: Option<VnodeRef>,
    rdir: Option<VnodeRef>,
    jdir: Option<VnodeRef>,
    adir: Option<VnodeRef>,
}

impl Pwd {
    fn alloc(fields: PwdFields) -> NonNull<Pwd> {
        NonNull::from(Box::leak(Box::new(Pwd {
            refcount: AtomicUsize::new(1),
            cdir: fields.cdir,
            rdir: fields.rdir,
            jdir: fields.jdir,
            adir: fields.adir,
        })))
    }

    /// Current directory.
    #[inline]
    pub fn cdir(&self) -> Option<&VnodeRef> {
        self.cdir.as_ref()
    }

    /// Root directory.
    #[inline]
    pub fn rdir(&self) -> Option<&VnodeRef> {
        self.rdir.as_ref()
    }

    /// Jail root.
    #[inline]
    pub fn jdir(&self) -> Option<&VnodeRef> {
        self.jdir.as_ref()
    }

    /// Alternate root for emulated ABIs.
    #[inline]
    pub fn adir(&self) -> Option<&VnodeRef> {
        self.adir.as_ref()
    }

    /// `fields` with every unset entry taken from `self`.
    fn fill(&self, fields: PwdFields) -> PwdFields {
        PwdFields {
            cdir: fields.cdir.or_else(|| self.cdir.clone()),
            rdir: fields.rdir.or_else(|| self.rdir.clone()),
            jdir: fields.jdir.or_else(|| self.jdir.clone()),
            adir: fields.adir.or_else(|| self.adir.clone()),
        }
    }

    /// Whether the root differs from the system root.
    pub fn is_chrooted(&self, rootvnode: Option<&VnodeRef>) -> bool {
        match (&self.rdir, rootvnode) {
            (None, _) => false,
            (Some(rdir), Some(root)) => !same_vnode(rdir, root),
            (Some(_), None) => true,
        }
    }
}

impl fmt::Debug for Pwd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pwd")
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("cdir", &self.cdir.is_some())
            .field("rdir", &self.rdir.is_some())
            .field("jdir", &self.jdir.is_some())
            .field("adir", &self.adir.is_some())
            .finish()
    }
}

/// An owned reference to a `Pwd`.
pub struct PwdRef {
    ptr: NonNull<Pwd>,
}

// SAFETY: `Pwd` is immutable apart from its atomic count.
unsafe impl Send for PwdRef {}
unsafe impl Sync for PwdRef {}

impl PwdRef {
    /// # Safety
    /// `ptr` must stay allocated for the call (caller is in an `SMR` read
    /// section entered while the snapshot was published).
    unsafe fn try_acquire(ptr: *mut Pwd) -> Option<PwdRef> {
        let ptr = NonNull::new(ptr)?;
        // SAFETY: kept alive by the caller's read section.
        let pwd = unsafe { ptr.as_ref() };
        refcount::acquire_if_not_zero(&pwd.refcount).then(|| PwdRef { ptr })
    }

    /// # Safety
    /// `ptr` must be published by a `PwdDesc` whose lock the caller holds.
    unsafe fn acquire_locked(ptr: NonNull<Pwd>) -> PwdRef {
        // SAFETY: the descriptor's own reference keeps the count above zero.
        refcount::acquire(unsafe { &ptr.as_ref().refcount });
        PwdRef { ptr }
    }

    #[inline]
    fn into_raw(self) -> *mut Pwd {
        let ptr = self.ptr.as_ptr();
        core::mem::forget(self);
        ptr
    }

    #[inline]
    pub fn ptr_eq(a: &PwdRef, b: &PwdRef) -> bool {
        a.ptr == b.ptr
    }
}

impl Deref for PwdRef {
    type Target = Pwd;

    #[inline]
    fn deref(&self) -> &Pwd {
        // SAFETY: the owned reference keeps the memory alive.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for PwdRef {
    fn clone(&self) -> Self {
        refcount::acquire(&self.refcount);
        Self { ptr: self.ptr }
    }
}

impl Drop for PwdRef {
    fn drop(&mut self) {
        if refcount::release(&self.refcount) {
            // SAFETY: unpublished (count was zero) and covered by SMR for
            // readers that still hold the pointer.
            unsafe { SMR.retire(self.ptr.as_ptr()) };
        }
    }
}

impl fmt::Debug for PwdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A snapshot borrowed for the duration of a read section.
pub struct PwdBorrow<'a> {
    _smr: SmrGuard<'static>,
    ptr: NonNull<Pwd>,
    _desc: PhantomData<&'a PwdDesc>,
}

impl Deref for PwdBorrow<'_> {
    type Target = Pwd;

    #[inline]
    fn deref(&self) -> &Pwd {
        // SAFETY: the read section keeps a retired snapshot allocated.
        unsafe { self.ptr.as_ref() }
    }
}

/// Per-process working-directory state.
pub struct PwdDesc {
    lock: Mutex<()>,
    /// Current snapshot; the descriptor owns one reference to it.
    pwd: AtomicPtr<Pwd>,
    cmask: AtomicU16,
}

impl PwdDesc {
    /// Empty snapshot and the default creation mask.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::with_pwd(
            PwdRef {
                ptr: Pwd::alloc(PwdFields::default()),
            },
            CMASK,
        ))
    }

    fn with_pwd(pwd: PwdRef, cmask: u16) -> Self {
        Self {
            lock: Mutex::new(()),
            pwd: AtomicPtr::new(pwd.into_raw()),
            cmask: AtomicU16::new(cmask),
        }
    }

    /// Descriptor starting from `fields` (each unset field stays empty).
    pub fn from_fields(fields: PwdFields) -> Arc<Self> {
        Arc::new(Self::with_pwd(
            PwdRef {
                ptr: Pwd::alloc(fields),
            },
            CMASK,
        ))
    }

    #[inline]
    fn current(&self) -> NonNull<Pwd> {
        // SAFETY: always holds a published snapshot.
        unsafe { NonNull::new_unchecked(self.pwd.load(Ordering::Acquire)) }
    }

    /// Take a reference on the current snapshot.
    pub fn hold(&self) -> PwdRef {
        {
            let _smr = SMR.enter();
            // SAFETY: loaded inside the read section.
            if let Some(pwd) = unsafe { PwdRef::try_acquire(self.pwd.load(Ordering::Acquire)) } {
                return pwd;
            }
        }
        let _g = self.lock.lock();
        // SAFETY: lock held.
        unsafe { PwdRef::acquire_locked(self.current()) }
    }

    /// Borrow the current snapshot without taking a reference.
    pub fn borrow(&self) -> PwdBorrow<'_> {
        let smr = SMR.enter();
        PwdBorrow {
            _smr: smr,
            ptr: self.current(),
            _desc: PhantomData,
        }
    }

    /// Publish a snapshot built from `fields`, keeping unset fields.
    pub fn replace(&self, fields: PwdFields) {
        // Infallible builder.
        let _ = self.update(|_| Ok(fields));
    }

    /// Build and publish a new snapshot under the writer lock.
    ///
    /// `f` sees the current snapshot and returns the fields to change, or an
    /// error to leave everything as it is.
    pub fn update(&self, f: impl FnOnce(&Pwd) -> FdResult<PwdFields>) -> FdResult<()> {
        let old = {
            let _g = self.lock.lock();
            let old_ptr = self.current();
            // SAFETY: the descriptor's reference keeps it alive under the lock.
            let old = unsafe { old_ptr.as_ref() };
            let fields = old.fill(f(old)?);
            let new = Pwd::alloc(fields);
            self.pwd.store(new.as_ptr(), Ordering::Release);
            PwdRef { ptr: old_ptr }
        };
        // The descriptor's reference to the previous snapshot.
        drop(old);
        Ok(())
    }

    /// File creation mask.
    #[inline]
    pub fn cmask(&self) -> u16 {
        self.cmask.load(Ordering::Relaxed)
    }

    /// Set the creation mask, returning the previous one.
    pub fn set_cmask(&self, mask: u16) -> u16 {
        self.cmask.swap(mask & 0o7777, Ordering::Relaxed)
    }

    /// New descriptor with the same snapshot and mask.
    pub fn copy(&self) -> Arc<Self> {
        Arc::new(Self::with_pwd(self.hold(), self.cmask()))
    }

    /// New descriptor with the same snapshot and the default mask.
    pub fn init_from(&self) -> Arc<Self> {
        Arc::new(Self::with_pwd(self.hold(), CMASK))
    }

    /// A private descriptor: `this` itself when unshared, otherwise a copy.
    pub fn unshare(this: Arc<Self>) -> Arc<Self> {
        if Arc::strong_count(&this) == 1 {
            this
        } else {
            this.copy()
        }
    }
}

impl Drop for PwdDesc {
    fn drop(&mut self) {
        let ptr = *self.pwd.get_mut();
        if let Some(ptr) = NonNull::new(ptr) {
            drop(PwdRef { ptr });
        }
    }
}

impl fmt::Debug for PwdDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PwdDesc")
            .field("pwd", &*self.borrow())
            .field("cmask", &self.cmask())
            .finish()
    }
}
