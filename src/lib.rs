//! PantherOS Descriptor Tables
//!
//! Per-process descriptor tables for the PantherOS kernel: small integer
//! handles mapped to reference-counted file objects, each handle carrying a
//! capability rights set that can only ever shrink.
//!
//! # Design
//! - The hot path resolves a handle without taking any lock (seqcount read,
//!   increment-if-not-zero, re-verify, retry)
//! - Mutations serialise on the table's exclusive lock and are published to
//!   lock-free readers one slot write section at a time
//! - Replaced backing arrays, dead files and old working-directory snapshots
//!   are reclaimed only once no lock-free reader can still observe them
//!
//! # Security Properties
//! - Rights are narrowed, never widened, by every derivation path
//! - A closed handle is never resolvable by a lookup that starts afterwards
//! - A lookup never returns a reference to destroyed memory
//! - chroot refuses to leave open directory handles behind when policy says so

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cap;
pub mod config;
pub mod error;
pub mod fdesc;
pub mod file;
pub mod hooks;
pub mod proc;
pub mod pwd;
pub mod sync;
pub mod system;

#[cfg(test)]
mod testutil;

pub use cap::{CapRights, FcntlRights, Filecaps, IoctlList};
pub use config::{ChrootPolicy, FdLimits};
pub use error::{FdError, FdResult};
pub use fdesc::{CloseRangeFlags, FdFlags, FdescHold, FdescRef, FileDesc, FileInfo, Leader, LeaderLink};
pub use file::{File, FileFlags, FileOps, FileRef, FileType, Vnode, VnodeRef};
pub use hooks::{FdHooks, LockOwner, NoHooks};
pub use proc::{DupFlags, DupMode, ForkMode, Process};
pub use pwd::{Pwd, PwdBorrow, PwdDesc, PwdFields, PwdRef};
pub use system::FdSystem;

/// A descriptor number as seen by system calls.
///
/// Signed so that malformed (negative) numbers coming from user space can be
/// rejected with the proper error rather than wrapped.
pub type RawFd = i32;
