//! Capability Rights Engine
//!
//! Every descriptor carries a capability rights set that bounds what may be
//! done through it, independently of how the underlying file was opened.
//!
//! # Design
//! - `CapRights`: coarse 64-bit rights (read, write, seek, fcntl, ioctl, ...)
//! - `FcntlRights`: which fcntl commands remain allowed once `FCNTL` is held
//! - `IoctlList`: either every ioctl or an explicit allow-list
//! - `Filecaps`: the three together, as stored in a descriptor entry
//!
//! # Security Properties
//! - Rights can only be reduced, never increased
//! - A rights violation is reported as `NotCapable`, never as a bad descriptor
//! - Requests to widen fail instead of being silently truncated

pub mod filecaps;
pub mod rights;

pub use filecaps::{Filecaps, IoctlList, MAX_IOCTLS};
pub use rights::{CapRights, FcntlRights};
