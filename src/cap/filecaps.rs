//! Descriptor Capability Sets
//!
//! `Filecaps` bundles the three layers of a descriptor's capabilities. All
//! mutating operations only ever shrink the set.

use alloc::vec::Vec;

use super::rights::{CapRights, FcntlRights};
use crate::error::{FdError, FdResult};

/// Upper bound on the length of an ioctl allow-list.
pub const MAX_IOCTLS: usize = 256;

/// ioctl commands allowed on a descriptor holding `CapRights::IOCTL`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IoctlList {
    /// Every command is allowed.
    #[default]
    All,
    /// Only the listed commands are allowed.
    Only(Vec<u64>),
}

impl IoctlList {
    /// An allow-list that permits nothing.
    pub const fn none() -> Self {
        Self::Only(Vec::new())
    }

    /// Whether `cmd` is on the list.
    pub fn allows(&self, cmd: u64) -> bool {
        match self {
            Self::All => true,
            Self::Only(cmds) => cmds.contains(&cmd),
        }
    }

    /// Whether every command allowed by `self` is allowed by `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        match (self, other) {
            (_, Self::All) => true,
            (Self::All, Self::Only(_)) => false,
            (Self::Only(mine), Self::Only(theirs)) => mine.iter().all(|c| theirs.contains(c)),
        }
    }
}

/// Rights, fcntl mask and ioctl list of a single descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filecaps {
    pub rights: CapRights,
    pub fcntls: FcntlRights,
    pub ioctls: IoctlList,
}

impl Filecaps {
    /// Everything allowed. New descriptors start here.
    pub fn all() -> Self {
        Self {
            rights: CapRights::all(),
            fcntls: FcntlRights::all(),
            ioctls: IoctlList::All,
        }
    }

    /// Nothing allowed.
    pub fn none() -> Self {
        Self {
            rights: CapRights::empty(),
            fcntls: FcntlRights::empty(),
            ioctls: IoctlList::none(),
        }
    }

    /// Set with the given rights, and allow-lists matching what those rights
    /// keep reachable.
    pub fn with_rights(rights: CapRights) -> Self {
        let mut caps = Self::all();
        caps.rights = rights;
        caps.drop_unreachable();
        caps
    }

    /// Fail with `NotCapable` unless every right in `required` is held.
    #[inline]
    pub fn check(&self, required: CapRights) -> FdResult<()> {
        check_rights(self.rights, required)
    }

    /// Whether `self` allows nothing beyond what `other` allows.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        other.rights.contains(self.rights)
            && other.fcntls.contains(self.fcntls)
            && self.ioctls.is_subset_of(&other.ioctls)
    }

    /// Derive a copy restricted to `subset`. Widening is an error.
    pub fn narrow(&self, subset: &Self) -> FdResult<Self> {
        if !subset.is_subset_of(self) {
            return Err(FdError::NotCapable);
        }
        let mut caps = subset.clone();
        caps.drop_unreachable();
        Ok(caps)
    }

    /// Replace the rights with `rights`, which must not add anything.
    ///
    /// Dropping `FCNTL` or `IOCTL` also clears the matching allow-list.
    pub fn limit_rights(&mut self, rights: CapRights) -> FdResult<()> {
        if !self.rights.contains(rights) {
            return Err(FdError::NotCapable);
        }
        self.rights = rights;
        self.drop_unreachable();
        Ok(())
    }

    /// Replace the fcntl mask with `mask`.
    ///
    /// Bits outside the known commands are `InvalidArgument`; adding a command
    /// is `NotCapable`.
    pub fn limit_fcntls(&mut self, mask: u32) -> FdResult<()> {
        let mask = FcntlRights::from_bits(mask).ok_or(FdError::InvalidArgument)?;
        if !self.fcntls.contains(mask) {
            return Err(FdError::NotCapable);
        }
        self.fcntls = mask;
        Ok(())
    }

    /// Replace the ioctl list with exactly `cmds`.
    pub fn limit_ioctls(&mut self, cmds: &[u64]) -> FdResult<()> {
        if cmds.len() > MAX_IOCTLS {
            return Err(FdError::InvalidArgument);
        }
        let list = IoctlList::Only(cmds.to_vec());
        if !list.is_subset_of(&self.ioctls) {
            return Err(FdError::NotCapable);
        }
        self.ioctls = list;
        Ok(())
    }

    /// Check an fcntl command against the `FCNTL` right and the allow-mask.
    pub fn check_fcntl(&self, cmd: u32) -> FdResult<()> {
        check_fcntl(self.rights, self.fcntls, cmd)
    }

    /// Check an ioctl command against the `IOCTL` right and the allow-list.
    pub fn check_ioctl(&self, cmd: u64) -> FdResult<()> {
        self.check(CapRights::IOCTL)?;
        if self.ioctls.allows(cmd) {
            Ok(())
        } else {
            Err(FdError::NotCapable)
        }
    }

    fn drop_unreachable(&mut self) {
        if !self.rights.contains(CapRights::FCNTL) {
            self.fcntls = FcntlRights::empty();
        }
        if !self.rights.contains(CapRights::IOCTL) {
            self.ioctls = IoctlList::none();
        }
    }
}

impl Default for Filecaps {
    fn default() -> Self {
        Self::all()
    }
}

/// Rights check on raw bits, for callers that do not hold a full `Filecaps`.
#[inline]
pub fn check_rights(held: CapRights, required: CapRights) -> FdResult<()> {
    if held.contains(required) {
        Ok(())
    } else {
        Err(FdError::NotCapable)
    }
}

/// fcntl check on raw bits. Commands outside the mask only need `FCNTL`.
pub fn check_fcntl(rights: CapRights, fcntls: FcntlRights, cmd: u32) -> FdResult<()> {
    check_rights(rights, CapRights::FCNTL)?;
    match FcntlRights::for_cmd(cmd) {
        Some(bit) if !fcntls.contains(bit) => Err(FdError::NotCapable),
        _ => Ok(()),
    }
}
