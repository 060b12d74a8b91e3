//! Capability Rights
//!
//! Bit assignments for descriptor rights and the fcntl allow-mask.

use bitflags::bitflags;

bitflags! {
    /// Coarse rights held by a descriptor.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapRights: u64 {
        // I/O
        const READ        = 1 << 0;
        const WRITE       = 1 << 1;
        const SEEK_TELL   = 1 << 2;
        const SEEK        = 1 << 3;
        const MMAP        = 1 << 4;
        const CREATE      = 1 << 5;
        const FEXECVE     = 1 << 6;
        const FSYNC       = 1 << 7;
        const FTRUNCATE   = 1 << 8;

        // Metadata
        const LOOKUP      = 1 << 10;
        const FCHDIR      = 1 << 11;
        const FCHFLAGS    = 1 << 12;
        const FCHMOD      = 1 << 13;
        const FCHOWN      = 1 << 14;
        const FLOCK       = 1 << 15;
        const FPATHCONF   = 1 << 16;
        const FSTAT       = 1 << 17;
        const FSTATFS     = 1 << 18;
        const FUTIMES     = 1 << 19;

        // Control
        const FCNTL       = 1 << 20;
        const IOCTL       = 1 << 21;
        const EVENT       = 1 << 22;
        const KQUEUE_EVENT  = 1 << 23;
        const KQUEUE_CHANGE = 1 << 24;

        // Sockets
        const ACCEPT      = 1 << 32;
        const BIND        = 1 << 33;
        const CONNECT     = 1 << 34;
        const GETPEERNAME = 1 << 35;
        const GETSOCKNAME = 1 << 36;
        const GETSOCKOPT  = 1 << 37;
        const LISTEN      = 1 << 38;
        const SETSOCKOPT  = 1 << 39;
        const SHUTDOWN    = 1 << 40;

        // Process descriptors
        const PDGETPID    = 1 << 48;
        const PDKILL      = 1 << 49;
        const PDWAIT      = 1 << 50;
    }
}

impl CapRights {
    /// Rights needed to read and seek a file.
    pub const FILE_READ: Self = Self::READ.union(Self::SEEK).union(Self::FSTAT);

    /// Rights needed to write and seek a file.
    pub const FILE_WRITE: Self = Self::WRITE.union(Self::SEEK).union(Self::FSTAT);

    /// Rights needed to poll a descriptor.
    pub const POLL: Self = Self::EVENT;

    /// Whether these rights can be reduced to `target` without widening.
    #[inline]
    pub fn can_reduce_to(self, target: Self) -> bool {
        self.contains(target)
    }
}

bitflags! {
    /// fcntl commands that stay allowed while `CapRights::FCNTL` is held.
    ///
    /// Bit `n` corresponds to fcntl command `n`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FcntlRights: u32 {
        const GETFL  = 1 << 3;
        const SETFL  = 1 << 4;
        const GETOWN = 1 << 5;
        const SETOWN = 1 << 6;
    }
}

impl FcntlRights {
    /// The allow-mask bit guarding fcntl command `cmd`, if the command is
    /// subject to the mask at all.
    #[inline]
    pub fn for_cmd(cmd: u32) -> Option<Self> {
        1u32.checked_shl(cmd)
            .and_then(Self::from_bits)
            .filter(|bit| !bit.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_reduce_to() {
        assert!(CapRights::FILE_READ.can_reduce_to(CapRights::READ));
        assert!(!CapRights::READ.can_reduce_to(CapRights::FILE_READ));
        assert!(CapRights::empty().can_reduce_to(CapRights::empty()));
    }

    #[test]
    fn test_fcntl_for_cmd() {
        assert_eq!(FcntlRights::for_cmd(3), Some(FcntlRights::GETFL));
        assert_eq!(FcntlRights::for_cmd(6), Some(FcntlRights::SETOWN));
        assert_eq!(FcntlRights::for_cmd(0), None);
        assert_eq!(FcntlRights::for_cmd(40), None);
    }
}
