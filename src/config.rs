//! Descriptor Subsystem Configuration
//!
//! Compile-time sizing constants and the runtime limit types consulted by
//! allocation and chroot.

/// Number of slots in a freshly created table.
pub const NDFILE: usize = 20;

/// Descriptors tracked per bitmap word.
pub const NDENTRIES: usize = u64::BITS as usize;

/// Entries collected per shared-lock hold while enumerating a table.
pub const ENUM_BATCH: usize = 32;

/// Default system-wide open file limit.
pub const DEFAULT_MAXFILES: usize = 65_536;

/// Default per-process descriptor ceiling.
pub const DEFAULT_MAXFILESPERPROC: usize = 32_768;

/// Default soft RLIMIT_NOFILE.
pub const DEFAULT_RLIMIT_NOFILE: usize = 1_024;

/// Default file creation mask.
pub const CMASK: u16 = 0o022;

/// Number of bitmap words needed to cover `nfiles` descriptors.
#[inline]
pub const fn nd_slots(nfiles: usize) -> usize {
    nfiles.div_ceil(NDENTRIES)
}

/// Per-process descriptor limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdLimits {
    /// Soft RLIMIT_NOFILE.
    pub rlimit_nofile: usize,
    /// Administrative ceiling applied on top of the rlimit.
    pub max_files_per_proc: usize,
}

impl FdLimits {
    pub const DEFAULT: Self = Self {
        rlimit_nofile: DEFAULT_RLIMIT_NOFILE,
        max_files_per_proc: DEFAULT_MAXFILESPERPROC,
    };

    /// Limits with a specific RLIMIT_NOFILE and the default ceiling.
    pub const fn with_rlimit(rlimit_nofile: usize) -> Self {
        Self {
            rlimit_nofile,
            max_files_per_proc: DEFAULT_MAXFILESPERPROC,
        }
    }

    /// Exclusive upper bound on descriptor numbers.
    #[inline]
    pub const fn max_fd(&self) -> usize {
        if self.rlimit_nofile < self.max_files_per_proc {
            self.rlimit_nofile
        } else {
            self.max_files_per_proc
        }
    }
}

impl Default for FdLimits {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Whether chroot may proceed while directories are open.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChrootPolicy {
    /// Refuse whenever any directory handle is open.
    RefuseOpenDirs = 0,
    /// Refuse only when the process is already chrooted.
    #[default]
    RefuseIfChrooted = 1,
    /// Never refuse.
    AllowOpenDirs = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nd_slots() {
        assert_eq!(nd_slots(0), 0);
        assert_eq!(nd_slots(1), 1);
        assert_eq!(nd_slots(NDFILE), 1);
        assert_eq!(nd_slots(64), 1);
        assert_eq!(nd_slots(65), 2);
    }

    #[test]
    fn test_max_fd_is_minimum() {
        let limits = FdLimits {
            rlimit_nofile: 10,
            max_files_per_proc: 100,
        };
        assert_eq!(limits.max_fd(), 10);
        let limits = FdLimits {
            rlimit_nofile: 1000,
            max_files_per_proc: 100,
        };
        assert_eq!(limits.max_fd(), 100);
    }
}
