// syscall constants and types
// These are in a separate crate so that both the kernel and user programs can
// share them.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const SYS_EXIT: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_GETPID: usize = 4;
pub const SYS_SBRK: usize = 5;
pub const SYS_PAUSE: usize = 6;
pub const SYS_YIELD: usize = 7;
pub const SYS_NICE: usize = 8;
pub const SYS_OPEN: usize = 9;
pub const SYS_CLOSE: usize = 10;
pub const SYS_READ: usize = 11;
pub const SYS_WRITE: usize = 12;
pub const SYS_UNLINK: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_GETREADCOUNT: usize = 15;
pub const SYS_MEMSTAT: usize = 16;
pub const SYS_KILL: usize = 17;

pub const ENOENT: isize = 2;
pub const EIO: isize = 5;
pub const EBADF: isize = 9;
pub const ENOMEM: isize = 12;
pub const EFAULT: isize = 14;
pub const EEXIST: isize = 17;
pub const EINVAL: isize = 22;
pub const EMFILE: isize = 24;
pub const ENOSPC: isize = 28;
pub const ENOSYS: isize = 38;

/// `sbrk` growth modes. Negative increments always shrink eagerly regardless
/// of the mode.
pub const SBRK_EAGER: u32 = 0;
pub const SBRK_LAZY: u32 = 1;

/// Max pages reported per memstat call.
pub const MAX_PAGES_INFO: usize = 128;

// Page states as reported by memstat.
pub const PAGE_STATE_UNMAPPED: u32 = 0;
pub const PAGE_STATE_RESIDENT: u32 = 1;
pub const PAGE_STATE_SWAPPED: u32 = 2;

/// Per-page record in a memstat snapshot.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromZeroes, FromBytes, AsBytes)]
pub struct PageStat {
    /// Page-aligned virtual address.
    pub va: u64,
    /// FIFO sequence number (valid while resident).
    pub seq: u64,
    /// Swap slot number, -1 when not swapped.
    pub swap_slot: i64,
    /// One of the `PAGE_STATE_*` constants.
    pub state: u32,
    /// 1 if the page has been written since it became resident.
    pub is_dirty: u32,
}

/// Snapshot written to user memory by the memstat syscall.
#[repr(C)]
#[derive(Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct ProcMemStat {
    pub pid: u32,
    pub num_pages_total: u32,
    pub num_resident_pages: u32,
    pub num_swapped_pages: u32,
    pub next_fifo_seq: u64,
    pub pages: [PageStat; MAX_PAGES_INFO],
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_snapshot_layout_is_padding_free() {
        assert_eq!(size_of::<PageStat>(), 32);
        assert_eq!(
            size_of::<ProcMemStat>(),
            16 + 8 + MAX_PAGES_INFO * size_of::<PageStat>()
        );
    }
}
