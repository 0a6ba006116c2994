//! Per-process swapping: slot accounting in a bitmap and page I/O against
//! the process's swap file.
//!
//! The swap file for pid N is `/pgswpN` in the root filesystem; slot `i`
//! occupies bytes `[i * PAGE_FRAME_SIZE, (i + 1) * PAGE_FRAME_SIZE)`. The
//! file is created on the first swap-out and unlinked at process exit.

pub mod page_replacement;

use crate::mem::pages::PageState;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::process::Pid;
use crate::threading::thread_control_block::ProcessControlBlock;
use alloc::format;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use bitvec::prelude::*;
use marrow_shared::mem::PAGE_FRAME_SIZE;

/// Max pages per process swap file (4 MB). This is a hard ceiling: running
/// out of slots kills the process.
pub const MAX_SWAP_SLOTS: usize = 1024;

type SlotBits = BitArr!(for MAX_SWAP_SLOTS);

/// Bit vector of swap slots; bit i set means slot i is in use.
///
/// The allocator does not serialize slot reuse with I/O: the caller must
/// write before releasing a slot and must not release it until the page is
/// either unmapped or swapped back in.
#[derive(Clone)]
pub struct SlotBitmap {
    bits: SlotBits,
}

impl Default for SlotBitmap {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotBitmap {
    pub fn new() -> Self {
        Self {
            bits: BitArray::ZERO,
        }
    }

    /// Claim the lowest clear bit.
    pub fn alloc(&mut self) -> Option<usize> {
        let slot = self.bits.first_zero()?;
        self.bits.set(slot, true);
        Some(slot)
    }

    /// Clear bit `slot`. Out-of-range indices are no-ops.
    pub fn free(&mut self, slot: usize) {
        if slot < MAX_SWAP_SLOTS {
            self.bits.set(slot, false);
        }
    }

    pub fn is_set(&self, slot: usize) -> bool {
        slot < MAX_SWAP_SLOTS && self.bits[slot]
    }

    pub fn count_set(&self) -> usize {
        self.bits.count_ones()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapError {
    /// All 1024 slots are taken.
    SlotsExhausted,
    /// The page's metadata no longer matches what the operation expected.
    BadState,
    Io,
}

impl core::fmt::Display for SwapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::SlotsExhausted => write!(f, "swap slots exhausted"),
            Self::BadState => write!(f, "page not in the expected state"),
            Self::Io => write!(f, "swap file I/O failed"),
        }
    }
}

impl core::error::Error for SwapError {}

pub fn swap_file_path(pid: Pid) -> String {
    format!("/pgswp{}", pid)
}

/// Write the page at `va` (currently resident in `frame`) out to a fresh
/// slot in the process's swap file. On success the page is marked SWAPPED;
/// the caller still owns the PTE and the frame. The file write completes
/// before the metadata flips, so clearing the PTE afterwards observes a
/// durable copy.
pub fn swap_out_page(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    va: usize,
    frame: usize,
) -> Result<usize, SwapError> {
    let (pid, inode, slot) = {
        let mut p = proc.lock();
        let pid = p.pid;
        let inode = match p.mem.swap_inode {
            Some(inode) => inode,
            None => {
                let inode = sys
                    .root_fs
                    .lock()
                    .create_direct(&swap_file_path(pid))
                    .map_err(|_| SwapError::Io)?;
                p.mem.swap_inode = Some(inode);
                inode
            }
        };
        let Some(slot) = p.mem.swap_slots.alloc() else {
            sys.console
                .log(format!("[pid {pid}] KILL    swap-exhausted"));
            p.killed = true;
            return Err(SwapError::SlotsExhausted);
        };
        (pid, inode, slot)
    };

    // Copy the frame out and do the file I/O without the process lock held.
    let mut buf = vec![0u8; PAGE_FRAME_SIZE];
    buf.copy_from_slice(sys.phys.lock().frame(frame));
    let wrote = sys
        .root_fs
        .lock()
        .write_direct(inode, (slot * PAGE_FRAME_SIZE) as u64, &buf);

    let mut p = proc.lock();
    match wrote {
        Ok(n) if n == PAGE_FRAME_SIZE => {
            let Some(pi) = p.mem.page_info_mut(va) else {
                p.mem.swap_slots.free(slot);
                return Err(SwapError::BadState);
            };
            pi.state = PageState::Swapped;
            pi.swap_slot = Some(slot);
            p.mem.num_swapped_pages += 1;
            sys.console
                .log(format!("[pid {pid}] SWAPOUT va={va:#x} slot={slot}"));
            Ok(slot)
        }
        _ => {
            p.mem.swap_slots.free(slot);
            Err(SwapError::Io)
        }
    }
}

/// Read the page at `va` back from its slot into `frame`, release the slot
/// and stamp the page resident. The read completes before this returns, so
/// the caller may install the PTE immediately after.
pub fn swap_in_page(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    va: usize,
    frame: usize,
) -> Result<(), SwapError> {
    let (pid, inode, slot) = {
        let p = proc.lock();
        let pi = p.mem.page_info(va).ok_or(SwapError::BadState)?;
        if pi.state != PageState::Swapped {
            return Err(SwapError::BadState);
        }
        (
            p.pid,
            p.mem.swap_inode.ok_or(SwapError::BadState)?,
            pi.swap_slot.ok_or(SwapError::BadState)?,
        )
    };

    let mut buf = vec![0u8; PAGE_FRAME_SIZE];
    sys.root_fs
        .lock()
        .read_direct(inode, (slot * PAGE_FRAME_SIZE) as u64, &mut buf)
        .map_err(|_| SwapError::Io)?;
    sys.phys.lock().frame_mut(frame).copy_from_slice(&buf);

    let mut p = proc.lock();
    let seq = p.mem.next_fifo_seq;
    {
        let Some(pi) = p.mem.page_info_mut(va) else {
            return Err(SwapError::BadState);
        };
        // Re-validate after the I/O window.
        if pi.state != PageState::Swapped || pi.swap_slot != Some(slot) {
            return Err(SwapError::BadState);
        }
        pi.state = PageState::Resident;
        pi.swap_slot = None;
        pi.seq = seq;
        pi.dirty = false;
    }
    p.mem.next_fifo_seq += 1;
    p.mem.swap_slots.free(slot);
    if p.mem.num_swapped_pages > 0 {
        p.mem.num_swapped_pages -= 1;
    }
    sys.console
        .log(format!("[pid {pid}] SWAPIN  va={va:#x} slot={slot}"));
    sys.console
        .log(format!("[pid {pid}] RESIDENT va={va:#x} seq={seq}"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_allocate_lowest_first() {
        let mut slots = SlotBitmap::new();
        assert_eq!(slots.alloc(), Some(0));
        assert_eq!(slots.alloc(), Some(1));
        slots.free(0);
        assert_eq!(slots.alloc(), Some(0));
        assert_eq!(slots.alloc(), Some(2));
        assert_eq!(slots.count_set(), 3);
    }

    #[test]
    fn test_slots_exhaust_at_capacity() {
        let mut slots = SlotBitmap::new();
        for i in 0..MAX_SWAP_SLOTS {
            assert_eq!(slots.alloc(), Some(i));
        }
        assert_eq!(slots.alloc(), None);
        slots.free(17);
        assert_eq!(slots.alloc(), Some(17));
    }

    #[test]
    fn test_out_of_range_free_is_noop() {
        let mut slots = SlotBitmap::new();
        slots.free(MAX_SWAP_SLOTS);
        slots.free(usize::MAX);
        assert_eq!(slots.count_set(), 0);
    }

    #[test]
    fn test_swap_file_path_format() {
        assert_eq!(swap_file_path(7), "/pgswp7");
        assert_eq!(swap_file_path(12345), "/pgswp12345");
    }
}
