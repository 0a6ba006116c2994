//! Read-only snapshots of a process's page states for the memstat syscall.
//!
//! Counts are recomputed from the metadata table; they are observability
//! output, not authoritative state.

use crate::mem::pages::{MemoryRecord, PageState};
use crate::threading::process::Pid;
use marrow_syscalls::{
    PageStat, ProcMemStat, MAX_PAGES_INFO, PAGE_STATE_RESIDENT, PAGE_STATE_SWAPPED,
    PAGE_STATE_UNMAPPED,
};
use marrow_shared::mem::PAGE_FRAME_SIZE;
use zerocopy::FromZeroes;

pub fn snapshot(mem: &MemoryRecord, pid: Pid) -> ProcMemStat {
    let mut info = ProcMemStat::new_zeroed();
    info.pid = pid as u32;
    info.num_pages_total = mem.sz.div_ceil(PAGE_FRAME_SIZE) as u32;
    info.num_resident_pages = mem.resident_count() as u32;
    info.num_swapped_pages = mem.swapped_count() as u32;
    info.next_fifo_seq = mem.next_fifo_seq;
    for (slot, pi) in mem.pages.iter().take(MAX_PAGES_INFO).enumerate() {
        info.pages[slot] = PageStat {
            va: pi.va as u64,
            seq: pi.seq,
            swap_slot: pi.swap_slot.map(|s| s as i64).unwrap_or(-1),
            state: match pi.state {
                PageState::Unmapped => PAGE_STATE_UNMAPPED,
                PageState::Resident => PAGE_STATE_RESIDENT,
                PageState::Swapped => PAGE_STATE_SWAPPED,
            },
            is_dirty: pi.dirty as u32,
        };
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::pages::PageInfo;

    #[test]
    fn test_counts_recomputed_from_table() {
        let mut mem = MemoryRecord::new();
        mem.sz = 3 * PAGE_FRAME_SIZE + 1;
        for (i, state) in [
            PageState::Resident,
            PageState::Swapped,
            PageState::Unmapped,
            PageState::Resident,
        ]
        .into_iter()
        .enumerate()
        {
            let mut pi = PageInfo::new(i * PAGE_FRAME_SIZE);
            pi.state = state;
            if state == PageState::Swapped {
                pi.swap_slot = Some(5);
            }
            mem.pages.push(pi);
        }
        mem.next_fifo_seq = 9;

        let info = snapshot(&mem, 3);
        assert_eq!(info.pid, 3);
        assert_eq!(info.num_pages_total, 4); // ceil(sz / PGSIZE)
        assert_eq!(info.num_resident_pages, 2);
        assert_eq!(info.num_swapped_pages, 1);
        assert_eq!(info.next_fifo_seq, 9);
        assert_eq!(info.pages[1].state, PAGE_STATE_SWAPPED);
        assert_eq!(info.pages[1].swap_slot, 5);
        assert_eq!(info.pages[2].swap_slot, -1);
    }
}
