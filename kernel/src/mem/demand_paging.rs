//! The page-fault handler.
//!
//! Pages are installed read-only wherever the segment allows it; the first
//! write then takes a second fault which records the dirty bit and upgrades
//! the PTE. Write permission is granted directly at install time only for
//! heap/stack pages faulted by a write, in which case the page starts out
//! dirty.

use crate::mem::pages::{PageState, Region};
use crate::paging::{Access, PagePerm};
use crate::swapping::page_replacement::{evict_one, EvictError};
use crate::swapping::swap_in_page;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::thread_control_block::ProcessControlBlock;
use crate::vfs::INodeNum;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use marrow_shared::mem::pg_round_down;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// The address is outside every legal region. Syscall callers surface
    /// an error; the trap path kills the process.
    Invalid,
    /// No frame could be acquired even after eviction.
    MemFull,
    /// The eviction needed to make room could not get a swap slot.
    SwapExhausted,
    /// The PTE could not be installed.
    MapFailed,
    /// Swap or executable I/O failed.
    Io,
    /// The process was killed while the fault was being resolved.
    Killed,
}

impl core::fmt::Display for FaultError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid access"),
            Self::MemFull => write!(f, "out of physical memory"),
            Self::SwapExhausted => write!(f, "swap slots exhausted"),
            Self::MapFailed => write!(f, "page table insertion failed"),
            Self::Io => write!(f, "backing store I/O failed"),
            Self::Killed => write!(f, "process killed"),
        }
    }
}

impl core::error::Error for FaultError {}

#[derive(Clone, Copy)]
enum Populate {
    SwapIn,
    ExecLoad {
        inode: INodeNum,
        file_off: u64,
        file_len: usize,
    },
    ZeroFill,
}

/// Resolve a fault at `fault_va`. On success the page is resident with
/// permissions matching its segment and the access that faulted.
pub fn handle_page_fault(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    fault_va: usize,
    access: Access,
) -> Result<(), FaultError> {
    let va = pg_round_down(fault_va);
    let is_write = access == Access::Write;

    // Classification, under the process lock.
    let (pid, region, populate) = {
        let mut p = proc.lock();
        let pid = p.pid;

        if p.mem.page_table.translate(va, access).is_some() {
            // Spurious: resolved while the faulting thread was getting here.
            return Ok(());
        }
        if p.mem.page_table.is_mapped(va) {
            // Present but lacking W on a write fault: this is how dirty
            // tracking is realised.
            if is_write {
                if let Some(pi) = p.mem.page_info_mut(va) {
                    if pi.state == PageState::Resident {
                        pi.dirty = true;
                        p.mem.page_table.grant_write(va);
                        return Ok(());
                    }
                }
            }
            sys.console.log(format!(
                "[pid {pid}] PAGEFAULT va={va:#x} access={} cause=unknown",
                access.as_str()
            ));
            return Err(FaultError::Invalid);
        }

        let region = p.mem.layout.classify(va, p.mem.sz);
        let exec_inode = p.mem.exec_inode;
        if p.mem.page_info_or_insert(va).is_none() {
            sys.console.log(format!("[pid {pid}] MEMFULL"));
            p.killed = true;
            return Err(FaultError::MemFull);
        }
        let (state, file_off, file_len) = match p.mem.page_info(va) {
            Some(pi) => (pi.state, pi.file_off, pi.file_len),
            None => return Err(FaultError::MemFull),
        };

        let (cause, populate) = if state == PageState::Swapped {
            ("swap", Some(Populate::SwapIn))
        } else {
            match region {
                Region::Exec => match exec_inode {
                    Some(inode) => (
                        "exec",
                        Some(Populate::ExecLoad {
                            inode,
                            file_off,
                            file_len,
                        }),
                    ),
                    None => ("unknown", None),
                },
                Region::Heap => ("heap", Some(Populate::ZeroFill)),
                Region::Stack => ("stack", Some(Populate::ZeroFill)),
                Region::Invalid => ("unknown", None),
            }
        };
        sys.console.log(format!(
            "[pid {pid}] PAGEFAULT va={va:#x} access={} cause={cause}",
            access.as_str()
        ));
        let Some(populate) = populate else {
            return Err(FaultError::Invalid);
        };
        (pid, region, populate)
    };

    // Acquire a frame, evicting within this process at most once.
    let first_try = sys.phys.lock().alloc_frame();
    let frame = match first_try {
        Some(frame) => frame,
        None => {
            if proc.lock().killed {
                return Err(FaultError::Killed);
            }
            match evict_one(sys, proc) {
                Ok(()) => {}
                Err(EvictError::SwapExhausted) => return Err(FaultError::SwapExhausted),
                Err(_) => {
                    sys.console.log(format!("[pid {pid}] MEMFULL"));
                    proc.lock().killed = true;
                    return Err(FaultError::MemFull);
                }
            }
            let retry = sys.phys.lock().alloc_frame();
            match retry {
                Some(frame) => frame,
                None => {
                    sys.console.log(format!("[pid {pid}] MEMFULL"));
                    proc.lock().killed = true;
                    return Err(FaultError::MemFull);
                }
            }
        }
    };
    sys.phys.lock().zero_frame(frame);

    // Populate. I/O happens without the process lock; the swap path
    // re-validates its metadata after the read.
    match populate {
        Populate::SwapIn => {
            if swap_in_page(sys, proc, va, frame).is_err() {
                sys.phys.lock().free_frame(frame);
                return Err(FaultError::Io);
            }
        }
        Populate::ExecLoad {
            inode,
            file_off,
            file_len,
        } => {
            if file_len > 0 {
                let mut buf = vec![0u8; file_len];
                let read = sys.root_fs.lock().read_direct(inode, file_off, &mut buf);
                match read {
                    Ok(n) => {
                        sys.phys.lock().frame_mut(frame)[..n].copy_from_slice(&buf[..n]);
                    }
                    Err(_) => {
                        sys.phys.lock().free_frame(frame);
                        return Err(FaultError::Io);
                    }
                }
            }
            sys.console
                .log(format!("[pid {pid}] LOADEXEC va={va:#x}"));
        }
        Populate::ZeroFill => {
            sys.console.log(format!("[pid {pid}] ALLOC   va={va:#x}"));
        }
    }

    // Install the PTE and stamp the metadata.
    let mut p = proc.lock();
    if p.mem.page_table.is_mapped(va) {
        // Resolved concurrently while the lock was dropped for I/O.
        sys.phys.lock().free_frame(frame);
        return Ok(());
    }
    let in_text = p.mem.layout.in_text(va);
    let grant_write = is_write && matches!(region, Region::Heap | Region::Stack);
    let perm = PagePerm {
        write: grant_write,
        execute: in_text,
    };
    if p.mem.page_table.map(va, frame, perm).is_err() {
        sys.phys.lock().free_frame(frame);
        p.killed = true;
        return Err(FaultError::MapFailed);
    }
    match populate {
        Populate::SwapIn => {
            // swap_in_page already stamped the page; a write fault that got
            // its W bit at install time starts out dirty.
            if grant_write {
                if let Some(pi) = p.mem.page_info_mut(va) {
                    pi.dirty = true;
                }
            }
        }
        _ => {
            let seq = p.mem.next_fifo_seq;
            p.mem.next_fifo_seq += 1;
            if let Some(pi) = p.mem.page_info_mut(va) {
                pi.state = PageState::Resident;
                pi.seq = seq;
                pi.dirty = grant_write;
            }
            sys.console
                .log(format!("[pid {pid}] RESIDENT va={va:#x} seq={seq}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::pages::MemoryLayout;
    use crate::system::{SystemParams, SystemState};
    use crate::threading::thread_control_block::ProcessControlBlock;
    use marrow_shared::mem::PAGE_FRAME_SIZE;

    const PG: usize = PAGE_FRAME_SIZE;

    fn system(frames: usize) -> SystemState {
        SystemState::new(SystemParams {
            phys_frames: frames,
        })
    }

    // text [1 page], data [1 page], heap above, stack band [0x5000, 0x9000).
    fn layout() -> MemoryLayout {
        MemoryLayout {
            text_start: 0,
            text_end: PG,
            data_start: PG,
            data_end: 2 * PG,
            heap_start: 2 * PG,
            stack_top: 9 * PG,
        }
    }

    fn process(sys: &SystemState) -> Arc<Mutex<ProcessControlBlock>> {
        let pid = sys.process.allocate_pid();
        let mut pcb = ProcessControlBlock::new(pid, 0);
        pcb.mem.layout = layout();
        pcb.mem.sz = layout().stack_top;
        sys.process.table.add(pcb)
    }

    /// (PTE present) iff (state == RESIDENT), for every tracked page.
    fn assert_pte_state_coherent(proc: &Arc<Mutex<ProcessControlBlock>>) {
        let p = proc.lock();
        for pi in &p.mem.pages {
            assert_eq!(
                p.mem.page_table.is_mapped(pi.va),
                pi.state == PageState::Resident,
                "page {:#x} in state {:?}",
                pi.va,
                pi.state
            );
        }
        assert_eq!(p.mem.num_swapped_pages, p.mem.swapped_count());
        assert_eq!(p.mem.swap_slots.count_set(), p.mem.swapped_count());
    }

    #[test]
    fn test_heap_read_fault_installs_read_only() {
        let sys = system(4);
        let proc = process(&sys);
        let va = 3 * PG;
        handle_page_fault(&sys, &proc, va + 5, Access::Read).unwrap();
        {
            let p = proc.lock();
            assert!(p.mem.page_table.translate(va, Access::Read).is_some());
            assert!(p.mem.page_table.translate(va, Access::Write).is_none());
            let pi = p.mem.page_info(va).unwrap();
            assert_eq!(pi.state, PageState::Resident);
            assert_eq!(pi.seq, 0);
            assert!(!pi.dirty);
        }
        assert!(sys.console.contains("PAGEFAULT va=0x3000 access=read cause=heap"));
        assert!(sys.console.contains("ALLOC   va=0x3000"));
        assert!(sys.console.contains("RESIDENT va=0x3000 seq=0"));
        assert_pte_state_coherent(&proc);
    }

    #[test]
    fn test_heap_write_fault_installs_writable_and_dirty() {
        let sys = system(4);
        let proc = process(&sys);
        let va = 3 * PG;
        handle_page_fault(&sys, &proc, va, Access::Write).unwrap();
        let p = proc.lock();
        assert!(p.mem.page_table.translate(va, Access::Write).is_some());
        assert!(p.mem.page_info(va).unwrap().dirty);
    }

    #[test]
    fn test_first_write_upgrades_and_marks_dirty() {
        let sys = system(4);
        let proc = process(&sys);
        let va = 3 * PG;
        handle_page_fault(&sys, &proc, va, Access::Read).unwrap();
        assert!(!proc.lock().mem.page_info(va).unwrap().dirty);
        // Second fault: present but read-only on a write.
        handle_page_fault(&sys, &proc, va, Access::Write).unwrap();
        let p = proc.lock();
        assert!(p.mem.page_table.translate(va, Access::Write).is_some());
        assert!(p.mem.page_info(va).unwrap().dirty);
        // No second FIFO stamp was spent.
        assert_eq!(p.mem.next_fifo_seq, 1);
    }

    #[test]
    fn test_spurious_fault_is_success() {
        let sys = system(4);
        let proc = process(&sys);
        let va = 3 * PG;
        handle_page_fault(&sys, &proc, va, Access::Write).unwrap();
        handle_page_fault(&sys, &proc, va, Access::Write).unwrap();
        assert_eq!(proc.lock().mem.next_fifo_seq, 1);
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let sys = system(4);
        let proc = process(&sys);
        let bad = 0x100 * PG;
        assert_eq!(
            handle_page_fault(&sys, &proc, bad, Access::Read),
            Err(FaultError::Invalid)
        );
        assert!(sys.console.contains("cause=unknown"));
        assert!(!proc.lock().killed);
    }

    #[test]
    fn test_stack_fault_is_zero_filled() {
        let sys = system(4);
        let proc = process(&sys);
        let va = 6 * PG; // inside the stack band
        handle_page_fault(&sys, &proc, va, Access::Write).unwrap();
        assert!(sys.console.contains("cause=stack"));
        let p = proc.lock();
        let (frame, _) = p.mem.page_table.translate(va, Access::Read).unwrap();
        assert!(sys.phys.lock().frame(frame).iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exec_fault_reads_from_image() {
        let sys = system(4);
        let proc = process(&sys);
        let inode = sys.root_fs.lock().create_direct("/img").unwrap();
        let mut contents = alloc::vec![0u8; 300];
        contents[0] = 0xAB;
        contents[299] = 0xCD;
        sys.root_fs.lock().write_direct(inode, 0, &contents).unwrap();
        {
            let mut p = proc.lock();
            p.mem.exec_inode = Some(inode);
            let pi = p.mem.page_info_or_insert(0).unwrap();
            pi.file_off = 0;
            pi.file_len = 300;
        }
        handle_page_fault(&sys, &proc, 0, Access::Exec).unwrap();
        assert!(sys.console.contains("PAGEFAULT va=0x0 access=exec cause=exec"));
        assert!(sys.console.contains("LOADEXEC va=0x0"));
        let p = proc.lock();
        let (frame, _) = p.mem.page_table.translate(0, Access::Exec).unwrap();
        let phys = sys.phys.lock();
        let bytes = phys.frame(frame);
        assert_eq!(bytes[0], 0xAB);
        assert_eq!(bytes[299], 0xCD);
        // BSS tail stays zero.
        assert!(bytes[300..].iter().all(|&b| b == 0));
        // Text is never writable at install.
        assert!(p.mem.page_table.translate(0, Access::Write).is_none());
    }

    #[test]
    fn test_fifo_eviction_under_pressure() {
        let sys = system(2);
        let proc = process(&sys);
        let p0 = 3 * PG;
        let p1 = 4 * PG;
        let p2 = 6 * PG;
        handle_page_fault(&sys, &proc, p0, Access::Write).unwrap();
        handle_page_fault(&sys, &proc, p1, Access::Write).unwrap();
        // Third fault: both frames are taken; the oldest page goes.
        handle_page_fault(&sys, &proc, p2, Access::Write).unwrap();

        assert!(sys.console.contains("VICTIM  va=0x3000 seq=0 algo=FIFO"));
        assert!(sys.console.contains("EVICT   va=0x3000 state=dirty"));
        assert!(sys.console.contains("SWAPOUT va=0x3000 slot=0"));
        {
            let p = proc.lock();
            let pi = p.mem.page_info(p0).unwrap();
            assert_eq!(pi.state, PageState::Swapped);
            assert_eq!(pi.swap_slot, Some(0));
            assert_eq!(p.mem.num_swapped_pages, 1);
            assert!(!p.mem.page_table.is_mapped(p0));
        }
        assert_pte_state_coherent(&proc);

        // Touching the swapped page brings it back in (and evicts p1).
        handle_page_fault(&sys, &proc, p0, Access::Read).unwrap();
        assert!(sys.console.contains("PAGEFAULT va=0x3000 access=read cause=swap"));
        assert!(sys.console.contains("SWAPIN  va=0x3000 slot=0"));
        {
            let p = proc.lock();
            let pi = p.mem.page_info(p0).unwrap();
            assert_eq!(pi.state, PageState::Resident);
            assert_eq!(pi.swap_slot, None);
            assert_eq!(p.mem.num_swapped_pages, 1); // p1 went out to make room
        }
        assert_pte_state_coherent(&proc);
    }

    #[test]
    fn test_swap_round_trip_preserves_contents() {
        let sys = system(2);
        let proc = process(&sys);
        let p0 = 3 * PG;
        // Dirty p0 with a marker via the real user-access path.
        crate::mem::user::store_byte(&sys, &proc, p0 + 17, 0x5A, crate::trap::FaultSource::UserAccess)
            .unwrap();
        // Force p0 out.
        crate::mem::user::store_byte(&sys, &proc, 4 * PG, 1, crate::trap::FaultSource::UserAccess)
            .unwrap();
        crate::mem::user::store_byte(&sys, &proc, 6 * PG, 1, crate::trap::FaultSource::UserAccess)
            .unwrap();
        assert_eq!(
            proc.lock().mem.page_info(p0).unwrap().state,
            PageState::Swapped
        );
        // Reading it back returns the marker byte.
        let value =
            crate::mem::user::load_byte(&sys, &proc, p0 + 17, crate::trap::FaultSource::UserAccess)
                .unwrap();
        assert_eq!(value, 0x5A);
    }

    #[test]
    fn test_clean_text_page_is_discarded_not_swapped() {
        let sys = system(1);
        let proc = process(&sys);
        let inode = sys.root_fs.lock().create_direct("/img").unwrap();
        sys.root_fs.lock().write_direct(inode, 0, &[0x42; 64]).unwrap();
        {
            let mut p = proc.lock();
            p.mem.exec_inode = Some(inode);
            let pi = p.mem.page_info_or_insert(0).unwrap();
            pi.file_off = 0;
            pi.file_len = 64;
        }
        handle_page_fault(&sys, &proc, 0, Access::Exec).unwrap();
        // The only frame is taken by clean text; a heap fault must discard
        // it without touching swap.
        handle_page_fault(&sys, &proc, 3 * PG, Access::Read).unwrap();
        assert!(sys.console.contains("EVICT   va=0x0 state=clean"));
        assert!(sys.console.contains("DISCARD va=0x0"));
        assert!(!sys.console.contains("SWAPOUT"));
        {
            let p = proc.lock();
            assert_eq!(p.mem.page_info(0).unwrap().state, PageState::Unmapped);
            assert_eq!(p.mem.swap_slots.count_set(), 0);
        }
        // A new fetch re-reads the executable.
        handle_page_fault(&sys, &proc, 0, Access::Exec).unwrap();
        assert_eq!(sys.console.count_matching("LOADEXEC va=0x0"), 2);
    }

    #[test]
    fn test_memfull_kills_when_nothing_evictable() {
        let sys = system(1);
        let proc = process(&sys);
        // Another owner holds the only frame; this process has nothing
        // resident to evict.
        sys.phys.lock().alloc_frame().unwrap();
        assert_eq!(
            handle_page_fault(&sys, &proc, 3 * PG, Access::Read),
            Err(FaultError::MemFull)
        );
        assert!(sys.console.contains("MEMFULL"));
        assert!(proc.lock().killed);
    }

    #[test]
    fn test_swap_exhaustion_kills() {
        let sys = system(1);
        let proc = process(&sys);
        {
            let mut p = proc.lock();
            while p.mem.swap_slots.alloc().is_some() {}
        }
        // Dirty resident page, no free frame, no free slot: the eviction
        // needed by the next fault cannot complete.
        handle_page_fault(&sys, &proc, 3 * PG, Access::Write).unwrap();
        assert_eq!(
            handle_page_fault(&sys, &proc, 4 * PG, Access::Read),
            Err(FaultError::SwapExhausted)
        );
        assert!(sys.console.contains("KILL    swap-exhausted"));
        assert!(proc.lock().killed);
    }

    #[test]
    fn test_eviction_follows_residency_order() {
        // FIFO determinism: pages leave in the order they became resident,
        // skipping pages that are currently swapped.
        let sys = system(3);
        let proc = process(&sys);
        let vas = [3 * PG, 4 * PG, 6 * PG, 7 * PG, 8 * PG];
        for &va in &vas[..3] {
            handle_page_fault(&sys, &proc, va, Access::Write).unwrap();
        }
        for &va in &vas[3..] {
            handle_page_fault(&sys, &proc, va, Access::Write).unwrap();
        }
        let lines = sys.console.lines();
        let victims: alloc::vec::Vec<&str> = lines
            .iter()
            .filter(|l| l.contains("VICTIM"))
            .map(|l| l.as_str())
            .collect();
        assert_eq!(victims.len(), 2);
        assert!(victims[0].contains("va=0x3000 seq=0"));
        assert!(victims[1].contains("va=0x4000 seq=1"));
    }
}
