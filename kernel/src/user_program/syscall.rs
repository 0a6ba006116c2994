//! Syscall dispatch.
//!
//! The return value lands in the calling thread's result register. Blocking
//! calls return a `StepEvent` that parks the thread instead.

use crate::fs::{Mode, ProcessFileDescriptor};
use crate::mem::{stats, user};
use crate::paging::PagePerm;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::process_functions;
use crate::threading::sleep::BlockReason;
use crate::threading::thread_control_block::{ProcessControlBlock, ThreadControlBlock};
use crate::threading::StepEvent;
use crate::trap::FaultSource;
use crate::user_program::Syscall;
use crate::vfs;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use marrow_shared::mem::{pg_round_up, PAGE_FRAME_SIZE, USER_VA_LIMIT};
use marrow_syscalls::{EBADF, EEXIST, EFAULT, EMFILE, ENOENT, ENOSPC, SBRK_EAGER};
use zerocopy::AsBytes;

fn errno(e: vfs::Error) -> isize {
    match e {
        vfs::Error::NotFound => -ENOENT,
        vfs::Error::NoSpace => -ENOSPC,
        vfs::Error::Exists => -EEXIST,
        vfs::Error::BadFileDescriptor => -EBADF,
        vfs::Error::TooManyOpenFiles => -EMFILE,
    }
}

/// This function is responsible for processing syscalls made by user
/// programs. It might not return an event that continues the thread, such
/// as when the syscall is exit or a blocking wait.
pub fn handler(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    tcb: &mut ThreadControlBlock,
    call: Syscall,
) -> StepEvent {
    match call {
        Syscall::Exit(code) => StepEvent::Exited(code),
        Syscall::Fork => {
            tcb.last_ret = match process_functions::fork(sys, proc, tcb) {
                Ok(pid) => pid as isize,
                Err(_) => -1,
            };
            StepEvent::Continue
        }
        Syscall::Wait => sys_wait(sys, proc, tcb),
        Syscall::GetPid => {
            tcb.last_ret = tcb.pid as isize;
            StepEvent::Continue
        }
        Syscall::Sbrk { increment, mode } => {
            tcb.last_ret = sys_sbrk(sys, proc, increment, mode);
            StepEvent::Continue
        }
        Syscall::Pause(n) => {
            tcb.last_ret = 0;
            let wake_tick = sys.ticks() + n;
            StepEvent::Blocked(BlockReason::Sleep { wake_tick })
        }
        Syscall::Yield => {
            tcb.last_ret = 0;
            StepEvent::Yielded
        }
        Syscall::SetNice(n) => {
            tcb.nice = n.clamp(-20, 19);
            tcb.last_ret = 0;
            StepEvent::Continue
        }
        Syscall::Kill(pid) => {
            tcb.last_ret = match sys.process.table.get(pid) {
                Some(target) => {
                    target.lock().killed = true;
                    0
                }
                None => -1,
            };
            StepEvent::Continue
        }
        Syscall::Open { path, create } => {
            let mode = if create {
                Mode::CreateReadWrite
            } else {
                Mode::ReadWrite
            };
            tcb.last_ret = match sys.root_fs.lock().open(&path, tcb.pid, mode) {
                Ok(fd) => fd as isize,
                Err(e) => errno(e),
            };
            StepEvent::Continue
        }
        Syscall::Close(fd) => {
            let pfd = ProcessFileDescriptor { pid: tcb.pid, fd };
            tcb.last_ret = match sys.root_fs.lock().close(pfd) {
                Ok(()) => 0,
                Err(e) => errno(e),
            };
            StepEvent::Continue
        }
        Syscall::Read { fd, va, len } => {
            tcb.last_ret = sys_read(sys, proc, tcb.pid, fd, va, len);
            StepEvent::Continue
        }
        Syscall::Write { fd, data } => {
            let pfd = ProcessFileDescriptor { pid: tcb.pid, fd };
            tcb.last_ret = match sys.root_fs.lock().write(pfd, &data) {
                Ok(n) => n as isize,
                Err(e) => errno(e),
            };
            StepEvent::Continue
        }
        Syscall::Unlink(path) => {
            tcb.last_ret = match sys.root_fs.lock().unlink(&path) {
                Ok(()) => 0,
                Err(e) => errno(e),
            };
            StepEvent::Continue
        }
        Syscall::Uptime => {
            tcb.last_ret = sys.ticks() as isize;
            StepEvent::Continue
        }
        Syscall::GetReadCount => {
            tcb.last_ret = sys.total_read_bytes.load(Ordering::SeqCst) as isize;
            StepEvent::Continue
        }
        Syscall::MemStat { va } => {
            let info = {
                let p = proc.lock();
                stats::snapshot(&p.mem, p.pid)
            };
            tcb.last_ret =
                match user::copy_to_user(sys, proc, va, info.as_bytes(), FaultSource::Syscall) {
                    Ok(()) => 0,
                    Err(_) => -1,
                };
            StepEvent::Continue
        }
    }
}

/// Wraparound counter of successful read() byte counts. Incremented only
/// after the data has landed in user memory.
fn sys_read(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    pid: u16,
    fd: usize,
    va: usize,
    len: usize,
) -> isize {
    let mut buf = vec![0u8; len];
    let pfd = ProcessFileDescriptor { pid, fd };
    let n = match sys.root_fs.lock().read(pfd, &mut buf) {
        Ok(n) => n,
        Err(e) => return errno(e),
    };
    if n > 0 {
        if user::copy_to_user(sys, proc, va, &buf[..n], FaultSource::Syscall).is_err() {
            return -EFAULT;
        }
        sys.total_read_bytes.fetch_add(n as u32, Ordering::SeqCst);
    }
    n as isize
}

fn sys_wait(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    tcb: &mut ThreadControlBlock,
) -> StepEvent {
    let mut p = proc.lock();
    if p.children.is_empty() {
        tcb.last_ret = -1;
        return StepEvent::Continue;
    }
    let zombie = p.children.iter().copied().find(|&c| {
        sys.process
            .table
            .get(c)
            .map(|cp| cp.lock().exit_code.is_some())
            .unwrap_or(false)
    });
    match zombie {
        Some(child) => {
            sys.process.table.remove(child);
            p.children.retain(|&c| c != child);
            tcb.last_ret = child as isize;
            StepEvent::Continue
        }
        None => {
            // Re-execute the wait once a child exit wakes us.
            tcb.ip -= 1;
            StepEvent::Blocked(BlockReason::WaitChild)
        }
    }
}

/// `sbrk(n, mode)`. Lazy growth moves `sz` only and lets the fault handler
/// back the new pages; eager growth allocates and maps immediately, the
/// classical way. Negative increments always shrink eagerly.
fn sys_sbrk(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    increment: isize,
    mode: u32,
) -> isize {
    let mut p = proc.lock();
    let old = p.mem.sz;
    if increment == 0 {
        return old as isize;
    }

    if increment < 0 {
        let dec = increment.unsigned_abs();
        if dec > old {
            return -1;
        }
        let new_sz = old - dec;
        // The program image and stack never shrink away.
        if new_sz < p.mem.layout.stack_top {
            return -1;
        }
        for va in (pg_round_up(new_sz)..pg_round_up(old)).step_by(PAGE_FRAME_SIZE) {
            let Some(pi) = p.mem.page_info(va) else {
                continue;
            };
            let (state, slot) = (pi.state, pi.swap_slot);
            match state {
                crate::mem::pages::PageState::Resident => {
                    if let Some(frame) = p.mem.page_table.unmap(va) {
                        sys.phys.lock().free_frame(frame);
                    }
                }
                crate::mem::pages::PageState::Swapped => {
                    if let Some(slot) = slot {
                        p.mem.swap_slots.free(slot);
                    }
                    if p.mem.num_swapped_pages > 0 {
                        p.mem.num_swapped_pages -= 1;
                    }
                }
                crate::mem::pages::PageState::Unmapped => {}
            }
            p.mem.remove_page_info(va);
        }
        p.mem.sz = new_sz;
        return old as isize;
    }

    let inc = increment as usize;
    let Some(new_sz) = old.checked_add(inc) else {
        return -1;
    };
    if new_sz > USER_VA_LIMIT {
        return -1;
    }
    if mode == SBRK_EAGER {
        let mut added: Vec<usize> = Vec::new();
        for va in (pg_round_up(old)..pg_round_up(new_sz)).step_by(PAGE_FRAME_SIZE) {
            if p.mem.page_table.is_mapped(va) {
                continue;
            }
            let frame = {
                let mut phys = sys.phys.lock();
                match phys.alloc_frame() {
                    Some(frame) => {
                        phys.zero_frame(frame);
                        frame
                    }
                    None => {
                        drop(phys);
                        rollback_eager(sys, &mut p, &added);
                        return -1;
                    }
                }
            };
            if p.mem
                .page_table
                .map(va, frame, PagePerm { write: true, execute: false })
                .is_err()
            {
                sys.phys.lock().free_frame(frame);
                rollback_eager(sys, &mut p, &added);
                return -1;
            }
            if p.mem.page_info_or_insert(va).is_none() {
                p.mem.page_table.unmap(va);
                sys.phys.lock().free_frame(frame);
                rollback_eager(sys, &mut p, &added);
                return -1;
            }
            let seq = p.mem.next_fifo_seq;
            p.mem.next_fifo_seq += 1;
            if let Some(pi) = p.mem.page_info_mut(va) {
                pi.state = crate::mem::pages::PageState::Resident;
                pi.seq = seq;
                // Mapped writable from birth, so writes never fault: account
                // it dirty up front.
                pi.dirty = true;
            }
            added.push(va);
        }
    }
    p.mem.sz = new_sz;
    old as isize
}

fn rollback_eager(
    sys: &SystemState,
    p: &mut crate::sync::MutexGuard<'_, ProcessControlBlock>,
    added: &[usize],
) {
    for &va in added {
        if let Some(frame) = p.mem.page_table.unmap(va) {
            sys.phys.lock().free_frame(frame);
        }
        p.mem.remove_page_info(va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::pages::{MemoryLayout, PageState};
    use crate::system::SystemParams;
    use crate::user_program::Program;
    use marrow_syscalls::{ProcMemStat, SBRK_LAZY, PAGE_STATE_RESIDENT};
    use zerocopy::FromBytes;

    const PG: usize = PAGE_FRAME_SIZE;

    fn system(frames: usize) -> SystemState {
        SystemState::new(SystemParams { phys_frames: frames })
    }

    fn process(sys: &SystemState) -> (Arc<Mutex<ProcessControlBlock>>, ThreadControlBlock) {
        let pid = sys.process.allocate_pid();
        let mut pcb = ProcessControlBlock::new(pid, 0);
        pcb.mem.layout = MemoryLayout {
            text_start: 0,
            text_end: PG,
            data_start: PG,
            data_end: PG,
            heap_start: PG,
            stack_top: 6 * PG,
        };
        pcb.mem.sz = 6 * PG;
        let proc = sys.process.table.add(pcb);
        let tcb = ThreadControlBlock::new(
            sys.process.allocate_tid(),
            pid,
            Arc::new(Program::new(alloc::vec::Vec::new())),
            0,
            0,
        );
        (proc, tcb)
    }

    #[test]
    fn test_sbrk_lazy_moves_sz_only() {
        let sys = system(8);
        let (proc, _) = process(&sys);
        let frames_before = sys.phys.lock().free_frames();
        let old = sys_sbrk(&sys, &proc, 2 * PG as isize, SBRK_LAZY);
        assert_eq!(old, 6 * PG as isize);
        let p = proc.lock();
        assert_eq!(p.mem.sz, 8 * PG);
        assert_eq!(sys.phys.lock().free_frames(), frames_before);
        assert!(!p.mem.page_table.is_mapped(6 * PG));
    }

    #[test]
    fn test_sbrk_eager_maps_immediately() {
        let sys = system(8);
        let (proc, _) = process(&sys);
        let frames_before = sys.phys.lock().free_frames();
        sys_sbrk(&sys, &proc, 2 * PG as isize, SBRK_EAGER);
        let p = proc.lock();
        assert_eq!(p.mem.sz, 8 * PG);
        assert_eq!(sys.phys.lock().free_frames(), frames_before - 2);
        for va in [6 * PG, 7 * PG] {
            assert!(p
                .mem
                .page_table
                .translate(va, crate::paging::Access::Write)
                .is_some());
            let pi = p.mem.page_info(va).unwrap();
            assert_eq!(pi.state, PageState::Resident);
            assert!(pi.dirty);
        }
    }

    #[test]
    fn test_sbrk_eager_fails_cleanly_without_memory() {
        let sys = system(1);
        let (proc, _) = process(&sys);
        assert_eq!(sys_sbrk(&sys, &proc, 2 * PG as isize, SBRK_EAGER), -1);
        let p = proc.lock();
        assert_eq!(p.mem.sz, 6 * PG);
        assert_eq!(sys.phys.lock().free_frames(), 1);
        assert!(p.mem.pages.is_empty());
    }

    #[test]
    fn test_sbrk_negative_shrinks_eagerly() {
        let sys = system(8);
        let (proc, _) = process(&sys);
        sys_sbrk(&sys, &proc, 2 * PG as isize, SBRK_EAGER);
        let old = sys_sbrk(&sys, &proc, -(2 * PG as isize), SBRK_LAZY);
        assert_eq!(old, 8 * PG as isize);
        let p = proc.lock();
        assert_eq!(p.mem.sz, 6 * PG);
        assert!(p.mem.page_info(6 * PG).is_none());
        assert!(!p.mem.page_table.is_mapped(6 * PG));
        assert_eq!(sys.phys.lock().free_frames(), 8);
    }

    #[test]
    fn test_sbrk_cannot_shrink_into_stack() {
        let sys = system(8);
        let (proc, _) = process(&sys);
        assert_eq!(sys_sbrk(&sys, &proc, -(PG as isize), SBRK_LAZY), -1);
        assert_eq!(proc.lock().mem.sz, 6 * PG);
    }

    #[test]
    fn test_read_counts_only_successful_bytes() {
        let sys = system(8);
        let (proc, mut tcb) = process(&sys);
        let inode = sys.root_fs.lock().create_direct("/data").unwrap();
        sys.root_fs.lock().write_direct(inode, 0, &[7u8; 100]).unwrap();

        let event = handler(
            &sys,
            &proc,
            &mut tcb,
            Syscall::Open { path: "/data".into(), create: false },
        );
        assert!(matches!(event, StepEvent::Continue));
        let fd = tcb.last_ret as usize;

        // Destination is lazily grown heap; the copy-out faults it in.
        let heap = 2 * PG;
        handler(&sys, &proc, &mut tcb, Syscall::Read { fd, va: heap, len: 100 });
        assert_eq!(tcb.last_ret, 100);
        assert_eq!(sys.read_count(), 100);

        // EOF read returns 0 and does not move the counter.
        handler(&sys, &proc, &mut tcb, Syscall::Read { fd, va: heap, len: 100 });
        assert_eq!(tcb.last_ret, 0);
        assert_eq!(sys.read_count(), 100);

        // A failing read does not move the counter either.
        handler(&sys, &proc, &mut tcb, Syscall::Read { fd: 99, va: heap, len: 1 });
        assert_eq!(tcb.last_ret, -EBADF);
        assert_eq!(sys.read_count(), 100);
    }

    #[test]
    fn test_memstat_writes_snapshot_to_user_memory() {
        let sys = system(8);
        let (proc, mut tcb) = process(&sys);
        // Make one heap page resident through the fault path.
        user::store_byte(&sys, &proc, 2 * PG, 9, FaultSource::UserAccess).unwrap();

        let dst = 3 * PG;
        let event = handler(&sys, &proc, &mut tcb, Syscall::MemStat { va: dst });
        assert!(matches!(event, StepEvent::Continue));
        assert_eq!(tcb.last_ret, 0);

        let mut raw = vec![0u8; core::mem::size_of::<ProcMemStat>()];
        user::copy_from_user(&sys, &proc, dst, &mut raw, FaultSource::Syscall).unwrap();
        let info = ProcMemStat::read_from(raw.as_slice()).unwrap();
        assert_eq!(info.pid, proc.lock().pid as u32);
        assert_eq!(info.num_pages_total, 6); // ceil(sz / PGSIZE)
        // The snapshot's own destination pages were faulted in by the copy,
        // so at least the page written above plus one snapshot page are
        // resident.
        assert!(info.num_resident_pages >= 2);
        let page = info
            .pages
            .iter()
            .find(|p| p.va == (2 * PG) as u64)
            .unwrap();
        assert_eq!(page.state, PAGE_STATE_RESIDENT);
        assert_eq!(page.is_dirty, 1);
        assert_eq!(page.swap_slot, -1);
    }

    #[test]
    fn test_memstat_bad_buffer_returns_error() {
        let sys = system(8);
        let (proc, mut tcb) = process(&sys);
        handler(&sys, &proc, &mut tcb, Syscall::MemStat { va: 0x4000_0000 });
        assert_eq!(tcb.last_ret, -1);
        assert!(!proc.lock().killed);
    }

    #[test]
    fn test_wait_with_no_children() {
        let sys = system(8);
        let (proc, mut tcb) = process(&sys);
        let event = handler(&sys, &proc, &mut tcb, Syscall::Wait);
        assert!(matches!(event, StepEvent::Continue));
        assert_eq!(tcb.last_ret, -1);
    }
}
