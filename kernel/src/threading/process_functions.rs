//! Process lifecycle: fork, exit and the teardown shared with kills.

use crate::mem::pages::{MemoryRecord, PageState};
use crate::paging::PagePerm;
use crate::swapping::swap_file_path;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::process::Pid;
use crate::threading::thread_control_block::{
    ProcessControlBlock, ThreadControlBlock, ThreadStatus,
};
use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec;
use marrow_shared::mem::PAGE_FRAME_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkError {
    /// Not enough frames to copy the parent's resident pages. Fork does not
    /// evict on the child's behalf; the caller sees -1.
    NoMemory,
    Io,
}

impl core::fmt::Display for ForkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoMemory => write!(f, "out of physical memory"),
            Self::Io => write!(f, "swap file I/O failed"),
        }
    }
}

impl core::error::Error for ForkError {}

/// Copy the parent's address space page by page: resident pages frame to
/// frame, swapped pages slot to slot into the child's own swap file,
/// unmapped exec-backed pages as metadata only. FIFO stamps carry over
/// unchanged so the child's eviction order matches what its pages inherit.
fn clone_memory(
    sys: &SystemState,
    parent: &MemoryRecord,
    child_pid: Pid,
) -> Result<MemoryRecord, ForkError> {
    let mut child = MemoryRecord::new();
    child.layout = parent.layout;
    child.sz = parent.sz;
    child.next_fifo_seq = parent.next_fifo_seq;
    child.exec_inode = parent.exec_inode;
    child.pages = parent.pages.clone();

    let mut failed = None;
    for pi in &mut child.pages {
        match pi.state {
            PageState::Unmapped => {}
            PageState::Resident => {
                let Some(entry) = parent.page_table.entry(pi.va) else {
                    failed = Some(ForkError::Io);
                    break;
                };
                let frame = {
                    let mut phys = sys.phys.lock();
                    match phys.alloc_frame() {
                        Some(frame) => {
                            let bytes = phys.frame(entry.frame() as usize).to_vec();
                            phys.frame_mut(frame).copy_from_slice(&bytes);
                            frame
                        }
                        None => {
                            failed = Some(ForkError::NoMemory);
                            break;
                        }
                    }
                };
                let perm = PagePerm {
                    write: entry.write(),
                    execute: entry.execute(),
                };
                if child.page_table.map(pi.va, frame, perm).is_err() {
                    sys.phys.lock().free_frame(frame);
                    failed = Some(ForkError::Io);
                    break;
                }
            }
            PageState::Swapped => {
                let (Some(parent_inode), Some(parent_slot)) = (parent.swap_inode, pi.swap_slot)
                else {
                    failed = Some(ForkError::Io);
                    break;
                };
                let child_inode = match child.swap_inode {
                    Some(inode) => inode,
                    None => {
                        match sys
                            .root_fs
                            .lock()
                            .create_direct(&swap_file_path(child_pid))
                        {
                            Ok(inode) => {
                                child.swap_inode = Some(inode);
                                inode
                            }
                            Err(_) => {
                                failed = Some(ForkError::Io);
                                break;
                            }
                        }
                    }
                };
                let mut buf = vec![0u8; PAGE_FRAME_SIZE];
                let mut fs = sys.root_fs.lock();
                if fs
                    .read_direct(
                        parent_inode,
                        (parent_slot * PAGE_FRAME_SIZE) as u64,
                        &mut buf,
                    )
                    .is_err()
                {
                    failed = Some(ForkError::Io);
                    break;
                }
                let Some(child_slot) = child.swap_slots.alloc() else {
                    failed = Some(ForkError::Io);
                    break;
                };
                if fs
                    .write_direct(child_inode, (child_slot * PAGE_FRAME_SIZE) as u64, &buf)
                    .is_err()
                {
                    failed = Some(ForkError::Io);
                    break;
                }
                pi.swap_slot = Some(child_slot);
                child.num_swapped_pages += 1;
            }
        }
    }

    if let Some(err) = failed {
        let mut phys = sys.phys.lock();
        child.release(&mut phys);
        drop(phys);
        if child.swap_inode.is_some() {
            let _ = sys.root_fs.lock().unlink(&swap_file_path(child_pid));
        }
        return Err(err);
    }
    Ok(child)
}

/// Create a child of the calling process. The child resumes at the same
/// instruction index with a result register of 0, inherits the parent's
/// vruntime (preventing newborn dominance under the fair policy) and gets
/// the current tick as its creation time.
pub fn fork(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    parent_tcb: &ThreadControlBlock,
) -> Result<Pid, ForkError> {
    let child_pid = sys.process.allocate_pid();

    let (parent_pid, name, child_mem) = {
        let p = proc.lock();
        let child_mem = clone_memory(sys, &p.mem, child_pid)?;
        (p.pid, p.name.clone(), child_mem)
    };

    let mut child = ProcessControlBlock::new(child_pid, parent_pid);
    child.name = name;
    child.mem = child_mem;
    sys.process.table.add(child);
    proc.lock().children.push(child_pid);

    let tid = sys.process.allocate_tid();
    let mut tcb = Box::new(ThreadControlBlock::new(
        tid,
        child_pid,
        parent_tcb.program.clone(),
        parent_tcb.entry,
        sys.ticks(),
    ));
    tcb.ip = parent_tcb.ip;
    tcb.last_ret = 0;
    tcb.nice = parent_tcb.nice;
    tcb.vruntime = parent_tcb.vruntime;
    sys.scheduler.lock().push(tcb);

    Ok(child_pid)
}

/// Tear a process down: free its address space, drop its swap file and
/// descriptors, record the exit code and wake a parent blocked in wait.
/// Kills funnel through here with code -1.
pub fn exit_process(sys: &SystemState, proc: &Arc<Mutex<ProcessControlBlock>>, code: i32) {
    let (pid, ppid, had_swap, freed_slots, children) = {
        let mut p = proc.lock();
        let freed_slots = {
            let mut phys = sys.phys.lock();
            p.mem.release(&mut phys)
        };
        let had_swap = p.mem.swap_inode.take().is_some();
        p.exit_code = Some(code);
        (p.pid, p.ppid, had_swap, freed_slots, p.children.clone())
    };

    if had_swap {
        sys.console
            .log(format!("[pid {pid}] SWAPCLEANUP freed_slots={freed_slots}"));
        let _ = sys.root_fs.lock().unlink(&swap_file_path(pid));
    }
    sys.root_fs.lock().close_all(pid);

    // Zombie children have no one left to wait for them.
    for child in children {
        if let Some(cp) = sys.process.table.get(child) {
            if cp.lock().exit_code.is_some() {
                sys.process.table.remove(child);
            }
        }
    }

    sys.process.exit_order.lock().push(pid);

    let waiting_parent = sys.blocked.lock().take_waiting_parent(ppid);
    if let Some(mut parent) = waiting_parent {
        parent.status = ThreadStatus::Ready;
        sys.scheduler.lock().push(parent);
    }
}
