//! Trap glue: routes page faults to the fault handler and timer ticks to
//! the scheduler's accounting hook. All other kernel entries (syscalls) go
//! through `user_program::syscall` unchanged.

use crate::mem::demand_paging::{self, FaultError};
use crate::paging::Access;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::{self, thread_control_block::ProcessControlBlock, thread_control_block::ThreadControlBlock};
use alloc::format;
use alloc::sync::Arc;

/// Who took the fault. Trap-path faults on an illegal address kill the
/// process; syscall-path faults surface an error to the caller instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultSource {
    UserAccess,
    Syscall,
}

/// Page-fault leg of the trap entry.
pub fn page_fault(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    va: usize,
    access: Access,
    source: FaultSource,
) -> Result<(), FaultError> {
    match demand_paging::handle_page_fault(sys, proc, va, access) {
        Ok(()) => Ok(()),
        Err(FaultError::Invalid) => {
            if source == FaultSource::UserAccess {
                let mut p = proc.lock();
                sys.console.log(format!(
                    "[pid {}] KILL    invalid-access va={va:#x} access={}",
                    p.pid,
                    access.as_str()
                ));
                p.killed = true;
            }
            Err(FaultError::Invalid)
        }
        // Resource exhaustion already marked the process killed and logged
        // its reason at the point of failure.
        Err(e) => Err(e),
    }
}

/// Timer leg of the trap entry: advance the clock, wake due sleepers, and
/// run the active policy's accounting hook for the running thread. Returns
/// true when the policy wants the running thread preempted.
pub fn timer_tick(sys: &SystemState, running: &mut ThreadControlBlock) -> bool {
    {
        let mut ticks = sys.ticks.lock();
        *ticks += 1;
    }
    threading::wake_sleepers(sys);
    sys.scheduler.lock().on_tick(running)
}
