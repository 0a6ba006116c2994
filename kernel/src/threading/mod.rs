//! The dispatcher.
//!
//! Each CPU's dispatcher loop pops a RUNNABLE thread from the scheduler and
//! executes its instruction stream. Every executed instruction advances the
//! global clock by one tick and runs the active policy's accounting hook;
//! the hook's verdict decides whether the thread is preempted. Page faults
//! taken by the instruction's memory accesses resolve synchronously through
//! the trap path before the instruction completes.

pub mod process;
pub mod process_functions;
pub mod scheduling;
pub mod sleep;
pub mod thread_control_block;

use crate::mem::user;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::sleep::BlockReason;
use crate::threading::thread_control_block::{
    ProcessControlBlock, ThreadControlBlock, ThreadStatus,
};
use crate::trap::{self, FaultSource};
use crate::user_program::{syscall, UserOp};
use alloc::boxed::Box;
use alloc::sync::Arc;

/// What happened while executing one instruction.
pub enum StepEvent {
    Continue,
    /// The thread voluntarily gave up the CPU but stays RUNNABLE.
    Yielded,
    Blocked(BlockReason),
    Exited(i32),
    /// The instruction killed the process (illegal access or resource
    /// exhaustion); the kill reason was already logged.
    Fatal,
}

/// Run until no thread is runnable and none can ever wake again.
pub fn run(sys: &SystemState) {
    loop {
        let next = sys.scheduler.lock().pop();
        let Some(mut tcb) = next else {
            if !idle_until_wake(sys) {
                break;
            }
            continue;
        };
        tcb.status = ThreadStatus::Running;
        run_thread(sys, tcb);
    }
}

fn run_thread(sys: &SystemState, mut tcb: Box<ThreadControlBlock>) {
    let Some(proc) = sys.process.table.get(tcb.pid) else {
        return;
    };
    if proc.lock().killed {
        tcb.status = ThreadStatus::Dying;
        process_functions::exit_process(sys, &proc, -1);
        return;
    }
    loop {
        let event = step(sys, &proc, &mut tcb);
        // The timer fires once per executed instruction.
        let preempt = trap::timer_tick(sys, &mut tcb);
        match event {
            StepEvent::Exited(code) => {
                tcb.status = ThreadStatus::Dying;
                process_functions::exit_process(sys, &proc, code);
                return;
            }
            StepEvent::Fatal => {
                tcb.status = ThreadStatus::Dying;
                process_functions::exit_process(sys, &proc, -1);
                return;
            }
            StepEvent::Blocked(reason) => {
                tcb.status = ThreadStatus::Blocked;
                sys.blocked.lock().park(tcb, reason);
                return;
            }
            StepEvent::Yielded => {
                tcb.status = ThreadStatus::Ready;
                sys.scheduler.lock().push(tcb);
                return;
            }
            StepEvent::Continue => {
                if proc.lock().killed {
                    tcb.status = ThreadStatus::Dying;
                    process_functions::exit_process(sys, &proc, -1);
                    return;
                }
                if preempt {
                    tcb.status = ThreadStatus::Ready;
                    sys.scheduler.lock().push(tcb);
                    return;
                }
            }
        }
    }
}

/// Execute one instruction: fetch at `entry + 4 * ip`, then interpret.
/// Running past the end of the stream is an implicit exit(0).
fn step(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    tcb: &mut ThreadControlBlock,
) -> StepEvent {
    let Some(op) = tcb.program.ops.get(tcb.ip).cloned() else {
        return StepEvent::Exited(0);
    };
    let pc = tcb.entry + 4 * tcb.ip;
    if user::fetch_instruction(sys, proc, pc).is_err() {
        return StepEvent::Fatal;
    }
    tcb.ip += 1;
    match op {
        UserOp::Nop => StepEvent::Continue,
        UserOp::Load(va) => match user::load_byte(sys, proc, va, FaultSource::UserAccess) {
            Ok(value) => {
                tcb.last_ret = value as isize;
                StepEvent::Continue
            }
            Err(_) => StepEvent::Fatal,
        },
        UserOp::Store(va, value) => {
            match user::store_byte(sys, proc, va, value, FaultSource::UserAccess) {
                Ok(()) => StepEvent::Continue,
                Err(_) => StepEvent::Fatal,
            }
        }
        UserOp::Xori(imm) => {
            tcb.last_ret ^= imm;
            StepEvent::Continue
        }
        UserOp::Jump(target) => {
            tcb.ip = target;
            StepEvent::Continue
        }
        UserOp::JumpIfZero(target) => {
            if tcb.last_ret == 0 {
                tcb.ip = target;
            }
            StepEvent::Continue
        }
        UserOp::Syscall(call) => syscall::handler(sys, proc, tcb, call),
    }
}

/// Move every sleeper whose tick has arrived back into the scheduler.
pub fn wake_sleepers(sys: &SystemState) {
    let now = sys.ticks();
    let due = sys.blocked.lock().take_due(now);
    for mut tcb in due {
        tcb.status = ThreadStatus::Ready;
        sys.scheduler.lock().push(tcb);
    }
}

/// With nothing runnable, jump the clock forward to the next sleeper's wake
/// tick. Returns false when no sleeper exists (the machine is done, or
/// only unwakeable waiters remain).
fn idle_until_wake(sys: &SystemState) -> bool {
    let Some(wake) = sys.blocked.lock().next_wake_tick() else {
        return false;
    };
    {
        let mut ticks = sys.ticks.lock();
        if *ticks < wake {
            *ticks = wake;
        }
    }
    wake_sleepers(sys);
    true
}
