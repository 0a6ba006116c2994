use super::scheduler::Scheduler;
use crate::log::Console;
use crate::threading::process::Tid;
use crate::threading::thread_control_block::ThreadControlBlock;
use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;

pub const NICE_0_WEIGHT: u64 = 1024;
/// Scheduling period, in ticks, shared across the ready set.
pub const TARGET_LATENCY: u64 = 48;
/// No slice goes below this many ticks before weighting.
pub const MIN_SLICE: u64 = 3;

/// `round(1024 / 1.25^nice)` for nice in [-20, 19].
const NICE_TO_WEIGHT: [u64; 40] = [
    88818, 71054, 56843, 45475, 36380, 29104, 23283, 18626, 14901, 11921, // -20..-11
    9537, 7629, 6104, 4883, 3906, 3125, 2500, 2000, 1600, 1280, // -10..-1
    1024, 819, 655, 524, 419, 336, 268, 215, 172, 137, // 0..9
    110, 88, 70, 56, 45, 36, 29, 23, 18, 15, // 10..19
];

pub fn weight_of(nice: i32) -> u64 {
    NICE_TO_WEIGHT[(nice.clamp(-20, 19) + 20) as usize]
}

fn timeslice(weight: u64, runnable: u64) -> u64 {
    let base = TARGET_LATENCY / runnable.max(1);
    base.max(MIN_SLICE) * weight / NICE_0_WEIGHT
}

/// Simplified fair scheduler driven by virtual runtime.
///
/// Each tick of RUNNING time advances the thread's vruntime by
/// `NICE_0_WEIGHT / weight(nice)` (integer division, wrapping). Selection
/// picks the smallest vruntime, pid breaking ties; each dispatch logs a
/// snapshot of the candidates and the decision.
pub struct FairScheduler {
    ready: Vec<Box<ThreadControlBlock>>,
    console: Arc<Console>,
}

impl FairScheduler {
    pub fn new(console: Arc<Console>) -> FairScheduler {
        FairScheduler {
            ready: Vec::new(),
            console,
        }
    }
}

impl Scheduler for FairScheduler {
    fn push(&mut self, thread: Box<ThreadControlBlock>) {
        self.ready.push(thread);
    }

    fn pop(&mut self) -> Option<Box<ThreadControlBlock>> {
        if self.ready.is_empty() {
            return None;
        }
        let n = self.ready.len() as u64;
        self.console.log("[Scheduler Tick]".into());
        for t in &self.ready {
            let weight = weight_of(t.nice);
            self.console.log(format!(
                "PID: {} | vRuntime: {} | Weight: {} | TimeSlice: {}",
                t.pid,
                t.vruntime,
                weight,
                timeslice(weight, n)
            ));
        }
        let best = self
            .ready
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.vruntime, t.pid))?
            .0;
        let mut chosen = self.ready.swap_remove(best);
        chosen.slice_remaining = timeslice(weight_of(chosen.nice), n);
        self.console.log(format!(
            "--> Scheduling PID {} (lowest vRuntime: {})",
            chosen.pid, chosen.vruntime
        ));
        Some(chosen)
    }

    fn remove(&mut self, tid: Tid) -> Option<Box<ThreadControlBlock>> {
        let pos = self.ready.iter().position(|tcb| tcb.tid == tid)?;
        Some(self.ready.swap_remove(pos))
    }

    fn on_tick(&mut self, running: &mut ThreadControlBlock) -> bool {
        running.vruntime = running
            .vruntime
            .wrapping_add(NICE_0_WEIGHT / weight_of(running.nice));
        running.slice_remaining = running.slice_remaining.saturating_sub(1);
        running.slice_remaining == 0
    }

    fn runnable(&self) -> usize {
        self.ready.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_program::Program;

    fn tcb(pid: Tid, vruntime: u64, nice: i32) -> Box<ThreadControlBlock> {
        let program = Arc::new(Program { ops: Vec::new() });
        let mut t = Box::new(ThreadControlBlock::new(pid, pid, program, 0, 0));
        t.vruntime = vruntime;
        t.nice = nice;
        t
    }

    #[test]
    fn test_weight_table_endpoints() {
        assert_eq!(weight_of(0), 1024);
        assert_eq!(weight_of(-20), 88818);
        assert_eq!(weight_of(19), 15);
        assert_eq!(weight_of(1), 819);
        assert_eq!(weight_of(-1), 1280);
        // Out-of-range nice values clamp.
        assert_eq!(weight_of(-100), 88818);
        assert_eq!(weight_of(100), 15);
    }

    #[test]
    fn test_selects_lowest_vruntime() {
        let console = Arc::new(Console::new());
        let mut s = FairScheduler::new(console.clone());
        s.push(tcb(4, 300, 0));
        s.push(tcb(5, 100, 0));
        s.push(tcb(6, 200, 0));
        assert_eq!(s.pop().unwrap().pid, 5);
        assert!(console.contains("--> Scheduling PID 5 (lowest vRuntime: 100)"));
        assert!(console.contains("[Scheduler Tick]"));
        assert!(console.contains("PID: 4 | vRuntime: 300 | Weight: 1024 | TimeSlice: 16"));
    }

    #[test]
    fn test_vruntime_ties_break_by_pid() {
        let console = Arc::new(Console::new());
        let mut s = FairScheduler::new(console);
        s.push(tcb(9, 50, 0));
        s.push(tcb(2, 50, 0));
        assert_eq!(s.pop().unwrap().pid, 2);
    }

    #[test]
    fn test_tick_accounting_scales_with_weight() {
        let console = Arc::new(Console::new());
        let mut s = FairScheduler::new(console);
        let mut nice0 = tcb(1, 0, 0);
        let mut nice5 = tcb(2, 0, 5);
        s.on_tick(&mut nice0);
        s.on_tick(&mut nice5);
        assert_eq!(nice0.vruntime, 1); // 1024 / 1024
        assert_eq!(nice5.vruntime, 3); // 1024 / 336
    }

    #[test]
    fn test_vruntime_wraps() {
        let console = Arc::new(Console::new());
        let mut s = FairScheduler::new(console);
        let mut t = tcb(1, u64::MAX, 0);
        t.slice_remaining = 10;
        s.on_tick(&mut t);
        assert_eq!(t.vruntime, 0);
    }

    #[test]
    fn test_slice_expiry_requests_preemption() {
        let console = Arc::new(Console::new());
        let mut s = FairScheduler::new(console);
        s.push(tcb(1, 0, 0));
        s.push(tcb(2, 10, 0));
        let mut running = s.pop().unwrap();
        // base = 48 / 2 = 24, weight 1024 => slice 24.
        assert_eq!(running.slice_remaining, 24);
        for _ in 0..23 {
            assert!(!s.on_tick(&mut running));
        }
        assert!(s.on_tick(&mut running));
    }

    #[test]
    fn test_min_slice_floor() {
        // With many runnable threads the base latency share drops below
        // MIN_SLICE and is clamped to it.
        assert_eq!(timeslice(NICE_0_WEIGHT, 48), MIN_SLICE);
        assert_eq!(timeslice(NICE_0_WEIGHT, 1), TARGET_LATENCY);
    }
}
