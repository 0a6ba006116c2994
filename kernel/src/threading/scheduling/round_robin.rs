use super::scheduler::Scheduler;
use crate::threading::process::Tid;
use crate::threading::thread_control_block::ThreadControlBlock;
use alloc::boxed::Box;
use alloc::collections::VecDeque;

/// Classic round-robin: a FIFO ready queue and a yield on every tick.
pub struct RoundRobinScheduler {
    ready_queue: VecDeque<Box<ThreadControlBlock>>,
}

impl RoundRobinScheduler {
    pub fn new() -> RoundRobinScheduler {
        RoundRobinScheduler {
            ready_queue: VecDeque::new(),
        }
    }
}

impl Default for RoundRobinScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for RoundRobinScheduler {
    fn push(&mut self, thread: Box<ThreadControlBlock>) {
        self.ready_queue.push_back(thread);
    }

    fn pop(&mut self) -> Option<Box<ThreadControlBlock>> {
        self.ready_queue.pop_front()
    }

    fn remove(&mut self, tid: Tid) -> Option<Box<ThreadControlBlock>> {
        let pos = self.ready_queue.iter().position(|tcb| tcb.tid == tid)?;
        self.ready_queue.remove(pos)
    }

    fn on_tick(&mut self, _running: &mut ThreadControlBlock) -> bool {
        true
    }

    fn runnable(&self) -> usize {
        self.ready_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user_program::Program;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    fn tcb(tid: Tid) -> Box<ThreadControlBlock> {
        let program = Arc::new(Program { ops: Vec::new() });
        Box::new(ThreadControlBlock::new(tid, tid, program, 0, 0))
    }

    #[test]
    fn test_fifo_order() {
        let mut s = RoundRobinScheduler::new();
        s.push(tcb(1));
        s.push(tcb(2));
        s.push(tcb(3));
        assert_eq!(s.pop().unwrap().tid, 1);
        assert_eq!(s.pop().unwrap().tid, 2);
        assert_eq!(s.pop().unwrap().tid, 3);
        assert!(s.pop().is_none());
    }

    #[test]
    fn test_always_preempts() {
        let mut s = RoundRobinScheduler::new();
        let mut running = tcb(1);
        assert!(s.on_tick(&mut running));
    }

    #[test]
    fn test_remove_by_tid() {
        let mut s = RoundRobinScheduler::new();
        s.push(tcb(1));
        s.push(tcb(2));
        assert!(s.remove(5).is_none());
        assert_eq!(s.remove(1).unwrap().tid, 1);
        assert_eq!(s.runnable(), 1);
    }
}
