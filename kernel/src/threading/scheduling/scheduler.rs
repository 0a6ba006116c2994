use crate::threading::process::Tid;
use crate::threading::thread_control_block::ThreadControlBlock;
use alloc::boxed::Box;

/// A scheduling policy. The dispatcher owns the running thread; everything
/// RUNNABLE lives inside the policy between dispatches.
pub trait Scheduler: Send {
    /// Add a thread to the ready set.
    fn push(&mut self, thread: Box<ThreadControlBlock>);

    /// Select and remove the next thread to run, or `None` when the ready
    /// set is empty. Policies that compute a time slice store it in the
    /// thread's `slice_remaining` here.
    fn pop(&mut self) -> Option<Box<ThreadControlBlock>>;

    /// Remove a specific thread from the ready set.
    fn remove(&mut self, tid: Tid) -> Option<Box<ThreadControlBlock>>;

    /// Per-tick accounting for the running thread. Returns true when the
    /// policy wants it preempted.
    fn on_tick(&mut self, running: &mut ThreadControlBlock) -> bool;

    /// Number of threads currently ready.
    fn runnable(&self) -> usize;
}
