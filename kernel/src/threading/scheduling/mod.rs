mod fair;
mod fcfs;
mod round_robin;
mod scheduler;

pub use fair::{weight_of, FairScheduler, MIN_SLICE, NICE_0_WEIGHT, TARGET_LATENCY};
pub use fcfs::FcfsScheduler;
pub use round_robin::RoundRobinScheduler;
pub use scheduler::Scheduler;

use crate::log::Console;
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Build the policy selected at compile time. Exactly one policy is active
/// in a built kernel; when several features are enabled FCFS wins over CFS
/// wins over round-robin.
#[allow(unused_variables, unreachable_code)]
pub fn initialize_scheduler(console: Arc<Console>) -> Box<dyn Scheduler> {
    #[cfg(feature = "sched-fcfs")]
    {
        return Box::new(FcfsScheduler::new());
    }
    #[cfg(all(feature = "sched-cfs", not(feature = "sched-fcfs")))]
    {
        return Box::new(FairScheduler::new(console));
    }
    Box::new(RoundRobinScheduler::new())
}
