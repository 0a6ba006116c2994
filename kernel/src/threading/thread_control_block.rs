use crate::mem::pages::MemoryRecord;
use crate::threading::process::{Pid, Tid};
use crate::user_program::Program;
use crate::vfs::OwnedPath;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ThreadStatus {
    Ready,
    Running,
    Blocked,
    Dying,
}

pub struct ProcessControlBlock {
    pub pid: Pid,
    // The pid of the process' parent
    pub ppid: Pid,
    pub name: OwnedPath,
    /// Pids of live or zombie children.
    pub children: Vec<Pid>,
    pub exit_code: Option<i32>,
    /// Set by asynchronous kills and by fatal fault resolution; the
    /// dispatcher tears the process down at the next step boundary.
    pub killed: bool,
    pub mem: MemoryRecord,
}

impl ProcessControlBlock {
    pub fn new(pid: Pid, ppid: Pid) -> Self {
        Self {
            pid,
            ppid,
            name: String::new(),
            children: Vec::new(),
            exit_code: None,
            killed: false,
            mem: MemoryRecord::new(),
        }
    }
}

pub struct ThreadControlBlock {
    pub tid: Tid,
    pub pid: Pid,
    pub status: ThreadStatus,

    /// The instruction stream this thread executes.
    pub program: Arc<Program>,
    /// Index of the next instruction in the stream.
    pub ip: usize,
    /// Virtual address of the program's first instruction; the fetch
    /// address for instruction `ip` is `entry + 4 * ip`.
    pub entry: usize,
    /// Result of the most recent syscall or load, visible to conditional
    /// jumps (the a0 register, morally).
    pub last_ret: isize,

    // Scheduling record.
    /// Tick at which this thread was created; drives FCFS ordering.
    pub ctime: u64,
    pub nice: i32,
    pub vruntime: u64,
    pub slice_remaining: u64,
}

impl ThreadControlBlock {
    pub fn new(tid: Tid, pid: Pid, program: Arc<Program>, entry: usize, ctime: u64) -> Self {
        Self {
            tid,
            pid,
            status: ThreadStatus::Ready,
            program,
            ip: 0,
            entry,
            last_ret: 0,
            ctime,
            nice: 0,
            vruntime: 0,
            slice_remaining: 0,
        }
    }
}
