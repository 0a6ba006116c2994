//! System state: everything a booted machine owns.
//!
//! Constructed once per machine instance and passed by reference, so tests
//! and user programs each get a hermetic kernel.

use crate::fs::RootFileSystem;
use crate::log::Console;
use crate::mem::PhysMemory;
use crate::sync::Mutex;
use crate::threading::process::{create_process_state, Pid, ProcessState};
use crate::threading::scheduling::{initialize_scheduler, Scheduler};
use crate::threading::sleep::BlockedThreads;
use crate::threading::thread_control_block::{ProcessControlBlock, ThreadControlBlock};
use crate::threading;
use crate::user_program::loader::{self, ExecError};
use crate::user_program::Program;
use crate::vfs::OwnedPath;
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

pub struct SystemParams {
    /// Size of simulated physical memory, in frames.
    pub phys_frames: usize,
}

impl Default for SystemParams {
    fn default() -> Self {
        Self { phys_frames: 256 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpawnError {
    /// No instruction stream registered for the path.
    NoProgram,
    Exec(ExecError),
}

pub struct SystemState {
    pub console: Arc<Console>,
    pub phys: Mutex<PhysMemory>,
    /// The global tick counter; has its own lock.
    pub ticks: Mutex<u64>,
    /// Cumulative bytes returned by successful read() calls, wraparound.
    pub total_read_bytes: AtomicU32,
    pub root_fs: Mutex<RootFileSystem>,
    pub process: ProcessState,
    pub scheduler: Mutex<Box<dyn Scheduler>>,
    pub blocked: Mutex<BlockedThreads>,
    programs: Mutex<BTreeMap<OwnedPath, Arc<Program>>>,
}

impl SystemState {
    pub fn new(params: SystemParams) -> Self {
        let console = Arc::new(Console::new());
        Self {
            scheduler: Mutex::new(initialize_scheduler(console.clone())),
            console,
            phys: Mutex::new(PhysMemory::new(params.phys_frames)),
            ticks: Mutex::new(0),
            total_read_bytes: AtomicU32::new(0),
            root_fs: Mutex::new(RootFileSystem::new()),
            process: create_process_state(),
            blocked: Mutex::new(BlockedThreads::new()),
            programs: Mutex::new(BTreeMap::new()),
        }
    }

    /// Swap in a different policy before any thread has been created. Used
    /// by harnesses that pick a policy at run time instead of build time.
    pub fn set_scheduler(&self, scheduler: Box<dyn Scheduler>) {
        *self.scheduler.lock() = scheduler;
    }

    pub fn ticks(&self) -> u64 {
        *self.ticks.lock()
    }

    pub fn read_count(&self) -> u32 {
        self.total_read_bytes.load(Ordering::SeqCst)
    }

    /// Place an executable image in the filesystem and register the
    /// instruction stream that animates it.
    pub fn install_program(
        &self,
        path: &str,
        image: &[u8],
        program: Program,
    ) -> crate::vfs::Result<()> {
        let inode = self.root_fs.lock().create_direct(path)?;
        self.root_fs.lock().write_direct(inode, 0, image)?;
        self.programs.lock().insert(path.into(), Arc::new(program));
        Ok(())
    }

    pub fn program(&self, path: &str) -> Option<Arc<Program>> {
        self.programs.lock().get(path).cloned()
    }

    /// Create a process running the program at `path`.
    pub fn spawn(&self, path: &str, argv: &[&str]) -> Result<Pid, SpawnError> {
        let program = self.program(path).ok_or(SpawnError::NoProgram)?;
        let pid = self.process.allocate_pid();
        let proc = self.process.table.add(ProcessControlBlock::new(pid, 0));
        let layout = match loader::exec(self, &proc, path, argv) {
            Ok(layout) => layout,
            Err(e) => {
                self.process.table.remove(pid);
                return Err(SpawnError::Exec(e));
            }
        };
        let tid = self.process.allocate_tid();
        let mut tcb = Box::new(ThreadControlBlock::new(
            tid,
            pid,
            program,
            layout.entry,
            self.ticks(),
        ));
        tcb.last_ret = layout.argc as isize;
        self.scheduler.lock().push(tcb);
        Ok(pid)
    }

    /// Drive the dispatcher until every process has exited.
    pub fn run(&self) {
        threading::run(self);
    }

    pub fn exit_code(&self, pid: Pid) -> Option<i32> {
        self.process.table.get(pid)?.lock().exit_code
    }

    /// Pids in the order they exited.
    pub fn exit_order(&self) -> Vec<Pid> {
        self.process.exit_order.lock().clone()
    }
}
