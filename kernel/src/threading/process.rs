use crate::sync::Mutex;
use crate::threading::thread_control_block::ProcessControlBlock;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};

pub type Pid = u16;
pub type Tid = u16;
pub type AtomicPid = AtomicU16;
pub type AtomicTid = AtomicU16;

#[derive(Default)]
pub struct ProcessTable {
    content: Mutex<BTreeMap<Pid, Arc<Mutex<ProcessControlBlock>>>>,
}

pub struct ProcessState {
    pub table: ProcessTable,
    /// Pids of exited processes, in the order they exited.
    pub exit_order: Mutex<Vec<Pid>>,
    next_pid: AtomicPid,
    next_tid: AtomicTid,
}

pub fn create_process_state() -> ProcessState {
    ProcessState {
        table: Default::default(),
        exit_order: Mutex::new(Vec::new()),
        next_pid: AtomicPid::new(1),
        next_tid: AtomicTid::new(1),
    }
}

impl ProcessState {
    pub fn allocate_pid(&self) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        assert!(pid != 0, "PID overflow");
        pid
    }

    pub fn allocate_tid(&self) -> Tid {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        assert!(tid != 0, "TID overflow");
        tid
    }
}

impl ProcessTable {
    pub fn add(&self, pcb: ProcessControlBlock) -> Arc<Mutex<ProcessControlBlock>> {
        let pid = pcb.pid;
        let mut content = self.content.lock();
        assert!(
            !content.contains_key(&pid),
            "PCB with pid {} already added to process table.",
            pid
        );
        let pcb = Arc::new(Mutex::new(pcb));
        content.insert(pid, pcb.clone());
        pcb
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Mutex<ProcessControlBlock>>> {
        self.content.lock().remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Mutex<ProcessControlBlock>>> {
        self.content.lock().get(&pid).cloned()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.content.lock().keys().copied().collect()
    }
}
