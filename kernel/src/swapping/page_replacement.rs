//! FIFO page replacement.
//!
//! The victim is always the resident page with the smallest FIFO stamp.
//! Replacement is per-process: global frame pressure surfaces as the frame
//! allocator returning none, which triggers eviction within the faulting
//! process only.

use super::{swap_out_page, SwapError};
use crate::mem::pages::{MemoryRecord, PageState};
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::thread_control_block::ProcessControlBlock;
use alloc::format;
use alloc::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictError {
    /// No resident page exists to evict.
    NoResidentPage,
    SwapExhausted,
    Io,
}

impl core::fmt::Display for EvictError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoResidentPage => write!(f, "no resident page to evict"),
            Self::SwapExhausted => write!(f, "swap slots exhausted"),
            Self::Io => write!(f, "swap I/O failed"),
        }
    }
}

impl core::error::Error for EvictError {}

/// The resident page with the minimum FIFO stamp. Stamps of resident pages
/// are pairwise distinct, so there is never a tie.
pub fn find_fifo_victim(mem: &MemoryRecord) -> Option<(usize, u64)> {
    mem.pages
        .iter()
        .filter(|p| p.state == PageState::Resident)
        .min_by_key(|p| p.seq)
        .map(|p| (p.va, p.seq))
}

/// Evict one page from the process. A clean text page is discarded (it can
/// be re-read from the executable); everything else is written to swap. In
/// both cases the PTE is cleared and the frame is released.
pub fn evict_one(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
) -> Result<(), EvictError> {
    let (pid, va, seq, frame, dirty, in_text) = {
        let p = proc.lock();
        let (va, seq) = find_fifo_victim(&p.mem).ok_or(EvictError::NoResidentPage)?;
        let entry = p.mem.page_table.entry(va).ok_or(EvictError::Io)?;
        let dirty = p.mem.page_info(va).map(|pi| pi.dirty).unwrap_or(false);
        (
            p.pid,
            va,
            seq,
            entry.frame() as usize,
            dirty,
            p.mem.layout.in_text(va),
        )
    };

    sys.console
        .log(format!("[pid {pid}] VICTIM  va={va:#x} seq={seq} algo=FIFO"));

    if dirty || !in_text {
        sys.console.log(format!(
            "[pid {pid}] EVICT   va={va:#x} state={}",
            if dirty { "dirty" } else { "clean" }
        ));
        swap_out_page(sys, proc, va, frame).map_err(|e| match e {
            SwapError::SlotsExhausted => EvictError::SwapExhausted,
            _ => EvictError::Io,
        })?;
        let mut p = proc.lock();
        p.mem.page_table.unmap(va);
    } else {
        sys.console
            .log(format!("[pid {pid}] EVICT   va={va:#x} state=clean"));
        sys.console.log(format!("[pid {pid}] DISCARD va={va:#x}"));
        let mut p = proc.lock();
        if let Some(pi) = p.mem.page_info_mut(va) {
            pi.state = PageState::Unmapped;
            pi.swap_slot = None;
        }
        p.mem.page_table.unmap(va);
    }
    sys.phys.lock().free_frame(frame);
    Ok(())
}
