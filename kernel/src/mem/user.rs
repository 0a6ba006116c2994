//! User memory access through the page table.
//!
//! Every access walks the page table and takes the real fault path on a
//! miss. A store to a resident read-only page needs two repair rounds (map,
//! then write-upgrade), hence the retry bound of three translation
//! attempts.

use crate::mem::demand_paging::FaultError;
use crate::paging::Access;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::thread_control_block::ProcessControlBlock;
use crate::trap::{self, FaultSource};
use alloc::sync::Arc;
use marrow_shared::mem::{pg_round_down, PAGE_FRAME_SIZE};

const FAULT_RETRIES: usize = 3;

fn resolve(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    va: usize,
    access: Access,
    source: FaultSource,
) -> Result<(usize, usize), FaultError> {
    for _ in 0..FAULT_RETRIES {
        let hit = proc.lock().mem.page_table.translate(va, access);
        if let Some(hit) = hit {
            return Ok(hit);
        }
        trap::page_fault(sys, proc, va, access, source)?;
    }
    Err(FaultError::Invalid)
}

pub fn load_byte(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    va: usize,
    source: FaultSource,
) -> Result<u8, FaultError> {
    let (frame, offset) = resolve(sys, proc, va, Access::Read, source)?;
    Ok(sys.phys.lock().frame(frame)[offset])
}

pub fn store_byte(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    va: usize,
    value: u8,
    source: FaultSource,
) -> Result<(), FaultError> {
    let (frame, offset) = resolve(sys, proc, va, Access::Write, source)?;
    sys.phys.lock().frame_mut(frame)[offset] = value;
    Ok(())
}

/// An instruction fetch: like a read, but requires execute permission.
pub fn fetch_instruction(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    va: usize,
) -> Result<(), FaultError> {
    resolve(sys, proc, va, Access::Exec, FaultSource::UserAccess).map(|_| ())
}

/// Copy kernel bytes into user memory, page by page. This may fault (and
/// demand-allocate) just like any user store.
pub fn copy_to_user(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    mut dst: usize,
    mut src: &[u8],
    source: FaultSource,
) -> Result<(), FaultError> {
    while !src.is_empty() {
        let page_end = pg_round_down(dst) + PAGE_FRAME_SIZE;
        let n = src.len().min(page_end - dst);
        let (frame, offset) = resolve(sys, proc, dst, Access::Write, source)?;
        sys.phys.lock().frame_mut(frame)[offset..offset + n].copy_from_slice(&src[..n]);
        dst += n;
        src = &src[n..];
    }
    Ok(())
}

/// Copy user memory out into a kernel buffer, page by page.
pub fn copy_from_user(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    mut src: usize,
    mut dst: &mut [u8],
    source: FaultSource,
) -> Result<(), FaultError> {
    while !dst.is_empty() {
        let page_end = pg_round_down(src) + PAGE_FRAME_SIZE;
        let n = dst.len().min(page_end - src);
        let (frame, offset) = resolve(sys, proc, src, Access::Read, source)?;
        dst[..n].copy_from_slice(&sys.phys.lock().frame(frame)[offset..offset + n]);
        src += n;
        dst = &mut dst[n..];
    }
    Ok(())
}
