//! The exec path.
//!
//! Exec does not load program pages. It parses the segment headers, records
//! the memory layout and per-page file offsets, and allocates exactly one
//! physical frame: the topmost stack page, so the argument strings can be
//! copied out without re-entering the fault handler before the new image is
//! committed. Failure before commit leaves the old address space intact.

use crate::mem::pages::{MemoryRecord, PageState};
use crate::paging::PagePerm;
use crate::system::SystemState;
use crate::sync::Mutex;
use crate::threading::thread_control_block::ProcessControlBlock;
use crate::user_program::image::{Image, ImageHeader, SegmentKind};
use alloc::format;
use alloc::string::ToString;
use alloc::sync::Arc;
use alloc::vec;
use marrow_shared::mem::{
    pg_round_up, PAGE_FRAME_SIZE, USER_STACK_PAGES, USER_VA_LIMIT,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecError {
    NotFound,
    /// Malformed header: bad magic, `memsz < filesz`, unaligned `vaddr`,
    /// address arithmetic overflow, or no text.
    BadImage,
    /// The image needs more page records than a process may hold.
    TooManyPages,
    /// No frame available for the bootstrap stack page.
    NoMemory,
    /// The argument strings do not fit in one stack page.
    ArgumentsTooLarge,
    Io,
}

impl core::fmt::Display for ExecError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NotFound => write!(f, "executable not found"),
            Self::BadImage => write!(f, "malformed executable image"),
            Self::TooManyPages => write!(f, "image exceeds the per-process page limit"),
            Self::NoMemory => write!(f, "out of physical memory"),
            Self::ArgumentsTooLarge => write!(f, "argument strings exceed one stack page"),
            Self::Io => write!(f, "executable I/O failed"),
        }
    }
}

impl core::error::Error for ExecError {}

#[derive(Debug, PartialEq)]
pub struct ExecLayout {
    pub entry: usize,
    pub argc: usize,
}

/// Replace the process image with the program at `path`. Returns the new
/// entry point and argc; the caller places argc in the thread's result
/// register, mirroring the return-into-main convention.
pub fn exec(
    sys: &SystemState,
    proc: &Arc<Mutex<ProcessControlBlock>>,
    path: &str,
    argv: &[&str],
) -> Result<ExecLayout, ExecError> {
    let inode = sys
        .root_fs
        .lock()
        .lookup(path)
        .map_err(|_| ExecError::NotFound)?;

    // Read and parse just the header material.
    let mut head = vec![0u8; Image::header_len(0)];
    if sys
        .root_fs
        .lock()
        .read_direct(inode, 0, &mut head)
        .map_err(|_| ExecError::Io)?
        != head.len()
    {
        return Err(ExecError::BadImage);
    }
    let header = ImageHeader::parse(&head)
        .map_err(|_| ExecError::BadImage)?
        .1;
    let mut head = vec![0u8; Image::header_len(header.segment_count)];
    if sys
        .root_fs
        .lock()
        .read_direct(inode, 0, &mut head)
        .map_err(|_| ExecError::Io)?
        != head.len()
    {
        return Err(ExecError::BadImage);
    }
    let image = Image::parse_bytes(&head).map_err(|_| ExecError::BadImage)?;

    // Scan segment headers and record the layout; allocate no frames for
    // text or data.
    let mut mem = MemoryRecord::new();
    let mut text_start = usize::MAX;
    let mut text_end = 0usize;
    let mut data_start = usize::MAX;
    let mut data_end = 0usize;
    let mut sz = 0usize;

    for seg in image.segments.iter().filter(|s| s.kind == SegmentKind::Load) {
        if seg.memsz < seg.filesz {
            return Err(ExecError::BadImage);
        }
        let vaddr = seg.vaddr as usize;
        let memsz = seg.memsz as usize;
        if vaddr % PAGE_FRAME_SIZE != 0 {
            return Err(ExecError::BadImage);
        }
        let Some(seg_end) = vaddr.checked_add(memsz) else {
            return Err(ExecError::BadImage);
        };
        if seg_end > USER_VA_LIMIT {
            return Err(ExecError::BadImage);
        }

        if seg.executable {
            text_start = text_start.min(vaddr);
            text_end = text_end.max(seg_end);
        } else {
            data_start = data_start.min(vaddr);
            data_end = data_end.max(seg_end);
        }

        for va in (vaddr..seg_end).step_by(PAGE_FRAME_SIZE) {
            let page_off = va - vaddr;
            let Some(pi) = mem.page_info_or_insert(va) else {
                return Err(ExecError::TooManyPages);
            };
            if page_off < seg.filesz as usize {
                pi.file_off = (seg.file_offset as usize + page_off) as u64;
                pi.file_len = (seg.filesz as usize - page_off).min(PAGE_FRAME_SIZE);
            } else {
                // BSS tail page.
                pi.file_off = 0;
                pi.file_len = 0;
            }
        }
        sz = sz.max(seg_end);
    }

    if text_start == usize::MAX {
        return Err(ExecError::BadImage);
    }
    if data_start == usize::MAX {
        // No data segment; the data box collapses onto the end of text.
        data_start = text_end;
        data_end = text_end;
    }

    let sz = pg_round_up(sz);
    let stack_top = sz + (USER_STACK_PAGES + 1) * PAGE_FRAME_SIZE;
    mem.layout.text_start = text_start;
    mem.layout.text_end = text_end;
    mem.layout.data_start = data_start;
    mem.layout.data_end = data_end;
    mem.layout.heap_start = pg_round_up(data_end);
    mem.layout.stack_top = stack_top;
    mem.sz = stack_top;
    mem.exec_inode = Some(inode);

    // The single eager frame: the topmost stack page.
    let stack_page = stack_top - PAGE_FRAME_SIZE;
    let frame = {
        let mut phys = sys.phys.lock();
        let Some(frame) = phys.alloc_frame() else {
            return Err(ExecError::NoMemory);
        };
        phys.zero_frame(frame);
        frame
    };
    if mem
        .page_table
        .map(stack_page, frame, PagePerm { write: true, execute: false })
        .is_err()
    {
        sys.phys.lock().free_frame(frame);
        return Err(ExecError::BadImage);
    }
    {
        let seq = mem.next_fifo_seq;
        mem.next_fifo_seq += 1;
        let Some(pi) = mem.page_info_or_insert(stack_page) else {
            sys.phys.lock().free_frame(frame);
            return Err(ExecError::TooManyPages);
        };
        pi.state = PageState::Resident;
        pi.seq = seq;
        pi.dirty = true;
    }

    // Copy argument strings and the argv pointer array onto the stack page.
    let mut page = vec![0u8; PAGE_FRAME_SIZE];
    let mut sp = stack_top;
    let mut ustack: alloc::vec::Vec<u32> = alloc::vec::Vec::new();
    for arg in argv {
        let bytes = arg.as_bytes();
        sp = sp.checked_sub(bytes.len() + 1).unwrap_or(0);
        sp -= sp % 16; // sp stays 16-byte aligned
        if sp < stack_page {
            sys.phys.lock().free_frame(frame);
            return Err(ExecError::ArgumentsTooLarge);
        }
        page[sp - stack_page..sp - stack_page + bytes.len()].copy_from_slice(bytes);
        ustack.push(sp as u32);
    }
    ustack.push(0);
    sp = sp.saturating_sub(ustack.len() * 4);
    sp -= sp % 16;
    if sp < stack_page {
        sys.phys.lock().free_frame(frame);
        return Err(ExecError::ArgumentsTooLarge);
    }
    for (i, ptr) in ustack.iter().enumerate() {
        let at = sp - stack_page + i * 4;
        page[at..at + 4].copy_from_slice(&ptr.to_le_bytes());
    }
    sys.phys.lock().frame_mut(frame).copy_from_slice(&page);

    // Commit to the new image.
    let (pid, layout) = {
        let mut p = proc.lock();
        {
            let mut phys = sys.phys.lock();
            p.mem.release(&mut phys);
        }
        mem.swap_inode = p.mem.swap_inode;
        p.mem = mem;
        p.name = path.rsplit('/').next().unwrap_or(path).to_string();
        (p.pid, p.mem.layout)
    };
    sys.console.log(format!(
        "[pid {pid}] INIT-LAZYMAP text=[{:#x},{:#x}) data=[{:#x},{:#x}) heap_start={:#x} stack_top={:#x}",
        layout.text_start,
        layout.text_end,
        layout.data_start,
        layout.data_end,
        layout.heap_start,
        layout.stack_top
    ));

    Ok(ExecLayout {
        entry: image.header.entry as usize,
        argc: argv.len(),
    })
}
