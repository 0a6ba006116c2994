//! Software-walked two-level page table for the user address space.
//!
//! Virtual addresses are 32-bit: bits 31..22 index the directory, bits
//! 21..12 the leaf table, bits 11..0 the byte within the page. Physical
//! memory is addressed by frame index into the simulated frame arena.

use alloc::{boxed::Box, vec::Vec};
use marrow_shared::bitfield;
use marrow_shared::mem::{PAGE_FRAME_SIZE, USER_VA_LIMIT};

const PAGE_DIRECTORY_LEN: usize = 1024;
const PAGE_TABLE_LEN: usize = 1024;

bitfield!(
    PageTableEntry, u32
    { (u32, frame, 12, 31) }
    {
        (present, 0),
        (user, 1),
        (read, 2),
        (write, 3),
        (execute, 4),
    }
);

/// How a page is being accessed. Drives both permission checks and the
/// `access=` field of fault log lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
            Access::Exec => "exec",
        }
    }
}

/// Permissions requested when installing a mapping. User and read access are
/// always granted for user pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PagePerm {
    pub write: bool,
    pub execute: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    OutOfRange,
}

pub struct PageTable {
    tables: Vec<Option<Box<[PageTableEntry; PAGE_TABLE_LEN]>>>,
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

fn virt_parts(va: usize) -> (usize, usize) {
    ((va >> 22) & 0x3ff, (va >> 12) & 0x3ff)
}

impl PageTable {
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(PAGE_DIRECTORY_LEN);
        tables.resize_with(PAGE_DIRECTORY_LEN, || None);
        Self { tables }
    }

    /// Install a mapping from the page containing `va` to `frame`. The page
    /// must not already be mapped.
    pub fn map(&mut self, va: usize, frame: usize, perm: PagePerm) -> Result<(), MapError> {
        debug_assert_eq!(va % PAGE_FRAME_SIZE, 0, "va was not page-aligned");
        if va >= USER_VA_LIMIT {
            return Err(MapError::OutOfRange);
        }
        let (pdi, pti) = virt_parts(va);
        let table = self.tables[pdi]
            .get_or_insert_with(|| Box::new([PageTableEntry::default(); PAGE_TABLE_LEN]));
        if table[pti].present() {
            return Err(MapError::AlreadyMapped);
        }
        table[pti] = PageTableEntry::default()
            .with_present(true)
            .with_user(true)
            .with_read(true)
            .with_write(perm.write)
            .with_execute(perm.execute)
            .with_frame(frame as u32);
        Ok(())
    }

    /// Remove the mapping for the page containing `va`, returning the frame
    /// it pointed at.
    pub fn unmap(&mut self, va: usize) -> Option<usize> {
        let entry = self.entry(va)?;
        let (pdi, pti) = virt_parts(va);
        self.tables[pdi].as_mut()?[pti] = PageTableEntry::default();
        Some(entry.frame() as usize)
    }

    /// The present entry for `va`, if any.
    pub fn entry(&self, va: usize) -> Option<PageTableEntry> {
        if va >= USER_VA_LIMIT {
            return None;
        }
        let (pdi, pti) = virt_parts(va);
        let entry = self.tables[pdi].as_ref()?[pti];
        entry.present().then_some(entry)
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.entry(va).is_some()
    }

    /// Upgrade the page containing `va` to writable. Returns false if the
    /// page is not mapped.
    pub fn grant_write(&mut self, va: usize) -> bool {
        if self.entry(va).is_none() {
            return false;
        }
        let (pdi, pti) = virt_parts(va);
        match self.tables[pdi].as_mut() {
            Some(table) => {
                table[pti] = table[pti].with_write(true);
                true
            }
            None => false,
        }
    }

    /// Walk the table for `va` and check permissions for `access`. On a hit
    /// returns the frame index and the byte offset within it.
    pub fn translate(&self, va: usize, access: Access) -> Option<(usize, usize)> {
        let entry = self.entry(va & !(PAGE_FRAME_SIZE - 1))?;
        if !entry.user() {
            return None;
        }
        let allowed = match access {
            Access::Read => entry.read(),
            Access::Write => entry.write(),
            Access::Exec => entry.execute(),
        };
        allowed.then_some((entry.frame() as usize, va % PAGE_FRAME_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_translate() {
        let mut pt = PageTable::new();
        pt.map(0x1000, 7, PagePerm::default()).unwrap();
        assert!(pt.is_mapped(0x1000));
        assert!(!pt.is_mapped(0x2000));
        assert_eq!(pt.translate(0x1234, Access::Read), Some((7, 0x234)));
        assert_eq!(pt.translate(0x1234, Access::Write), None);
        assert_eq!(pt.translate(0x1234, Access::Exec), None);
    }

    #[test]
    fn test_double_map_is_rejected() {
        let mut pt = PageTable::new();
        pt.map(0x1000, 1, PagePerm::default()).unwrap();
        assert_eq!(
            pt.map(0x1000, 2, PagePerm::default()),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn test_unmap_returns_frame() {
        let mut pt = PageTable::new();
        pt.map(0x5000, 42, PagePerm::default()).unwrap();
        assert_eq!(pt.unmap(0x5000), Some(42));
        assert!(!pt.is_mapped(0x5000));
        assert_eq!(pt.unmap(0x5000), None);
    }

    #[test]
    fn test_grant_write_upgrades_entry() {
        let mut pt = PageTable::new();
        pt.map(0x3000, 3, PagePerm { write: false, execute: false })
            .unwrap();
        assert_eq!(pt.translate(0x3000, Access::Write), None);
        assert!(pt.grant_write(0x3000));
        assert_eq!(pt.translate(0x3000, Access::Write), Some((3, 0)));
        assert!(!pt.grant_write(0x9000));
    }

    #[test]
    fn test_exec_permission() {
        let mut pt = PageTable::new();
        pt.map(0x4000, 9, PagePerm { write: false, execute: true })
            .unwrap();
        assert_eq!(pt.translate(0x4000, Access::Exec), Some((9, 0)));
    }
}
