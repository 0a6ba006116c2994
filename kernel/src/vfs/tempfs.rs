//! An in-memory filesystem with a flat root directory. Backs both the
//! executables installed at boot and the per-process swap files.

use super::{Error, FileInfo, FileSystem, INodeNum, OwnedPath, Path, Result};
use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

#[derive(Default)]
pub struct TempFs {
    names: BTreeMap<OwnedPath, INodeNum>,
    files: BTreeMap<INodeNum, Vec<u8>>,
    next_inode: INodeNum,
}

impl TempFs {
    pub fn new() -> Self {
        Self {
            names: BTreeMap::new(),
            files: BTreeMap::new(),
            next_inode: 1,
        }
    }
}

impl FileSystem for TempFs {
    fn lookup(&self, name: &Path) -> Result<INodeNum> {
        self.names.get(name).copied().ok_or(Error::NotFound)
    }

    fn create(&mut self, name: &Path) -> Result<INodeNum> {
        if let Some(&inode) = self.names.get(name) {
            return Ok(inode);
        }
        let inode = self.next_inode;
        self.next_inode += 1;
        self.names.insert(name.to_owned(), inode);
        self.files.insert(inode, Vec::new());
        Ok(inode)
    }

    fn unlink(&mut self, name: &Path) -> Result<()> {
        let inode = self.names.remove(name).ok_or(Error::NotFound)?;
        self.files.remove(&inode);
        Ok(())
    }

    fn read(&self, inode: INodeNum, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.files.get(&inode).ok_or(Error::NotFound)?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write(&mut self, inode: INodeNum, offset: u64, buf: &[u8]) -> Result<usize> {
        let data = self.files.get_mut(&inode).ok_or(Error::NotFound)?;
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn stat(&self, inode: INodeNum) -> Result<FileInfo> {
        let data = self.files.get(&inode).ok_or(Error::NotFound)?;
        Ok(FileInfo {
            inode,
            size: data.len() as u64,
        })
    }
}
