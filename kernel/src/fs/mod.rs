pub mod fs_manager;

pub use fs_manager::{Mode, ProcessFileDescriptor, RootFileSystem};
