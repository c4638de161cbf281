use alloc::boxed::Box;
use alloc::vec::Vec;

use super::File;

pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;

/// Binding of one descriptor number to an open file.
pub struct FileHandle {
    pub descriptor: i32,
    pub file: Box<dyn File>,
}

/// A process's open files.
///
/// Descriptors come from a counter that only moves forward, so a closed
/// descriptor number is never handed out again while the process lives.
pub struct FdTable {
    handles: Vec<FileHandle>,
    last_fd: i32,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable {
            handles: Vec::new(),
            last_fd: STDOUT_FILENO,
        }
    }

    /// Take ownership of `file` and return its new descriptor.
    pub fn insert(&mut self, file: Box<dyn File>) -> i32 {
        self.last_fd += 1;
        let descriptor = self.last_fd;
        self.handles.push(FileHandle { descriptor, file });
        descriptor
    }

    pub fn get_mut(&mut self, descriptor: i32) -> Option<&mut FileHandle> {
        self.handles.iter_mut().find(|h| h.descriptor == descriptor)
    }

    pub fn remove(&mut self, descriptor: i32) -> Option<FileHandle> {
        let index = self.handles.iter().position(|h| h.descriptor == descriptor)?;
        Some(self.handles.remove(index))
    }

    /// Remove every handle, oldest first.
    pub fn drain(&mut self) -> Vec<FileHandle> {
        core::mem::take(&mut self.handles)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        FdTable::new()
    }
}
