use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::error::{FsError, FsResult};
use super::{File, FileStore};

/// Longest file name the store accepts.
pub const NAME_MAX: usize = 14;

/// File data a store built with [`RamFs::new`] may hold.
pub const DEFAULT_CAPACITY: usize = 16 * 1024 * 1024;

// ──────────────────────────────────────────────────────────────
//  Internal nodes, kept in a flat Vec<RamNode>
// ──────────────────────────────────────────────────────────────

struct RamNode {
    name: String,
    /// Shared with every open handle, so contents outlive the directory entry.
    data: Arc<Mutex<Vec<u8>>>,
}

struct RamFsInner {
    nodes: Vec<RamNode>,
    /// Total bytes of file data the store may hold.
    capacity: usize,
}

impl RamFsInner {
    fn find(&self, name: &str) -> Option<&RamNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    fn used(&self) -> usize {
        self.nodes.iter().map(|n| n.data.lock().len()).sum()
    }

    /// Check that a `len`-byte file called `name` may be added. Runs before
    /// any file data is allocated.
    fn admit(&self, name: &str, len: usize) -> FsResult<()> {
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            return Err(FsError::InvalidName);
        }
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists);
        }
        match self.used().checked_add(len) {
            Some(total) if total <= self.capacity => Ok(()),
            _ => Err(FsError::NoSpace),
        }
    }

    fn insert(&mut self, name: &str, data: Vec<u8>) -> FsResult<()> {
        self.admit(name, data.len())?;
        self.nodes.push(RamNode {
            name: String::from(name),
            data: Arc::new(Mutex::new(data)),
        });
        Ok(())
    }
}

// ──────────────────────────────────────────────────────────────
//  Public RamFs handle
// ──────────────────────────────────────────────────────────────

/// A flat in-memory file-store.
///
/// Files have the length they were created with: writes stop at the end of
/// the file and never grow it. Clones share the same files.
#[derive(Clone)]
pub struct RamFs {
    inner: Arc<Mutex<RamFsInner>>,
}

impl RamFs {
    pub fn new() -> Self {
        RamFs::with_capacity(DEFAULT_CAPACITY)
    }

    /// A store that refuses to hold more than `bytes` bytes of file data.
    pub fn with_capacity(bytes: usize) -> Self {
        RamFs {
            inner: Arc::new(Mutex::new(RamFsInner {
                nodes: Vec::new(),
                capacity: bytes,
            })),
        }
    }

    /// Seed a file with the given contents.
    pub fn add_file(&self, name: &str, contents: &[u8]) -> FsResult<()> {
        self.inner.lock().insert(name, Vec::from(contents))
    }

    /// Snapshot of a file's current contents.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        let node = inner.find(name)?;
        let data = node.data.lock().clone();
        Some(data)
    }

    /// How many handles on `name` are open right now.
    pub fn open_handles(&self, name: &str) -> Option<usize> {
        let inner = self.inner.lock();
        inner.find(name).map(|node| Arc::strong_count(&node.data) - 1)
    }
}

impl Default for RamFs {
    fn default() -> Self {
        RamFs::new()
    }
}

impl FileStore for RamFs {
    fn open(&mut self, name: &str) -> FsResult<Box<dyn File>> {
        let inner = self.inner.lock();
        let node = inner.find(name).ok_or(FsError::NotFound)?;
        Ok(Box::new(RamFile {
            data: node.data.clone(),
            pos: 0,
        }))
    }

    fn create(&mut self, name: &str, initial_size: u64) -> FsResult<()> {
        let size = usize::try_from(initial_size).map_err(|_| FsError::NoSpace)?;
        let mut inner = self.inner.lock();
        inner.admit(name, size)?;
        inner.insert(name, vec![0u8; size])
    }
}

/// An open RamFs file with its own position.
struct RamFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: u64,
}

impl File for RamFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let data = self.data.lock();
        let start = (self.pos as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.pos += count as u64;
        count
    }

    fn write(&mut self, src: &[u8]) -> usize {
        let mut data = self.data.lock();
        let start = (self.pos as usize).min(data.len());
        let count = src.len().min(data.len() - start);
        data[start..start + count].copy_from_slice(&src[..count]);
        self.pos += count as u64;
        count
    }

    fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }
}
