pub mod error;
pub mod fd;
pub mod ramfs;

use alloc::boxed::Box;
use spin::Mutex;

pub use error::{FsError, FsResult};
pub use fd::{FdTable, FileHandle, STDIN_FILENO, STDOUT_FILENO};
pub use ramfs::RamFs;

/// An open file in the file-store. Dropping it closes it.
pub trait File: Send {
    /// Read from the current position, advancing it. Returns bytes read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Write at the current position, advancing it. Returns bytes written.
    fn write(&mut self, data: &[u8]) -> usize;
    fn seek(&mut self, pos: u64);
    fn length(&self) -> u64;
}

/// The file-store the kernel is built against.
pub trait FileStore: Send {
    fn open(&mut self, name: &str) -> FsResult<Box<dyn File>>;
    fn create(&mut self, name: &str, initial_size: u64) -> FsResult<()>;
}

/// The shared file-store behind the single global file lock.
///
/// Every call takes the lock for exactly one file-store operation, so no
/// caller can hold it across an access to user memory.
pub struct FileSystem {
    store: Mutex<Box<dyn FileStore>>,
}

impl FileSystem {
    pub fn new(store: Box<dyn FileStore>) -> Self {
        FileSystem { store: Mutex::new(store) }
    }

    pub fn open(&self, name: &str) -> FsResult<Box<dyn File>> {
        self.store.lock().open(name)
    }

    pub fn create(&self, name: &str, initial_size: u64) -> FsResult<()> {
        self.store.lock().create(name, initial_size)
    }

    pub fn read(&self, file: &mut dyn File, buf: &mut [u8]) -> usize {
        let _guard = self.store.lock();
        file.read(buf)
    }

    /// Positioned read, used by the loader.
    pub fn read_at(&self, file: &mut dyn File, buf: &mut [u8], offset: u64) -> usize {
        let _guard = self.store.lock();
        file.seek(offset);
        file.read(buf)
    }

    pub fn write(&self, file: &mut dyn File, data: &[u8]) -> usize {
        let _guard = self.store.lock();
        file.write(data)
    }

    pub fn length(&self, file: &dyn File) -> u64 {
        let _guard = self.store.lock();
        file.length()
    }

    pub fn close(&self, file: Box<dyn File>) {
        let _guard = self.store.lock();
        drop(file);
    }
}
