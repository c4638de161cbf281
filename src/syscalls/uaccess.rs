//! Checked access to the current process's user memory.
//!
//! Every byte goes through a page-table lookup first. An address that is
//! outside user space, unmapped, or read-only on a write is a [`Fault`] and
//! never reaches the frame.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use crate::memory::{page_offset, user_vaddr, AddressSpace, FrameAllocator, Mapping, PAGE_SIZE};

/// A system call the kernel refuses to carry out; the caller is killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    BadAddress(u64),
    BadSyscall(u64),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Fault::BadAddress(addr)   => write!(f, "bad user address {:#x}", addr),
            Fault::BadSyscall(number) => write!(f, "unknown system call {}", number),
        }
    }
}

pub type FaultResult<T = ()> = Result<T, Fault>;

pub struct UserMemory<'a> {
    space: &'a dyn AddressSpace,
    frames: &'a dyn FrameAllocator,
}

impl<'a> UserMemory<'a> {
    pub fn new(space: &'a dyn AddressSpace, frames: &'a dyn FrameAllocator) -> Self {
        UserMemory { space, frames }
    }

    fn mapping(&self, addr: u64, write: bool) -> FaultResult<Mapping> {
        let vaddr = user_vaddr(addr).ok_or(Fault::BadAddress(addr))?;
        match self.space.lookup(vaddr) {
            Some(mapping) if mapping.writable || !write => Ok(mapping),
            _ => Err(Fault::BadAddress(addr)),
        }
    }

    /// Check every page of `[addr, addr + len)`. A zero-length range still
    /// requires `addr` itself to be valid.
    pub fn check_range(&self, addr: u64, len: usize, write: bool) -> FaultResult {
        let last = match len {
            0 => addr,
            _ => addr.checked_add(len as u64 - 1).ok_or(Fault::BadAddress(addr))?,
        };
        let mut at = addr;
        loop {
            self.mapping(at, write)?;
            let next_page = (at - page_offset(at)).checked_add(PAGE_SIZE);
            match next_page {
                Some(next) if next <= last => at = next,
                _ => return Ok(()),
            }
        }
    }

    /// Walk `[addr, addr + len)` one page-bounded chunk at a time.
    fn for_each_chunk<F>(&self, addr: u64, len: usize, write: bool, mut f: F) -> FaultResult
    where
        F: FnMut(Mapping, usize, core::ops::Range<usize>),
    {
        let mut done = 0;
        while done < len {
            let at = addr.checked_add(done as u64).ok_or(Fault::BadAddress(addr))?;
            let mapping = self.mapping(at, write)?;
            let offset = page_offset(at) as usize;
            let count = (len - done).min(PAGE_SIZE as usize - offset);
            f(mapping, offset, done..done + count);
            done += count;
        }
        Ok(())
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> FaultResult {
        let frames = self.frames;
        self.for_each_chunk(addr, buf.len(), false, |mapping, offset, range| {
            frames.read_frame(mapping.frame, offset, &mut buf[range]);
        })
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> FaultResult {
        let frames = self.frames;
        self.for_each_chunk(addr, data.len(), true, |mapping, offset, range| {
            frames.write_frame(mapping.frame, offset, &data[range]);
        })
    }

    pub fn read_u64(&self, addr: u64) -> FaultResult<u64> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    /// Copy in `len` bytes after validating the whole range.
    pub fn read_bytes(&self, addr: u64, len: usize) -> FaultResult<Vec<u8>> {
        self.check_range(addr, len, false)?;
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Copy in a NUL-terminated string.
    ///
    /// The whole string is validated up to its terminator; `Ok(None)` means
    /// it is readable but longer than `max` bytes. Bytes that are not UTF-8
    /// are replaced, which makes such a name match no file.
    pub fn read_cstr(&self, addr: u64, max: usize) -> FaultResult<Option<String>> {
        let mut bytes = Vec::new();
        let mut too_long = false;
        let mut chunk = vec![0u8; PAGE_SIZE as usize];
        let mut at = addr;
        loop {
            let mapping = self.mapping(at, false)?;
            let offset = page_offset(at) as usize;
            let chunk = &mut chunk[..PAGE_SIZE as usize - offset];
            self.frames.read_frame(mapping.frame, offset, chunk);
            let nul = chunk.iter().position(|&b| b == 0);
            if !too_long {
                bytes.extend_from_slice(&chunk[..nul.unwrap_or(chunk.len())]);
                if bytes.len() > max {
                    too_long = true;
                    bytes = Vec::new();
                }
            }
            if nul.is_some() {
                break;
            }
            at = at.checked_add(chunk.len() as u64).ok_or(Fault::BadAddress(at))?;
        }
        if too_long {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
    }
}
