//! Initial user stack: argument strings, argv, argc and a fake return address.

use alloc::vec::Vec;
use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use super::LoadError;
use crate::memory::{AddressSpace, FrameAllocator, MapError, UserPage, PAGE_SIZE, USER_TOP};

const WORD: u64 = core::mem::size_of::<u64>() as u64;

/// Pushes values downward through one freshly mapped stack page.
///
/// The page is written through the frame allocator's view of the frame, so
/// the builder works whichever address space is active.
struct UserStackBuilder<'a> {
    frames: &'a dyn FrameAllocator,
    frame: PhysFrame,
    /// Current stack pointer, as user space will see it.
    cursor: u64,
    lower_bound: u64,
}

impl<'a> UserStackBuilder<'a> {
    fn new(frames: &'a dyn FrameAllocator, frame: PhysFrame, base: u64) -> Self {
        UserStackBuilder {
            frames,
            frame,
            cursor: base + PAGE_SIZE,
            lower_bound: base,
        }
    }

    /// Running out of page is reported as too many arguments.
    fn push_bytes(&mut self, bytes: &[u8]) -> Result<u64, LoadError> {
        let cursor = self
            .cursor
            .checked_sub(bytes.len() as u64)
            .filter(|&c| c >= self.lower_bound)
            .ok_or(LoadError::TooManyArguments)?;
        self.cursor = cursor;
        let offset = (cursor - self.lower_bound) as usize;
        self.frames.write_frame(self.frame, offset, bytes);
        Ok(cursor)
    }

    fn push_cstring(&mut self, s: &str) -> Result<u64, LoadError> {
        self.push_bytes(&[0])?;
        self.push_bytes(s.as_bytes())
    }

    fn align_to_word(&mut self) -> Result<(), LoadError> {
        let padding = (self.cursor % WORD) as usize;
        self.push_bytes(&[0u8; WORD as usize][..padding]).map(|_| ())
    }

    fn push_u64(&mut self, value: u64) -> Result<u64, LoadError> {
        self.push_bytes(&value.to_le_bytes())
    }
}

/// Map the stack page just below [`USER_TOP`] and lay out `args` on it.
/// Returns the initial stack pointer, which points at the fake return address.
///
/// Layout from the stack pointer upward: return address 0, argc, argv,
/// argv[0..argc], a null pointer, word padding, then the strings. argv[0]'s
/// string sits highest.
pub fn setup(
    frames: &dyn FrameAllocator,
    space: &mut dyn AddressSpace,
    args: &[&str],
    max_args: usize,
) -> Result<VirtAddr, LoadError> {
    if args.len() > max_args {
        return Err(LoadError::TooManyArguments);
    }

    let base = USER_TOP - PAGE_SIZE;
    let frame = frames.alloc_frame(true).map_err(|_| LoadError::OutOfMemory)?;
    if let Err(err) = space.map(UserPage::containing_address(VirtAddr::new(base)), frame, true) {
        frames.free_frame(frame);
        return Err(match err {
            MapError::AlreadyMapped => LoadError::BadSegment,
            MapError::OutOfMemory => LoadError::OutOfMemory,
        });
    }
    // From here on the frame belongs to `space` and goes away with it.

    let mut stack = UserStackBuilder::new(frames, frame, base);
    let mut argv = Vec::with_capacity(args.len());
    for arg in args {
        argv.push(stack.push_cstring(arg)?);
    }
    stack.align_to_word()?;

    stack.push_u64(0)?;
    for ptr in argv.iter().rev() {
        stack.push_u64(*ptr)?;
    }
    let argv_base = stack.cursor;
    stack.push_u64(argv_base)?;
    stack.push_u64(args.len() as u64)?;
    let sp = stack.push_u64(0)?;

    Ok(VirtAddr::new(sp))
}
