//! Executable loading: a fresh address space with the image's segments and
//! an argument stack.

pub mod elf;
pub mod stack;

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::min;
use x86_64::VirtAddr;

use crate::fs::File;
use crate::kernel::Kernel;
use crate::memory::{user_vaddr, AddressSpace, MapError, UserPage, PAGE_SIZE};
use crate::process::arguments;

pub use elf::{Elf64Ehdr, Elf64Phdr, LoadError, SegmentFlags, SegmentKind, SegmentLayout};

/// A loaded program, ready to enter user mode.
pub struct LoadedImage {
    pub entry: VirtAddr,
    /// Initial stack pointer.
    pub stack: VirtAddr,
    pub address_space: Box<dyn AddressSpace>,
}

/// Load the program named by the first token of `command_line`.
///
/// The new address space is active when this returns `Ok`. On failure
/// everything built so far is torn down and the kernel directory is active.
pub fn load(kernel: &Kernel, command_line: &str) -> Result<LoadedImage, LoadError> {
    let args: Vec<&str> = arguments(command_line).collect();
    let program = args.first().copied().unwrap_or("");

    let mut space = kernel.mmu.create_address_space().map_err(|_| LoadError::OutOfMemory)?;
    space.activate();

    match populate(kernel, space.as_mut(), program, &args) {
        Ok((entry, stack)) => Ok(LoadedImage { entry, stack, address_space: space }),
        Err(err) => {
            kernel.mmu.activate_kernel();
            space.destroy();
            Err(err)
        }
    }
}

fn populate(
    kernel: &Kernel,
    space: &mut dyn AddressSpace,
    program: &str,
    args: &[&str],
) -> Result<(VirtAddr, VirtAddr), LoadError> {
    let mut file = kernel.fs.open(program).map_err(|_| LoadError::NotFound)?;
    let result = map_image(kernel, space, file.as_mut()).and_then(|entry| {
        let sp = stack::setup(&*kernel.frames, space, args, kernel.config.max_args)?;
        Ok((entry, sp))
    });
    // The executable stays open only for the duration of the load.
    kernel.fs.close(file);
    result
}

/// Map every loadable segment of `file` and return the entry point.
fn map_image(kernel: &Kernel, space: &mut dyn AddressSpace, file: &mut dyn File) -> Result<VirtAddr, LoadError> {
    let file_len = kernel.fs.length(file);

    let mut raw = [0u8; elf::EHDR_SIZE];
    if kernel.fs.read_at(file, &mut raw, 0) != raw.len() {
        return Err(LoadError::MalformedImage);
    }
    let ehdr = Elf64Ehdr::parse(&raw, kernel.config.max_program_headers)?;

    let mut offset = ehdr.e_phoff;
    for _ in 0..ehdr.e_phnum {
        if offset > file_len {
            return Err(LoadError::MalformedImage);
        }
        let mut raw = [0u8; elf::PHDR_SIZE];
        if kernel.fs.read_at(file, &mut raw, offset) != raw.len() {
            return Err(LoadError::MalformedImage);
        }
        offset += elf::PHDR_SIZE as u64;

        let phdr = Elf64Phdr::parse(&raw);
        match phdr.kind() {
            SegmentKind::Load => {
                phdr.validate(file_len)?;
                load_segment(kernel, space, file, &phdr.layout())?;
            }
            SegmentKind::Reject => return Err(LoadError::UnsupportedSegment),
            SegmentKind::Ignore => {}
        }
    }

    user_vaddr(ehdr.e_entry).ok_or(LoadError::MalformedImage)
}

/// Back each page of `segment` with a fresh frame: file bytes first, zeroes
/// after.
fn load_segment(
    kernel: &Kernel,
    space: &mut dyn AddressSpace,
    file: &mut dyn File,
    segment: &SegmentLayout,
) -> Result<(), LoadError> {
    let frames = &*kernel.frames;
    let mut page = UserPage::containing_address(VirtAddr::new(segment.mem_page));
    let mut offset = segment.file_page;
    let mut read_bytes = segment.read_bytes;
    let mut zero_bytes = segment.zero_bytes;
    let mut buf = vec![0u8; PAGE_SIZE as usize];

    while read_bytes > 0 || zero_bytes > 0 {
        let page_read = min(read_bytes, PAGE_SIZE);
        let page_zero = PAGE_SIZE - page_read;

        let frame = frames.alloc_frame(true).map_err(|_| LoadError::OutOfMemory)?;
        if page_read > 0 {
            let chunk = &mut buf[..page_read as usize];
            if kernel.fs.read_at(file, chunk, offset) != chunk.len() {
                frames.free_frame(frame);
                return Err(LoadError::ReadError);
            }
            frames.write_frame(frame, 0, chunk);
        }
        if let Err(err) = space.map(page, frame, segment.writable) {
            frames.free_frame(frame);
            return Err(match err {
                MapError::AlreadyMapped => LoadError::BadSegment,
                MapError::OutOfMemory => LoadError::OutOfMemory,
            });
        }

        read_bytes -= page_read;
        zero_bytes -= page_zero;
        offset += page_read;
        page = page + 1;
    }
    Ok(())
}
