pub mod frame_allocator;
pub mod paging;

use alloc::boxed::Box;
use core::fmt;
use x86_64::structures::paging::{Page, PhysFrame, Size4KiB};
use x86_64::VirtAddr;

pub use frame_allocator::FramePool;
pub use paging::{SoftMmu, SoftPageTable};

pub const PAGE_SIZE: u64 = 4096;

/// First address above user space. Every user virtual address is below it and
/// the initial stack page sits directly underneath.
pub const USER_TOP: u64 = 0x0000_8000_0000_0000;

pub type UserPage = Page<Size4KiB>;

/// Returns `true` if `addr` lies in the user portion of the address space.
pub fn is_user_vaddr(addr: u64) -> bool {
    addr < USER_TOP
}

/// Converts a raw user-supplied address, rejecting anything outside user space.
pub fn user_vaddr(addr: u64) -> Option<VirtAddr> {
    is_user_vaddr(addr).then(|| VirtAddr::new(addr))
}

/// Offset of `addr` inside its page.
pub fn page_offset(addr: u64) -> u64 {
    addr & (PAGE_SIZE - 1)
}

pub fn round_up_to_page(len: u64) -> u64 {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

impl fmt::Display for OutOfMemory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Out of physical memory")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    AlreadyMapped,
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MapError::AlreadyMapped => write!(f, "Page already mapped"),
            MapError::OutOfMemory   => write!(f, "Out of memory for page tables"),
        }
    }
}

/// A present user mapping as seen by a page-table walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub frame: PhysFrame,
    pub writable: bool,
}

/// Physical frame allocation together with the kernel's direct map of frame
/// contents.
pub trait FrameAllocator: Send + Sync {
    fn alloc_frame(&self, zeroed: bool) -> Result<PhysFrame, OutOfMemory>;
    fn free_frame(&self, frame: PhysFrame);
    /// Copy bytes out of `frame` starting at `offset`. The range must stay within the frame.
    fn read_frame(&self, frame: PhysFrame, offset: usize, buf: &mut [u8]);
    /// Copy bytes into `frame` starting at `offset`. The range must stay within the frame.
    fn write_frame(&self, frame: PhysFrame, offset: usize, data: &[u8]);
}

/// One user page directory.
pub trait AddressSpace: Send {
    /// Install `page -> frame`. Fails if `page` is already mapped.
    fn map(&mut self, page: UserPage, frame: PhysFrame, writable: bool) -> Result<(), MapError>;
    fn lookup(&self, addr: VirtAddr) -> Option<Mapping>;
    /// Make this the address space the CPU translates through.
    fn activate(&self);
    /// Tear down the directory and release every frame mapped into it.
    /// The space must not be active.
    fn destroy(self: Box<Self>);
}

pub trait Mmu: Send + Sync {
    fn create_address_space(&self) -> Result<Box<dyn AddressSpace>, OutOfMemory>;
    /// Switch to the kernel-only directory, leaving no user space active.
    fn activate_kernel(&self);
}
