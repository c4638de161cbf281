use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use x86_64::{
    structures::paging::{PageTableFlags, PhysFrame},
    VirtAddr,
};

use super::{AddressSpace, FrameAllocator, MapError, Mapping, Mmu, OutOfMemory, UserPage};

/// Directory id meaning "only the kernel mappings are active".
const KERNEL_SPACE: u64 = 0;

/// Software page directories for hosted runs.
///
/// Every directory gets a distinct id; the MMU remembers which one is active
/// so teardown order can be checked.
pub struct SoftMmu {
    frames: Arc<dyn FrameAllocator>,
    active: Arc<AtomicU64>,
    next_id: AtomicU64,
    live: Arc<AtomicU64>,
}

impl SoftMmu {
    pub fn new(frames: Arc<dyn FrameAllocator>) -> Self {
        SoftMmu {
            frames,
            active: Arc::new(AtomicU64::new(KERNEL_SPACE)),
            next_id: AtomicU64::new(KERNEL_SPACE + 1),
            live: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Id of the directory currently active, `None` for the kernel directory.
    pub fn active_space(&self) -> Option<u64> {
        match self.active.load(Ordering::SeqCst) {
            KERNEL_SPACE => None,
            id => Some(id),
        }
    }

    /// User directories created and not yet destroyed.
    pub fn live_spaces(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }
}

impl Mmu for SoftMmu {
    fn create_address_space(&self) -> Result<Box<dyn AddressSpace>, OutOfMemory> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(SoftPageTable {
            id,
            entries: BTreeMap::new(),
            frames: self.frames.clone(),
            active: self.active.clone(),
            live: self.live.clone(),
        }))
    }

    fn activate_kernel(&self) {
        self.active.store(KERNEL_SPACE, Ordering::SeqCst);
    }
}

/// A user page directory kept as an ordered map from page to frame.
pub struct SoftPageTable {
    id: u64,
    entries: BTreeMap<UserPage, (PhysFrame, PageTableFlags)>,
    frames: Arc<dyn FrameAllocator>,
    active: Arc<AtomicU64>,
    live: Arc<AtomicU64>,
}

impl AddressSpace for SoftPageTable {
    fn map(&mut self, page: UserPage, frame: PhysFrame, writable: bool) -> Result<(), MapError> {
        if self.entries.contains_key(&page) {
            return Err(MapError::AlreadyMapped);
        }
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        self.entries.insert(page, (frame, flags));
        Ok(())
    }

    fn lookup(&self, addr: VirtAddr) -> Option<Mapping> {
        let page = UserPage::containing_address(addr);
        self.entries.get(&page).map(|&(frame, flags)| Mapping {
            frame,
            writable: flags.contains(PageTableFlags::WRITABLE),
        })
    }

    fn activate(&self) {
        self.active.store(self.id, Ordering::SeqCst);
    }

    fn destroy(self: Box<Self>) {
        assert_ne!(
            self.active.load(Ordering::SeqCst),
            self.id,
            "destroying the active address space"
        );
        for (_, (frame, _)) in self.entries.iter() {
            self.frames.free_frame(*frame);
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
