use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::{
    structures::paging::{PhysFrame, Size4KiB},
    PhysAddr,
};

use super::{FrameAllocator, OutOfMemory, PAGE_SIZE};

type FrameData = Box<[u8; PAGE_SIZE as usize]>;

/// A bump allocator for physical frames, with a free list so released frames
/// are handed out again before the bump pointer moves.
///
/// Frame contents live on the kernel heap, which makes this the allocator for
/// hosted runs where no direct-mapped physical memory exists.
pub struct FramePool {
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    base: PhysFrame,
    next_free_frame: u64,
    frame_limit: u64,
    free: Vec<u64>,
    frames: Vec<Option<FrameData>>,
}

impl FramePool {
    /// Create a pool of `frames` frames starting at physical address `start`.
    pub fn new(start: PhysAddr, frames: u64) -> Self {
        FramePool {
            inner: Mutex::new(PoolInner {
                base: PhysFrame::containing_address(start),
                next_free_frame: 0,
                frame_limit: frames,
                free: Vec::new(),
                frames: Vec::new(),
            }),
        }
    }

    /// Frames currently handed out.
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock();
        inner.frames.iter().filter(|f| f.is_some()).count()
    }
}

impl PoolInner {
    fn index_of(&self, frame: PhysFrame) -> usize {
        let index = (frame - self.base) as usize;
        assert!(index < self.frames.len(), "frame {:?} does not belong to this pool", frame);
        index
    }

    fn data(&mut self, frame: PhysFrame) -> &mut FrameData {
        let index = self.index_of(frame);
        self.frames[index]
            .as_mut()
            .unwrap_or_else(|| panic!("access to free frame {:?}", frame))
    }
}

impl FrameAllocator for FramePool {
    // Heap-backed frames always start zeroed, so `_zeroed` needs no work here.
    fn alloc_frame(&self, _zeroed: bool) -> Result<PhysFrame, OutOfMemory> {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free.pop() {
            inner.frames[index as usize] = Some(Box::new([0u8; PAGE_SIZE as usize]));
            return Ok(inner.base + index);
        }
        if inner.next_free_frame >= inner.frame_limit {
            return Err(OutOfMemory);
        }
        let index = inner.next_free_frame;
        inner.next_free_frame += 1;
        inner.frames.push(Some(Box::new([0u8; PAGE_SIZE as usize])));
        Ok(inner.base + index)
    }

    fn free_frame(&self, frame: PhysFrame) {
        let mut inner = self.inner.lock();
        let index = inner.index_of(frame);
        assert!(inner.frames[index].take().is_some(), "double free of frame {:?}", frame);
        inner.free.push(index as u64);
    }

    fn read_frame(&self, frame: PhysFrame<Size4KiB>, offset: usize, buf: &mut [u8]) {
        let mut inner = self.inner.lock();
        let data = inner.data(frame);
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    fn write_frame(&self, frame: PhysFrame<Size4KiB>, offset: usize, data: &[u8]) {
        let mut inner = self.inner.lock();
        let page = inner.data(frame);
        page[offset..offset + data.len()].copy_from_slice(data);
    }
}
