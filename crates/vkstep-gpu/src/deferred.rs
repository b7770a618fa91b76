//! Per-frame deferred resource deletion.
//!
//! A resource released while frame slot `i` is being recorded may still be
//! referenced by GPU work submitted from that slot. Deletions are therefore
//! parked in the slot's list and only performed the next time slot `i`
//! begins, after its fence has been waited on.

use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use ash::vk;

/// Resources waiting for one frame slot to retire.
#[derive(Default)]
pub struct DeleteList {
    image_views: Vec<vk::ImageView>,
    images: Vec<GpuImage>,
    buffers: Vec<GpuBuffer>,
}

impl DeleteList {
    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.image_views.is_empty() && self.images.is_empty() && self.buffers.is_empty()
    }

    /// Total number of queued resources.
    pub fn len(&self) -> usize {
        self.image_views.len() + self.images.len() + self.buffers.len()
    }

    fn append(&mut self, other: &mut Self) {
        self.image_views.append(&mut other.image_views);
        self.images.append(&mut other.images);
        self.buffers.append(&mut other.buffers);
    }

    /// Destroy every queued resource.
    ///
    /// Views go first since they reference the images queued alongside them.
    ///
    /// # Safety
    /// The GPU must no longer use any of the queued resources.
    pub unsafe fn perform(mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        for view in self.image_views.drain(..) {
            device.destroy_image_view(view, None);
        }
        for image in self.images.drain(..) {
            allocator.free_image(image)?;
        }
        for buffer in self.buffers.drain(..) {
            allocator.free_buffer(buffer)?;
        }
        Ok(())
    }
}

/// One [`DeleteList`] per frame slot.
pub struct DeferredDeletionQueue {
    slots: Vec<DeleteList>,
}

impl DeferredDeletionQueue {
    /// Create a queue for `frames_in_flight` slots.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            slots: (0..frames_in_flight.max(1))
                .map(|_| DeleteList::default())
                .collect(),
        }
    }

    /// Number of frame slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Queue an image view for deletion when `slot` retires.
    pub fn queue_image_view(&mut self, slot: usize, view: vk::ImageView) {
        self.slots[slot].image_views.push(view);
    }

    /// Queue an image (and its memory) for deletion when `slot` retires.
    pub fn queue_image(&mut self, slot: usize, image: GpuImage) {
        self.slots[slot].images.push(image);
    }

    /// Queue a buffer (and its memory) for deletion when `slot` retires.
    pub fn queue_buffer(&mut self, slot: usize, buffer: GpuBuffer) {
        self.slots[slot].buffers.push(buffer);
    }

    /// Take everything queued against `slot`, leaving it empty.
    pub fn take_slot(&mut self, slot: usize) -> DeleteList {
        std::mem::take(&mut self.slots[slot])
    }

    /// Take everything queued against every slot.
    ///
    /// Used during shutdown once the device is idle.
    pub fn take_all(&mut self) -> DeleteList {
        let mut all = DeleteList::default();
        for slot in &mut self.slots {
            all.append(slot);
        }
        all
    }

    /// Number of pending deletions across all slots.
    pub fn pending_count(&self) -> usize {
        self.slots.iter().map(DeleteList::len).sum()
    }
}
