//! Streaming upload sub-allocators for user vertex and index data.
//!
//! Each allocator owns one backing buffer at a time and hands out aligned slices of it. When the
//! buffer fills up, or after a flush, it starts a fresh buffer; slices already referenced by a
//! command stream keep the old buffer alive through their relocation.

use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::backend::{BindFlags, DeviceBackend};
use crate::error::{BackendError, ContextError};
use crate::pool::SlotPool;
use crate::resource::ResourceHandle;

/// Round `value` up to the nearest multiple of `alignment` (which must be non-zero).
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

/// Linear allocator over `[base, base + capacity)`.
#[derive(Clone)]
pub struct LinearArena {
    base: u64,
    capacity: u64,
    cursor: u64,
}

impl LinearArena {
    pub fn new(base: u64, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            cursor: base,
        }
    }

    pub fn reset(&mut self) {
        self.cursor = self.base;
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn remaining(&self) -> u64 {
        self.end().saturating_sub(self.cursor)
    }

    pub fn used(&self) -> u64 {
        self.cursor - self.base
    }

    fn end(&self) -> u64 {
        self.base + self.capacity
    }

    /// Offset of a fresh `size`-byte range aligned to `alignment`, or `None` when full.
    pub fn alloc(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let aligned = align_up(self.cursor, alignment.max(1));
        let end = aligned.checked_add(size)?;
        if end > self.end() {
            return None;
        }
        self.cursor = end;
        Some(aligned)
    }
}

impl fmt::Debug for LinearArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearArena")
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UploadSlice {
    pub buffer: ResourceHandle,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadStats {
    pub uploads: u64,
    pub bytes: u64,
    pub buffers_created: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadAllocatorDescriptor {
    pub label: &'static str,
    /// Size of each backing buffer. Larger uploads get a dedicated buffer.
    pub default_size: u64,
    pub alignment: u64,
    pub bind: BindFlags,
}

pub struct UploadAllocator {
    desc: UploadAllocatorDescriptor,
    backend: Arc<dyn DeviceBackend>,
    buffer_pool: Option<Arc<SlotPool>>,
    transfer_pool: Option<Arc<SlotPool>>,
    current: Option<(ResourceHandle, LinearArena)>,
    stats: UploadStats,
}

impl UploadAllocator {
    /// Create the allocator and its first backing buffer.
    pub fn new(
        desc: UploadAllocatorDescriptor,
        backend: Arc<dyn DeviceBackend>,
        buffer_pool: Option<Arc<SlotPool>>,
        transfer_pool: Option<Arc<SlotPool>>,
    ) -> Result<Self, ContextError> {
        if desc.default_size == 0 {
            return Err(ContextError::BadArgument("upload buffer size must be non-zero"));
        }
        if !desc.alignment.is_power_of_two() {
            return Err(ContextError::BadArgument(
                "upload alignment must be a power of two",
            ));
        }
        let mut allocator = Self {
            desc,
            backend,
            buffer_pool,
            transfer_pool,
            current: None,
            stats: UploadStats::default(),
        };
        allocator.start_buffer(desc.default_size)?;
        Ok(allocator)
    }

    fn start_buffer(&mut self, size: u64) -> Result<(), BackendError> {
        let buffer = ResourceHandle::create_buffer(
            &self.backend,
            self.buffer_pool.as_ref(),
            size,
            self.desc.bind,
        )?;
        self.stats.buffers_created += 1;
        trace!(label = self.desc.label, size, buffer = ?buffer.id(), "upload buffer started");
        self.current = Some((buffer, LinearArena::new(0, size)));
        Ok(())
    }

    /// Copy `data` into a fresh slice.
    pub fn upload(&mut self, data: &[u8]) -> Result<UploadSlice, BackendError> {
        let size = data.len() as u64;
        let alignment = self.desc.alignment;
        let offset = match self.current.as_mut().and_then(|(_, arena)| arena.alloc(size, alignment)) {
            Some(offset) => offset,
            None => {
                self.start_buffer(self.desc.default_size.max(align_up(size, alignment)))?;
                self.current
                    .as_mut()
                    .and_then(|(_, arena)| arena.alloc(size, alignment))
                    .ok_or(BackendError::OutOfMemory {
                        what: "upload slice",
                    })?
            }
        };
        let buffer = match &self.current {
            Some((buffer, _)) => buffer.clone(),
            None => return Err(BackendError::OutOfMemory { what: "upload buffer" }),
        };

        let _transfer = self.transfer_pool.as_ref().map(|pool| pool.acquire());
        buffer.write(offset, data)?;

        self.stats.uploads += 1;
        self.stats.bytes += size;
        Ok(UploadSlice {
            buffer,
            offset,
            size,
        })
    }

    /// Stop sub-allocating from the current buffer; the next upload starts a new one.
    pub fn flush(&mut self) {
        if let Some((buffer, arena)) = self.current.take() {
            trace!(label = self.desc.label, buffer = ?buffer.id(), used = arena.used(), "upload buffer retired");
        }
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    pub fn descriptor(&self) -> &UploadAllocatorDescriptor {
        &self.desc
    }

    pub fn current_buffer(&self) -> Option<&ResourceHandle> {
        self.current.as_ref().map(|(buffer, _)| buffer)
    }
}

impl fmt::Debug for UploadAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadAllocator")
            .field("desc", &self.desc)
            .field("current", &self.current)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ImmediateDevice;
    use crate::caps::{ChipFamily, DeviceCaps};
    use crate::pool::ThreadSafety;

    fn descriptor(default_size: u64) -> UploadAllocatorDescriptor {
        UploadAllocatorDescriptor {
            label: "test",
            default_size,
            alignment: 16,
            bind: BindFlags::VERTEX_BUFFER,
        }
    }

    fn device() -> (Arc<ImmediateDevice>, Arc<dyn DeviceBackend>) {
        let dev = Arc::new(ImmediateDevice::new(DeviceCaps::new(ChipFamily::R300)));
        let backend: Arc<dyn DeviceBackend> = dev.clone();
        (dev, backend)
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(u64::MAX, 16), u64::MAX / 16 * 16);
    }

    #[test]
    fn arena_respects_alignment_and_capacity() {
        let mut arena = LinearArena::new(0, 64);
        assert_eq!(arena.alloc(1, 1), Some(0));
        assert_eq!(arena.alloc(1, 16), Some(16));
        assert_eq!(arena.alloc(16, 32), Some(32));
        assert_eq!(arena.alloc(33, 1), None);
        arena.reset();
        assert_eq!(arena.remaining(), 64);
    }

    #[test]
    fn uploads_are_aligned_and_written() {
        let (dev, backend) = device();
        let mut upload = UploadAllocator::new(descriptor(64), backend, None, None).unwrap();
        let a = upload.upload(&[1, 2, 3]).unwrap();
        let b = upload.upload(&[4, 5]).unwrap();
        assert_eq!((a.offset, b.offset), (0, 16));
        assert!(a.buffer.ptr_eq(&b.buffer));
        assert_eq!(b.buffer.read(16, 2).unwrap(), vec![4, 5]);
        assert_eq!(dev.live_buffers(), 1);
    }

    #[test]
    fn full_buffer_rolls_over() {
        let (dev, backend) = device();
        let mut upload = UploadAllocator::new(descriptor(32), backend, None, None).unwrap();
        let a = upload.upload(&[0; 32]).unwrap();
        let b = upload.upload(&[0; 8]).unwrap();
        assert!(!a.buffer.ptr_eq(&b.buffer));
        assert_eq!(b.offset, 0);
        assert_eq!(upload.stats().buffers_created, 2);

        drop(a);
        // The retired buffer was only kept alive by the slice.
        assert_eq!(dev.live_buffers(), 1);
    }

    #[test]
    fn oversized_upload_gets_a_dedicated_buffer() {
        let (_dev, backend) = device();
        let mut upload = UploadAllocator::new(descriptor(32), backend, None, None).unwrap();
        let big = upload.upload(&[7; 100]).unwrap();
        assert_eq!(big.buffer.size(), 112);
    }

    #[test]
    fn flush_retires_the_current_buffer() {
        let (_dev, backend) = device();
        let mut upload = UploadAllocator::new(descriptor(64), backend, None, None).unwrap();
        let a = upload.upload(&[1]).unwrap();
        upload.flush();
        assert!(upload.current_buffer().is_none());
        let b = upload.upload(&[1]).unwrap();
        assert!(!a.buffer.ptr_eq(&b.buffer));
    }

    #[test]
    fn creation_fails_when_the_first_buffer_cannot_be_created() {
        let (dev, backend) = device();
        dev.fail_buffer_create_after(0);
        let err = UploadAllocator::new(descriptor(64), backend, None, None).unwrap_err();
        assert!(matches!(err, ContextError::Backend(BackendError::OutOfMemory { .. })));
    }

    #[test]
    fn transfers_are_returned_after_each_upload() {
        let (_dev, backend) = device();
        let transfers = Arc::new(SlotPool::new("transfers", 64, ThreadSafety::SingleThreaded));
        let mut upload =
            UploadAllocator::new(descriptor(64), backend, None, Some(Arc::clone(&transfers)))
                .unwrap();
        upload.upload(&[1, 2]).unwrap();
        assert_eq!(transfers.in_use(), 0);
        assert_eq!(transfers.capacity(), 64);
    }

    #[test]
    fn rejects_bad_descriptors() {
        let (_dev, backend) = device();
        let mut desc = descriptor(64);
        desc.alignment = 12;
        assert!(matches!(
            UploadAllocator::new(desc, backend, None, None),
            Err(ContextError::BadArgument(_))
        ));
    }
}
