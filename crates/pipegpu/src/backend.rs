use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use bitflags::bitflags;
use tracing::{trace, warn};

use crate::caps::DeviceCaps;
use crate::error::BackendError;
use crate::resource::ResourceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

/// Kernel-side command stream handle. One per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CsId(pub u32);

/// Monotonic submission fence. A fence is signalled once every submission up to and including it
/// has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fence(pub u64);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const SAMPLER_VIEW = 1 << 2;
        const RENDER_TARGET = 1 << 3;
        const DEPTH_STENCIL = 1 << 4;
        const QUERY = 1 << 5;
    }
}

bitflags! {
    /// How a submission accesses a relocated buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RelocUsage: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub bind: BindFlags,
}

#[derive(Debug, Clone)]
pub struct Reloc {
    pub resource: ResourceHandle,
    pub usage: RelocUsage,
}

/// A finished command stream handed to the device.
///
/// The relocation list holds strong references: every buffer the stream names stays alive until
/// the device drops the submission.
#[derive(Debug)]
pub struct Submission {
    pub context_id: u64,
    pub dwords: Vec<u32>,
    pub relocs: Vec<Reloc>,
}

impl Submission {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.dwords)
    }
}

/// Boundary between the driver core and the kernel/device.
///
/// Implementations must be shareable across threads: a screen hands the same backend to every
/// context it creates.
pub trait DeviceBackend: Send + Sync {
    fn caps(&self) -> DeviceCaps;

    fn cs_create(&self) -> Result<CsId, BackendError>;
    fn cs_destroy(&self, cs: CsId);

    /// Submit a finished stream and return the fence that signals its completion.
    fn submit(&self, cs: CsId, submission: Submission) -> Result<Fence, BackendError>;

    fn buffer_create(&self, desc: &BufferDesc) -> Result<BufferId, BackendError>;
    fn buffer_destroy(&self, buffer: BufferId);
    fn buffer_write(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), BackendError>;
    fn buffer_read(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>, BackendError>;

    /// Block until no submitted work references `buffer`.
    fn buffer_wait(&self, buffer: BufferId);
    /// Block until `fence` has signalled.
    fn fence_wait(&self, fence: Fence);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FenceCompletionMode {
    /// Every submission completes before `submit` returns.
    #[default]
    Immediate,
    /// Submissions stay pending until [`ImmediateDevice::complete_all`] is called.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub cs: CsId,
    pub context_id: u64,
    pub fence: Fence,
    pub dwords: Vec<u32>,
    pub relocs: Vec<(BufferId, RelocUsage)>,
}

#[derive(Debug)]
struct BufferRecord {
    data: Vec<u8>,
    busy_until: u64,
}

#[derive(Debug, Default)]
struct DeviceInner {
    next_buffer: u32,
    next_cs: u32,
    last_fence: u64,
    completed_fence: u64,
    buffers: HashMap<BufferId, BufferRecord>,
    command_streams: HashSet<CsId>,
    submissions: Vec<RecordedSubmission>,
    buffers_created: u64,
    buffers_destroyed: u64,
    invalid_destroys: u64,
    fail_buffer_create_after: Option<usize>,
}

/// In-process device: keeps buffer contents in memory, records every submission, and never
/// executes anything.
///
/// Fault injection hooks let tests drive the partial-construction paths of context creation.
#[derive(Debug)]
pub struct ImmediateDevice {
    caps: DeviceCaps,
    mode: FenceCompletionMode,
    inner: Mutex<DeviceInner>,
    completed: Condvar,
    fail_cs_create: AtomicBool,
    fail_submit: AtomicBool,
}

impl ImmediateDevice {
    pub fn new(caps: DeviceCaps) -> Self {
        Self::with_completion_mode(caps, FenceCompletionMode::Immediate)
    }

    pub fn with_completion_mode(caps: DeviceCaps, mode: FenceCompletionMode) -> Self {
        Self {
            caps,
            mode,
            inner: Mutex::new(DeviceInner::default()),
            completed: Condvar::new(),
            fail_cs_create: AtomicBool::new(false),
            fail_submit: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make the next `cs_create` fail.
    pub fn fail_next_cs_create(&self) {
        self.fail_cs_create.store(true, Ordering::SeqCst);
    }

    /// Make the next `submit` report a lost device.
    pub fn fail_next_submit(&self) {
        self.fail_submit.store(true, Ordering::SeqCst);
    }

    /// Let `n` more buffer creations succeed, then fail every following one.
    pub fn fail_buffer_create_after(&self, n: usize) {
        self.lock().fail_buffer_create_after = Some(n);
    }

    pub fn clear_faults(&self) {
        self.fail_cs_create.store(false, Ordering::SeqCst);
        self.fail_submit.store(false, Ordering::SeqCst);
        self.lock().fail_buffer_create_after = None;
    }

    /// Signal every outstanding fence.
    pub fn complete_all(&self) {
        let mut inner = self.lock();
        inner.completed_fence = inner.last_fence;
        drop(inner);
        self.completed.notify_all();
    }

    pub fn last_fence(&self) -> Fence {
        Fence(self.lock().last_fence)
    }

    pub fn completed_fence(&self) -> Fence {
        Fence(self.lock().completed_fence)
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.lock().submissions.clone()
    }

    pub fn take_submissions(&self) -> Vec<RecordedSubmission> {
        std::mem::take(&mut self.lock().submissions)
    }

    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn buffers_created(&self) -> u64 {
        self.lock().buffers_created
    }

    pub fn buffers_destroyed(&self) -> u64 {
        self.lock().buffers_destroyed
    }

    /// Destroy calls for buffers that were not alive. Non-zero means a double release.
    pub fn invalid_destroys(&self) -> u64 {
        self.lock().invalid_destroys
    }

    pub fn live_command_streams(&self) -> usize {
        self.lock().command_streams.len()
    }

    pub fn is_buffer_busy(&self, buffer: BufferId) -> bool {
        let inner = self.lock();
        inner
            .buffers
            .get(&buffer)
            .is_some_and(|record| record.busy_until > inner.completed_fence)
    }
}

impl DeviceBackend for ImmediateDevice {
    fn caps(&self) -> DeviceCaps {
        self.caps
    }

    fn cs_create(&self) -> Result<CsId, BackendError> {
        if self.fail_cs_create.swap(false, Ordering::SeqCst) {
            return Err(BackendError::OutOfMemory {
                what: "command stream",
            });
        }
        let mut inner = self.lock();
        inner.next_cs += 1;
        let cs = CsId(inner.next_cs);
        inner.command_streams.insert(cs);
        Ok(cs)
    }

    fn cs_destroy(&self, cs: CsId) {
        if !self.lock().command_streams.remove(&cs) {
            warn!(?cs, "destroying unknown command stream");
        }
    }

    fn submit(&self, cs: CsId, submission: Submission) -> Result<Fence, BackendError> {
        if self.fail_submit.swap(false, Ordering::SeqCst) {
            return Err(BackendError::DeviceLost);
        }
        let mut inner = self.lock();
        if !inner.command_streams.contains(&cs) {
            return Err(BackendError::UnknownCommandStream(cs));
        }

        inner.last_fence += 1;
        let fence = inner.last_fence;
        let mut relocs = Vec::with_capacity(submission.relocs.len());
        for reloc in &submission.relocs {
            let id = reloc.resource.id();
            let record = inner
                .buffers
                .get_mut(&id)
                .ok_or(BackendError::UnknownBuffer(id))?;
            record.busy_until = fence;
            relocs.push((id, reloc.usage));
        }

        trace!(
            ?cs,
            fence,
            dwords = submission.dwords.len(),
            relocs = relocs.len(),
            "submit"
        );
        inner.submissions.push(RecordedSubmission {
            cs,
            context_id: submission.context_id,
            fence: Fence(fence),
            dwords: submission.dwords,
            relocs,
        });

        if self.mode == FenceCompletionMode::Immediate {
            inner.completed_fence = fence;
            drop(inner);
            self.completed.notify_all();
        }
        // `submission.relocs` drops here, releasing the stream's pins.
        Ok(Fence(fence))
    }

    fn buffer_create(&self, desc: &BufferDesc) -> Result<BufferId, BackendError> {
        let mut inner = self.lock();
        if let Some(remaining) = inner.fail_buffer_create_after.as_mut() {
            if *remaining == 0 {
                return Err(BackendError::OutOfMemory { what: "buffer" });
            }
            *remaining -= 1;
        }
        inner.next_buffer += 1;
        let id = BufferId(inner.next_buffer);
        inner.buffers.insert(
            id,
            BufferRecord {
                data: vec![0; desc.size as usize],
                busy_until: 0,
            },
        );
        inner.buffers_created += 1;
        Ok(id)
    }

    fn buffer_destroy(&self, buffer: BufferId) {
        let mut inner = self.lock();
        if inner.buffers.remove(&buffer).is_some() {
            inner.buffers_destroyed += 1;
        } else {
            inner.invalid_destroys += 1;
            warn!(?buffer, "destroying unknown buffer");
        }
    }

    fn buffer_write(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        let mut inner = self.lock();
        let record = inner
            .buffers
            .get_mut(&buffer)
            .ok_or(BackendError::UnknownBuffer(buffer))?;
        let range = checked_range(buffer, record.data.len(), offset, data.len() as u64)?;
        record.data[range].copy_from_slice(data);
        Ok(())
    }

    fn buffer_read(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>, BackendError> {
        let inner = self.lock();
        let record = inner
            .buffers
            .get(&buffer)
            .ok_or(BackendError::UnknownBuffer(buffer))?;
        let range = checked_range(buffer, record.data.len(), offset, len)?;
        Ok(record.data[range].to_vec())
    }

    fn buffer_wait(&self, buffer: BufferId) {
        let mut inner = self.lock();
        loop {
            let busy_until = match inner.buffers.get(&buffer) {
                Some(record) => record.busy_until,
                None => return,
            };
            if busy_until <= inner.completed_fence {
                return;
            }
            inner = self
                .completed
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn fence_wait(&self, fence: Fence) {
        let mut inner = self.lock();
        while inner.completed_fence < fence.0 {
            inner = self
                .completed
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

fn checked_range(
    buffer: BufferId,
    size: usize,
    offset: u64,
    len: u64,
) -> Result<std::ops::Range<usize>, BackendError> {
    let end = offset.checked_add(len);
    match end {
        Some(end) if end <= size as u64 => Ok(offset as usize..end as usize),
        _ => Err(BackendError::OutOfBounds {
            buffer,
            offset,
            len,
            size: size as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::ChipFamily;

    fn device() -> ImmediateDevice {
        ImmediateDevice::new(DeviceCaps::new(ChipFamily::R300))
    }

    #[test]
    fn buffer_contents_round_trip_within_bounds() {
        let dev = device();
        let id = dev
            .buffer_create(&BufferDesc {
                size: 8,
                bind: BindFlags::VERTEX_BUFFER,
            })
            .unwrap();
        dev.buffer_write(id, 4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(dev.buffer_read(id, 0, 8).unwrap(), vec![0, 0, 0, 0, 1, 2, 3, 4]);
        assert!(matches!(
            dev.buffer_write(id, 6, &[0; 4]),
            Err(BackendError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn double_destroy_is_counted() {
        let dev = device();
        let id = dev
            .buffer_create(&BufferDesc {
                size: 4,
                bind: BindFlags::empty(),
            })
            .unwrap();
        dev.buffer_destroy(id);
        dev.buffer_destroy(id);
        assert_eq!(dev.buffers_destroyed(), 1);
        assert_eq!(dev.invalid_destroys(), 1);
    }

    #[test]
    fn buffer_create_fault_triggers_after_budget() {
        let dev = device();
        dev.fail_buffer_create_after(1);
        let desc = BufferDesc {
            size: 4,
            bind: BindFlags::empty(),
        };
        assert!(dev.buffer_create(&desc).is_ok());
        assert_eq!(
            dev.buffer_create(&desc),
            Err(BackendError::OutOfMemory { what: "buffer" })
        );
        dev.clear_faults();
        assert!(dev.buffer_create(&desc).is_ok());
    }

    #[test]
    fn cs_create_fault_is_one_shot() {
        let dev = device();
        dev.fail_next_cs_create();
        assert!(dev.cs_create().is_err());
        assert!(dev.cs_create().is_ok());
    }

    #[test]
    fn submit_fault_is_one_shot() {
        let dev = device();
        let cs = dev.cs_create().unwrap();
        let submission = || Submission {
            context_id: 1,
            dwords: vec![0],
            relocs: Vec::new(),
        };
        dev.fail_next_submit();
        assert_eq!(dev.submit(cs, submission()), Err(BackendError::DeviceLost));
        assert!(dev.submissions().is_empty());
        assert!(dev.submit(cs, submission()).is_ok());
    }

    #[test]
    fn submit_to_unknown_stream_is_rejected() {
        let dev = device();
        let err = dev
            .submit(
                CsId(42),
                Submission {
                    context_id: 1,
                    dwords: vec![0],
                    relocs: Vec::new(),
                },
            )
            .unwrap_err();
        assert_eq!(err, BackendError::UnknownCommandStream(CsId(42)));
    }

    #[test]
    fn fences_complete_in_order_in_immediate_mode() {
        let dev = device();
        let cs = dev.cs_create().unwrap();
        let a = dev
            .submit(
                cs,
                Submission {
                    context_id: 1,
                    dwords: vec![1],
                    relocs: Vec::new(),
                },
            )
            .unwrap();
        let b = dev
            .submit(
                cs,
                Submission {
                    context_id: 1,
                    dwords: vec![2],
                    relocs: Vec::new(),
                },
            )
            .unwrap();
        assert!(a < b);
        assert_eq!(dev.completed_fence(), b);
        dev.fence_wait(a);
    }
}
