//! Reference-counted GPU resources.
//!
//! A [`ResourceHandle`] is never copied, only shared: cloning bumps the reference count, and the
//! backing buffer is destroyed when the last handle drops. Command streams clone the handles they
//! relocate, so a resource stays alive until every submission naming it has been consumed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::backend::{BindFlags, BufferDesc, BufferId, DeviceBackend};
use crate::error::BackendError;
use crate::pool::{PoolSlot, SlotPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8,
    Bgra8,
    I8,
    Z16,
    Z24S8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            TextureFormat::I8 => 1,
            TextureFormat::Z16 => 2,
            TextureFormat::Rgba8 | TextureFormat::Bgra8 | TextureFormat::Z24S8 => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, TextureFormat::Z16 | TextureFormat::Z24S8)
    }

    /// Hardware format code shared by the texture, colour and depth format registers.
    pub fn hw_format(self) -> u32 {
        match self {
            TextureFormat::I8 => 0x0,
            TextureFormat::Z16 => 0x0,
            TextureFormat::Z24S8 => 0x2,
            TextureFormat::Rgba8 => 0x6,
            TextureFormat::Bgra8 => 0x7,
        }
    }
}

/// Row pitch alignment for 2D surfaces.
pub const PITCH_ALIGN: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn pitch_bytes(&self) -> u32 {
        let row = self.width.max(1) * self.format.bytes_per_pixel();
        row.div_ceil(PITCH_ALIGN) * PITCH_ALIGN
    }

    pub fn size_bytes(&self) -> u64 {
        u64::from(self.pitch_bytes()) * u64::from(self.height.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer,
    Texture(TextureDesc),
}

const NO_OWNER: u64 = 0;

struct ResourceInner {
    id: BufferId,
    desc: BufferDesc,
    kind: ResourceKind,
    /// Context that last bound the resource for writing, or `NO_OWNER`.
    owner: AtomicU64,
    backend: Arc<dyn DeviceBackend>,
    _slot: Option<PoolSlot>,
}

impl Drop for ResourceInner {
    fn drop(&mut self) {
        trace!(buffer = ?self.id, "resource released");
        self.backend.buffer_destroy(self.id);
    }
}

#[derive(Clone)]
pub struct ResourceHandle(Arc<ResourceInner>);

impl ResourceHandle {
    pub(crate) fn create(
        backend: &Arc<dyn DeviceBackend>,
        pool: Option<&Arc<SlotPool>>,
        desc: BufferDesc,
        kind: ResourceKind,
    ) -> Result<Self, BackendError> {
        let id = backend.buffer_create(&desc)?;
        trace!(buffer = ?id, size = desc.size, ?kind, "resource created");
        Ok(Self(Arc::new(ResourceInner {
            id,
            desc,
            kind,
            owner: AtomicU64::new(NO_OWNER),
            backend: Arc::clone(backend),
            _slot: pool.map(|pool| pool.acquire()),
        })))
    }

    pub(crate) fn create_buffer(
        backend: &Arc<dyn DeviceBackend>,
        pool: Option<&Arc<SlotPool>>,
        size: u64,
        bind: BindFlags,
    ) -> Result<Self, BackendError> {
        Self::create(backend, pool, BufferDesc { size, bind }, ResourceKind::Buffer)
    }

    pub(crate) fn create_texture(
        backend: &Arc<dyn DeviceBackend>,
        pool: Option<&Arc<SlotPool>>,
        texture: TextureDesc,
        bind: BindFlags,
    ) -> Result<Self, BackendError> {
        let desc = BufferDesc {
            size: texture.size_bytes(),
            bind,
        };
        Self::create(backend, pool, desc, ResourceKind::Texture(texture))
    }

    pub fn id(&self) -> BufferId {
        self.0.id
    }

    pub fn size(&self) -> u64 {
        self.0.desc.size
    }

    pub fn bind(&self) -> BindFlags {
        self.0.desc.bind
    }

    pub fn kind(&self) -> ResourceKind {
        self.0.kind
    }

    pub fn texture(&self) -> Option<&TextureDesc> {
        match &self.0.kind {
            ResourceKind::Texture(desc) => Some(desc),
            ResourceKind::Buffer => None,
        }
    }

    /// Number of live handles, including pins held by unsubmitted command streams.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn owner(&self) -> Option<u64> {
        match self.0.owner.load(Ordering::Acquire) {
            NO_OWNER => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_owner(&self, context_id: u64) {
        self.0.owner.store(context_id, Ordering::Release);
    }

    pub fn ptr_eq(&self, other: &ResourceHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        self.0.backend.buffer_write(self.0.id, offset, data)
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>, BackendError> {
        self.0.backend.buffer_read(self.0.id, offset, len)
    }

    /// Block until the device no longer uses this resource.
    pub fn wait_idle(&self) {
        self.0.backend.buffer_wait(self.0.id);
    }
}

impl fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.0.id)
            .field("size", &self.0.desc.size)
            .field("kind", &self.0.kind)
            .field("refs", &self.ref_count())
            .finish()
    }
}
