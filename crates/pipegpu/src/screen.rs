//! Per-device state shared by every context.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::backend::{BindFlags, DeviceBackend};
use crate::caps::{CapFlags, DeviceCaps};
use crate::config::{ContextConfig, DebugFlags};
use crate::context::Context;
use crate::error::{BackendError, ContextError};
use crate::pool::{PoolCoordinator, ThreadSafety};
use crate::resource::{ResourceHandle, TextureDesc};
use crate::stats::StatsSink;

#[derive(Clone, Default)]
pub struct ScreenDescriptor {
    pub debug: DebugFlags,
    pub stats_sink: Option<Arc<dyn StatsSink>>,
}

impl ScreenDescriptor {
    /// Debug flags from `PIPEGPU_DEBUG`, no stats sink.
    pub fn from_env() -> Self {
        Self {
            debug: DebugFlags::from_env(),
            stats_sink: None,
        }
    }
}

pub struct Screen {
    backend: Arc<dyn DeviceBackend>,
    caps: DeviceCaps,
    debug: DebugFlags,
    pools: PoolCoordinator,
    stats_sink: Option<Arc<dyn StatsSink>>,
    next_context_id: AtomicU64,
}

impl Screen {
    pub fn new(backend: Arc<dyn DeviceBackend>, desc: ScreenDescriptor) -> Arc<Self> {
        let mut caps = backend.caps();
        if desc.debug.contains(DebugFlags::NO_HYPERZ) {
            caps = caps.without(CapFlags::CAN_HYPERZ);
        }
        info!(family = ?caps.family, flags = ?caps.flags, "screen created");
        Arc::new(Self {
            backend,
            caps,
            debug: desc.debug,
            pools: PoolCoordinator::new(),
            stats_sink: desc.stats_sink,
            next_context_id: AtomicU64::new(1),
        })
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn debug_flags(&self) -> DebugFlags {
        self.debug
    }

    pub fn pools(&self) -> &PoolCoordinator {
        &self.pools
    }

    pub fn stats_sink(&self) -> Option<&Arc<dyn StatsSink>> {
        self.stats_sink.as_ref()
    }

    pub fn live_contexts(&self) -> usize {
        self.pools.live_contexts()
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        self.pools.thread_safety()
    }

    pub(crate) fn allocate_context_id(&self) -> u64 {
        self.next_context_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn create_context(self: &Arc<Self>, config: ContextConfig) -> Result<Context, ContextError> {
        Context::create(Arc::clone(self), config)
    }

    /// Create a buffer that any context on this screen may reference.
    pub fn create_buffer(&self, size: u64, bind: BindFlags) -> Result<ResourceHandle, BackendError> {
        ResourceHandle::create_buffer(&self.backend, Some(self.pools.buffers()), size, bind)
    }

    pub fn create_texture(
        &self,
        desc: TextureDesc,
        bind: BindFlags,
    ) -> Result<ResourceHandle, BackendError> {
        ResourceHandle::create_texture(&self.backend, Some(self.pools.buffers()), desc, bind)
    }
}

impl fmt::Debug for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screen")
            .field("caps", &self.caps)
            .field("debug", &self.debug)
            .field("pools", &self.pools)
            .finish()
    }
}
