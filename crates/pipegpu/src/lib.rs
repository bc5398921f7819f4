//! `pipegpu` is the context core of a driver for R300-R500 class GPUs.
//!
//! Currently this crate provides:
//! - A fixed-order registry of state atoms, each owning one hardware state group and the dword
//!   budget it may write (see [`registry::AtomRegistry`]).
//! - A budgeted command stream writer with relocation tracking (see [`cs::CommandStream`]).
//! - Rendering contexts that track dirty state and emit it ahead of draws, clears and queries
//!   (see [`Context`]).
//! - A per-screen pool coordinator that switches shared pools between single- and
//!   multi-threaded locking as contexts come and go (see [`pool::PoolCoordinator`]).
//! - Reference-counted GPU resources that stay alive while any context or pending submission
//!   still references them (see [`ResourceHandle`]).
//!
//! The device itself sits behind [`DeviceBackend`]; [`ImmediateDevice`] is an in-process
//! implementation for tests and tools.

mod upload;

pub mod atom;
pub mod backend;
pub mod caps;
pub mod config;
pub mod context;
pub mod cs;
pub mod emit;
pub mod error;
pub mod hyperz;
pub mod pool;
pub mod query;
pub mod registry;
pub mod resource;
pub mod screen;
pub mod state;
pub mod stats;
pub mod swtcl;
pub mod translate;

pub use backend::{
    BindFlags, BufferId, CsId, DeviceBackend, Fence, FenceCompletionMode, ImmediateDevice,
    RelocUsage,
};
pub use caps::{CapFlags, ChipFamily, DeviceCaps};
pub use config::{ContextConfig, DebugFlags};
pub use context::{ClearFlags, Context, Lifecycle};
pub use error::{BackendError, ContextError, CsError};
pub use query::QueryId;
pub use resource::{ResourceHandle, TextureDesc, TextureFormat};
pub use screen::{Screen, ScreenDescriptor};
pub use stats::{CollectingStatsSink, ContextStats, StatsSink};
pub use upload::{
    LinearArena, UploadAllocator, UploadAllocatorDescriptor, UploadSlice, UploadStats,
};
