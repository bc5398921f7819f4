//! State atoms: the unit of dirty tracking and register emission.

use std::fmt;

use tracing::trace;

use crate::caps::DeviceCaps;
use crate::cs::CommandStream;
use crate::error::CsError;
use crate::state::PipelineState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AtomId {
    GpuFlush,
    AaState,
    FbState,
    HyperzState,
    ZtopState,
    DsaState,
    BlendState,
    BlendColorState,
    ScissorState,
    InvariantState,
    ViewportState,
    PvsFlush,
    VapInvariantState,
    VertexStreamState,
    VsState,
    VsConstants,
    ClipState,
    RsBlockState,
    RsState,
    FbStatePipelined,
    Fs,
    FsRcConstantState,
    FsConstants,
    TextureCacheInval,
    TexturesState,
    HizClear,
    ZmaskClear,
    QueryStart,
}

impl AtomId {
    pub const COUNT: usize = AtomId::QueryStart as usize + 1;

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            AtomId::GpuFlush => "gpu_flush",
            AtomId::AaState => "aa_state",
            AtomId::FbState => "fb_state",
            AtomId::HyperzState => "hyperz_state",
            AtomId::ZtopState => "ztop_state",
            AtomId::DsaState => "dsa_state",
            AtomId::BlendState => "blend_state",
            AtomId::BlendColorState => "blend_color_state",
            AtomId::ScissorState => "scissor_state",
            AtomId::InvariantState => "invariant_state",
            AtomId::ViewportState => "viewport_state",
            AtomId::PvsFlush => "pvs_flush",
            AtomId::VapInvariantState => "vap_invariant_state",
            AtomId::VertexStreamState => "vertex_stream_state",
            AtomId::VsState => "vs_state",
            AtomId::VsConstants => "vs_constants",
            AtomId::ClipState => "clip_state",
            AtomId::RsBlockState => "rs_block_state",
            AtomId::RsState => "rs_state",
            AtomId::FbStatePipelined => "fb_state_pipelined",
            AtomId::Fs => "fs",
            AtomId::FsRcConstantState => "fs_rc_constant_state",
            AtomId::FsConstants => "fs_constants",
            AtomId::TextureCacheInval => "texture_cache_inval",
            AtomId::TexturesState => "textures_state",
            AtomId::HizClear => "hiz_clear",
            AtomId::ZmaskClear => "zmask_clear",
            AtomId::QueryStart => "query_start",
        }
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Inputs shared by every emitter.
#[derive(Debug, Clone, Copy)]
pub struct EmitCtx<'a> {
    pub state: &'a PipelineState,
    pub caps: &'a DeviceCaps,
}

/// Writes an atom's registers. Must stay within the atom's declared size when it is non-zero.
pub type EmitFn = fn(&EmitCtx<'_>, &mut CommandStream) -> Result<(), CsError>;

pub struct Atom {
    id: AtomId,
    size: u32,
    dirty: bool,
    allow_null_state: bool,
    always_emit: bool,
    emit: EmitFn,
    emit_count: u64,
}

impl Atom {
    pub fn new(id: AtomId, size: u32, emit: EmitFn) -> Self {
        Self {
            id,
            size,
            dirty: false,
            allow_null_state: false,
            always_emit: false,
            emit,
            emit_count: 0,
        }
    }

    pub fn allowing_null_state(mut self, allow: bool) -> Self {
        self.allow_null_state = allow;
        self
    }

    pub fn always_emitted(mut self, always: bool) -> Self {
        self.always_emit = always;
        self
    }

    pub fn id(&self) -> AtomId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    /// Dword budget. Zero means the atom's cost is variable and unbounded.
    pub fn size(&self) -> u32 {
        self.size
    }

    pub(crate) fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn allow_null_state(&self) -> bool {
        self.allow_null_state
    }

    pub fn always_emit(&self) -> bool {
        self.always_emit
    }

    pub fn needs_emit(&self) -> bool {
        self.dirty || self.always_emit
    }

    pub fn emit_count(&self) -> u64 {
        self.emit_count
    }

    pub fn emitter(&self) -> EmitFn {
        self.emit
    }

    /// Emit the atom inside its own frame and clear the dirty flag.
    ///
    /// On failure the frame is rolled back and the atom stays dirty.
    pub fn emit(&mut self, ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> Result<u32, CsError> {
        cs.begin(self.name(), self.size)?;
        if let Err(err) = (self.emit)(ctx, cs) {
            cs.abort();
            return Err(err);
        }
        let written = cs.end()?;
        self.dirty = false;
        self.emit_count += 1;
        trace!(atom = self.name(), dwords = written, "atom emitted");
        Ok(written)
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("dirty", &self.dirty)
            .field("allow_null_state", &self.allow_null_state)
            .field("always_emit", &self.always_emit)
            .field("emit_count", &self.emit_count)
            .finish()
    }
}
