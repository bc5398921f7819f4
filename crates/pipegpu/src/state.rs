//! Pipeline state objects and the per-atom state blocks they feed.
//!
//! Caller-visible state objects (blend, depth/stencil/alpha, rasterizer, shaders, ...) are plain
//! values. [`PipelineState`] owns the block behind every atom; an atom whose block is `None` has
//! nothing bound yet.

use std::sync::Arc;

use pipegpu_protocol::regs;

use crate::atom::AtomId;
use crate::caps::DeviceCaps;
use crate::resource::ResourceHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFactor {
    Zero,
    #[default]
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DstAlpha,
    InvDstAlpha,
    DstColor,
    InvDstColor,
    ConstColor,
    InvConstColor,
}

impl BlendFactor {
    pub(crate) fn hw(self) -> u32 {
        match self {
            BlendFactor::Zero => 32,
            BlendFactor::One => 33,
            BlendFactor::SrcColor => 0,
            BlendFactor::InvSrcColor => 1,
            BlendFactor::SrcAlpha => 4,
            BlendFactor::InvSrcAlpha => 5,
            BlendFactor::DstAlpha => 6,
            BlendFactor::InvDstAlpha => 7,
            BlendFactor::DstColor => 2,
            BlendFactor::InvDstColor => 3,
            BlendFactor::ConstColor => 12,
            BlendFactor::InvConstColor => 13,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFunc {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendFunc {
    pub(crate) fn hw(self) -> u32 {
        match self {
            BlendFunc::Add => 0,
            BlendFunc::Subtract => 1,
            BlendFunc::ReverseSubtract => 2,
            BlendFunc::Min => 3,
            BlendFunc::Max => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub enabled: bool,
    pub rgb_func: BlendFunc,
    pub src_rgb: BlendFactor,
    pub dst_rgb: BlendFactor,
    pub alpha_func: BlendFunc,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    /// RGBA write mask, one bit per channel.
    pub color_mask: u8,
    pub dither: bool,
    pub logic_op: Option<u8>,
}

impl Default for BlendState {
    fn default() -> Self {
        Self {
            enabled: false,
            rgb_func: BlendFunc::Add,
            src_rgb: BlendFactor::One,
            dst_rgb: BlendFactor::Zero,
            alpha_func: BlendFunc::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            color_mask: 0xF,
            dither: false,
            logic_op: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BlendColor {
    pub color: [f32; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunc {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

impl CompareFunc {
    pub(crate) fn hw(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthState {
    pub enabled: bool,
    pub write: bool,
    pub func: CompareFunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StencilState {
    pub enabled: bool,
    pub func: CompareFunc,
    pub ref_value: u8,
    pub value_mask: u8,
    pub write_mask: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AlphaState {
    pub enabled: bool,
    pub func: CompareFunc,
    pub ref_value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DepthStencilAlphaState {
    pub depth: DepthState,
    /// Front and back face.
    pub stencil: [StencilState; 2],
    pub alpha: AlphaState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub cull: CullMode,
    pub front_ccw: bool,
    pub point_size: f32,
    pub line_width: f32,
    pub poly_offset: bool,
    pub flatshade: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            cull: CullMode::None,
            front_ccw: true,
            point_size: 1.0,
            line_width: 1.0,
            poly_offset: false,
            flatshade: false,
        }
    }
}

/// Inclusive-exclusive pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ScissorState {
    pub minx: u32,
    pub miny: u32,
    pub maxx: u32,
    pub maxy: u32,
}

impl ScissorState {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            minx: 0,
            miny: 0,
            maxx: width,
            maxy: height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportState {
    pub scale: [f32; 3],
    pub translate: [f32; 3],
}

impl ViewportState {
    /// Maps normalized device coordinates onto a `width` x `height` drawable.
    pub fn for_drawable(width: u32, height: u32) -> Self {
        let (w, h) = (width as f32 * 0.5, height as f32 * 0.5);
        Self {
            scale: [w, -h, 0.5],
            translate: [w, h, 0.5],
        }
    }
}

pub const MAX_CLIP_PLANES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClipState {
    pub planes: [[f32; 4]; MAX_CLIP_PLANES],
    /// One bit per enabled plane.
    pub enabled: u8,
}

#[derive(Debug, Clone, Default)]
pub struct FramebufferState {
    pub width: u32,
    pub height: u32,
    pub cbufs: Vec<ResourceHandle>,
    pub zsbuf: Option<ResourceHandle>,
}

impl FramebufferState {
    pub fn is_empty(&self) -> bool {
        self.cbufs.is_empty() && self.zsbuf.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFilter {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone)]
pub struct SamplerView {
    pub resource: ResourceHandle,
    pub filter: TextureFilter,
}

impl SamplerView {
    pub fn new(resource: ResourceHandle) -> Self {
        Self {
            resource,
            filter: TextureFilter::Nearest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VertexBuffer {
    pub resource: ResourceHandle,
    /// Bytes between consecutive vertices.
    pub stride: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float1,
    Float2,
    Float3,
    Float4,
    UByte4Norm,
}

impl VertexFormat {
    pub fn size_bytes(self) -> u32 {
        match self {
            VertexFormat::Float1 | VertexFormat::UByte4Norm => 4,
            VertexFormat::Float2 => 8,
            VertexFormat::Float3 => 12,
            VertexFormat::Float4 => 16,
        }
    }

    pub(crate) fn hw(self) -> u32 {
        match self {
            VertexFormat::Float1 => 0,
            VertexFormat::Float2 => 1,
            VertexFormat::Float3 => 2,
            VertexFormat::Float4 => 3,
            VertexFormat::UByte4Norm => 4 | (1 << 14),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexElement {
    pub buffer_index: u32,
    pub offset: u32,
    pub format: VertexFormat,
}

/// Hardware vertex program: four dwords per instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexShader {
    pub code: Vec<u32>,
    pub num_outputs: u32,
}

/// Runtime constant a fragment program asks the driver to fill in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RcConstant {
    Immediate([f32; 4]),
    /// `[1/width, 1/height, 0, 0]` of the texture bound to the unit.
    TexelSize { unit: u32 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FragmentShader {
    pub code: Vec<u32>,
    pub num_temps: u32,
    pub num_inputs: u32,
    pub rc_constants: Vec<RcConstant>,
    pub uses_texkill: bool,
    pub writes_depth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveMode {
    Points,
    Lines,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

impl PrimitiveMode {
    /// `VAP_VF_CNTL` primitive type.
    pub(crate) fn hw(self) -> u32 {
        match self {
            PrimitiveMode::Points => 1,
            PrimitiveMode::Lines => 2,
            PrimitiveMode::LineStrip => 3,
            PrimitiveMode::Triangles => 4,
            PrimitiveMode::TriangleFan => 5,
            PrimitiveMode::TriangleStrip => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    pub fn size_bytes(self) -> u32 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IndexBuffer {
    pub resource: ResourceHandle,
    pub format: IndexFormat,
    pub offset: u64,
}

// -------------------------------------------------------------------------------------------------
// Driver-owned blocks
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuFlushState {
    pub width: u32,
    pub height: u32,
    pub flush_clean: Vec<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AaState {
    pub aa_config: u32,
    pub aaresolve_ctl: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZtopState {
    pub enabled: bool,
}

/// Registers replayed verbatim from a block recorded at context initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrebuiltBlock {
    pub cb: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClipBlock {
    pub state: ClipState,
    /// Software-vertex variant: clipping disabled in hardware.
    pub swtcl_cb: Vec<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VertexStreamState {
    pub prog_stream_cntl: Vec<u32>,
    pub prog_stream_cntl_ext: Vec<u32>,
    pub vtx_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RsBlockState {
    pub ip: Vec<u32>,
    pub inst: Vec<u32>,
    pub count: u32,
    pub inst_count: u32,
}

#[derive(Debug, Clone, Default)]
pub struct TexturesState {
    pub views: Vec<SamplerView>,
    /// 1x1 view bound to unit 0 when a texkill program runs with no textures.
    pub texkill_fallback: Option<SamplerView>,
}

impl TexturesState {
    pub(crate) fn effective_views<'a>(&'a self, fs: Option<&FragmentShader>) -> Vec<&'a SamplerView> {
        if self.views.is_empty() {
            if let (Some(fallback), Some(true)) =
                (self.texkill_fallback.as_ref(), fs.map(|fs| fs.uses_texkill))
            {
                return vec![fallback];
            }
        }
        self.views.iter().collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstantBuffer {
    pub constants: Vec<[f32; 4]>,
}

impl ConstantBuffer {
    pub fn dwords(&self) -> &[u32] {
        bytemuck::cast_slice(&self.constants)
    }
}

/// Fast depth clear through the zmask or HiZ RAM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HyperzClear {
    pub offset: u32,
    pub pitch: u32,
    pub tiles: u32,
    pub value: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStartState {
    pub active: Option<u32>,
}

/// Every atom's state block.
#[derive(Debug, Default)]
pub struct PipelineState {
    pub gpu_flush: Option<GpuFlushState>,
    pub aa: Option<AaState>,
    pub fb: Option<FramebufferState>,
    pub hyperz: Option<PrebuiltBlock>,
    pub ztop: Option<ZtopState>,
    pub dsa: Option<DepthStencilAlphaState>,
    pub blend: Option<BlendState>,
    pub blend_color: Option<BlendColor>,
    pub scissor: Option<ScissorState>,
    pub invariant: Option<PrebuiltBlock>,
    pub viewport: Option<ViewportState>,
    pub vap_invariant: Option<PrebuiltBlock>,
    pub vertex_stream: Option<Arc<VertexStreamState>>,
    pub vs: Option<Arc<VertexShader>>,
    pub vs_constants: Option<ConstantBuffer>,
    pub clip: Option<ClipBlock>,
    pub rs_block: Option<RsBlockState>,
    pub rasterizer: Option<RasterizerState>,
    pub fs: Option<Arc<FragmentShader>>,
    pub fs_constants: Option<ConstantBuffer>,
    pub textures: Option<TexturesState>,
    pub hiz_clear: Option<HyperzClear>,
    pub zmask_clear: Option<HyperzClear>,
    pub query_start: Option<QueryStartState>,
}

impl PipelineState {
    /// Allocate the blocks the driver owns from creation. Caller-bound objects stay `None`.
    pub fn with_driver_blocks(caps: &DeviceCaps) -> Self {
        let clip = ClipBlock::default();
        Self {
            gpu_flush: Some(GpuFlushState::default()),
            aa: Some(AaState::default()),
            fb: Some(FramebufferState::default()),
            hyperz: Some(PrebuiltBlock::default()),
            ztop: Some(ZtopState::default()),
            blend_color: Some(BlendColor::default()),
            scissor: Some(ScissorState::default()),
            invariant: Some(PrebuiltBlock::default()),
            viewport: Some(ViewportState::default()),
            vap_invariant: Some(PrebuiltBlock::default()),
            vertex_stream: (!caps.has_tcl()).then(|| Arc::new(VertexStreamState::default())),
            vs_constants: Some(ConstantBuffer::default()),
            clip: Some(clip),
            rs_block: Some(RsBlockState::default()),
            fs_constants: Some(ConstantBuffer::default()),
            textures: Some(TexturesState::default()),
            query_start: Some(QueryStartState::default()),
            ..Self::default()
        }
    }
}

impl PipelineState {
    /// Whether the block behind `id` exists. Atoms without a block of their own report `false`.
    pub fn has_block(&self, id: AtomId) -> bool {
        match id {
            AtomId::GpuFlush => self.gpu_flush.is_some(),
            AtomId::AaState => self.aa.is_some(),
            AtomId::FbState | AtomId::FbStatePipelined => self.fb.is_some(),
            AtomId::HyperzState => self.hyperz.is_some(),
            AtomId::ZtopState => self.ztop.is_some(),
            AtomId::DsaState => self.dsa.is_some(),
            AtomId::BlendState => self.blend.is_some(),
            AtomId::BlendColorState => self.blend_color.is_some(),
            AtomId::ScissorState => self.scissor.is_some(),
            AtomId::InvariantState => self.invariant.is_some(),
            AtomId::ViewportState => self.viewport.is_some(),
            AtomId::VapInvariantState => self.vap_invariant.is_some(),
            AtomId::VertexStreamState => self.vertex_stream.is_some(),
            AtomId::VsState => self.vs.is_some(),
            AtomId::VsConstants => self.vs_constants.is_some(),
            AtomId::ClipState => self.clip.is_some(),
            AtomId::RsBlockState => self.rs_block.is_some(),
            AtomId::RsState => self.rasterizer.is_some(),
            AtomId::Fs | AtomId::FsRcConstantState => self.fs.is_some(),
            AtomId::FsConstants => self.fs_constants.is_some(),
            AtomId::TexturesState => self.textures.is_some(),
            AtomId::HizClear => self.hiz_clear.is_some(),
            AtomId::ZmaskClear => self.zmask_clear.is_some(),
            AtomId::QueryStart => self.query_start.is_some(),
            AtomId::PvsFlush | AtomId::TextureCacheInval => false,
        }
    }
}

/// Pack a float colour as `A8R8G8B8`.
pub(crate) fn pack_argb8888(color: [f32; 4]) -> u32 {
    let q = |c: f32| (c.clamp(0.0, 1.0) * 255.0 + 0.5) as u32;
    (q(color[3]) << 24) | (q(color[0]) << 16) | (q(color[1]) << 8) | q(color[2])
}

/// Packed scissor corner as the hardware expects it.
pub(crate) fn scissor_corner(x: u32, y: u32) -> u32 {
    const MASK: u32 = (1 << 13) - 1;
    (((x + regs::SCISSORS_OFFSET) & MASK) << regs::SCISSORS_X_SHIFT)
        | (((y + regs::SCISSORS_OFFSET) & MASK) << regs::SCISSORS_Y_SHIFT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::{CapFlags, ChipFamily};

    #[test]
    fn driver_blocks_leave_bound_objects_empty() {
        let state = PipelineState::with_driver_blocks(&DeviceCaps::new(ChipFamily::R300));
        assert!(state.fb.is_some());
        assert!(state.blend.is_none());
        assert!(state.dsa.is_none());
        assert!(state.fs.is_none());
        // Hardware TCL derives the vertex stream from bound vertex elements.
        assert!(state.vertex_stream.is_none());
    }

    #[test]
    fn software_tcl_owns_the_vertex_stream_block() {
        let caps = DeviceCaps::new(ChipFamily::R300).without(CapFlags::HAS_TCL);
        assert!(PipelineState::with_driver_blocks(&caps).vertex_stream.is_some());
    }

    #[test]
    fn argb_packing_clamps_and_orders_channels() {
        assert_eq!(pack_argb8888([1.0, 0.0, 0.0, 1.0]), 0xFFFF_0000);
        assert_eq!(pack_argb8888([2.0, -1.0, 1.0, 0.0]), 0x00FF_00FF);
    }

    #[test]
    fn constant_buffers_flatten_to_dwords() {
        let cb = ConstantBuffer {
            constants: vec![[1.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 2.0]],
        };
        let dwords = cb.dwords();
        assert_eq!(dwords.len(), 8);
        assert_eq!(dwords[0], 1.0f32.to_bits());
        assert_eq!(dwords[7], 2.0f32.to_bits());
    }
}
