//! Rendering context: owns a command stream, the atom registry and the pipeline state, and turns
//! state changes and draws into hardware packets.
//!
//! State setters only record the new object and mark the atoms that depend on it dirty. Nothing
//! reaches the command stream until a draw, clear, query end or explicit flush, at which point
//! every dirty atom is emitted in registry order ahead of the packet that needs it.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use pipegpu_protocol::packet::{
    PKT3_3D_CLEAR_COLOR, PKT3_3D_DRAW_INDX_2, PKT3_3D_DRAW_VBUF_2, PKT3_3D_LOAD_VBPNTR,
    RELOC_DWORDS,
};
use pipegpu_protocol::regs;
use tracing::{debug, info, trace, warn};

use crate::atom::{AtomId, EmitCtx};
use crate::backend::{BindFlags, CsId, Fence, RelocUsage};
use crate::caps::DeviceCaps;
use crate::config::{ContextConfig, DebugFlags};
use crate::cs::CommandStream;
use crate::emit;
use crate::error::{ContextError, CsError, Result};
use crate::hyperz::{ZmaskAllocator, ZmaskBlock, ZMASK_TILE};
use crate::pool::{SlotPool, ThreadSafety};
use crate::query::{QueryId, QueryList, QUERY_RESULT_SIZE};
use crate::registry::AtomRegistry;
use crate::resource::{ResourceHandle, TextureDesc, TextureFormat};
use crate::screen::Screen;
use crate::state::{
    pack_argb8888, BlendColor, BlendState, ClipState, ConstantBuffer, DepthStencilAlphaState,
    FragmentShader, FramebufferState, HyperzClear, IndexBuffer, IndexFormat, PipelineState,
    PrimitiveMode, QueryStartState, RasterizerState, RsBlockState, SamplerView, ScissorState,
    ShaderStage, VertexBuffer, VertexElement, VertexFormat, VertexShader, ViewportState,
};
use crate::stats::ContextStats;
use crate::swtcl::{QueueStage, RasterParams, SoftwarePipeline};
use crate::translate::TranslateCache;
use crate::upload::{UploadAllocator, UploadAllocatorDescriptor};

/// Vertex buffers one draw may reference.
pub const MAX_VERTEX_BUFFERS: usize = 16;

const VF_WALK_INDICES: u32 = 1 << 4;
const VF_WALK_VERTEX_LIST: u32 = 2 << 4;
const VF_INDEX_32BIT: u32 = 1 << 11;
const VF_NUM_VERTICES_SHIFT: u32 = 16;

/// Dwords of a `3D_LOAD_VBPNTR` packet for `buffers` vertex buffers, relocations included.
const fn vbpntr_dwords(buffers: usize) -> usize {
    2 + 2 * buffers + RELOC_DWORDS as usize * buffers
}

const DRAW_VBUF_DWORDS: usize = 2;
const DRAW_INDX_DWORDS: usize = 4 + RELOC_DWORDS as usize;
const CLEAR_COLOR_DWORDS: usize = 5;
const QUERY_END_DWORDS: usize = 2 + RELOC_DWORDS as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Created,
    /// Fully constructed, no caller state applied yet.
    Initialized,
    Active,
    Destroying,
    Destroyed,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClearFlags: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

pub struct Context {
    id: u64,
    screen: Arc<Screen>,
    config: ContextConfig,
    caps: DeviceCaps,
    lifecycle: Lifecycle,
    /// Counted in the screen's live-context total.
    registered: bool,

    cs_id: Option<CsId>,
    cs: Option<CommandStream>,
    atoms: Option<AtomRegistry>,
    state: PipelineState,

    swtcl: Option<SoftwarePipeline>,
    upload_ib: Option<UploadAllocator>,
    upload_vb: Option<UploadAllocator>,
    translate_cache: Option<TranslateCache>,
    zmask: Option<ZmaskAllocator>,
    zmask_block: Option<ZmaskBlock>,
    pool_transfers: Option<Arc<SlotPool>>,

    /// Buffer holding the most recent software-processed vertices.
    vbo: Option<ResourceHandle>,
    vertex_buffers: Vec<VertexBuffer>,
    vertex_elements: Vec<VertexElement>,
    queries: QueryList,

    drawable: (u32, u32),
    draws: u64,
    last_fence: Option<Fence>,
}

impl Context {
    /// Build a context on `screen`. Any failure tears down what was already built and returns
    /// the error; the screen's live-context count is left as it was.
    pub(crate) fn create(screen: Arc<Screen>, config: ContextConfig) -> Result<Self> {
        let caps = *screen.caps();
        let id = screen.allocate_context_id();
        let mut ctx = Self {
            id,
            screen,
            config,
            caps,
            lifecycle: Lifecycle::Created,
            registered: false,
            cs_id: None,
            cs: None,
            atoms: None,
            state: PipelineState::default(),
            swtcl: None,
            upload_ib: None,
            upload_vb: None,
            translate_cache: None,
            zmask: None,
            zmask_block: None,
            pool_transfers: None,
            vbo: None,
            vertex_buffers: Vec::new(),
            vertex_elements: Vec::new(),
            queries: QueryList::default(),
            drawable: (0, 0),
            draws: 0,
            last_fence: None,
        };

        // From here on `Drop` undoes whatever has been built.
        let live = ctx.screen.pools().context_created();
        ctx.registered = true;
        debug!(context = id, live, "context registered");

        ctx.pool_transfers = Some(Arc::new(SlotPool::new(
            "transfers",
            config.transfer_pool_block,
            ThreadSafety::SingleThreaded,
        )));

        ctx.init_command_stream()?;

        if !caps.has_tcl() {
            let mut pipeline = SoftwarePipeline::new(Box::new(QueueStage::default()));
            pipeline.set_wide_line_threshold(config.wide_line_threshold);
            pipeline.set_wide_point_threshold(config.wide_point_threshold);
            ctx.swtcl = Some(pipeline);
        }

        ctx.atoms = Some(AtomRegistry::new(&caps));
        ctx.state = PipelineState::with_driver_blocks(&caps);

        if caps.has_hyperz() {
            ctx.zmask = Some(ZmaskAllocator::new(caps.zmask_ram)?);
        }

        ctx.upload_ib = Some(ctx.create_uploader(
            "index upload",
            config.index_upload_size,
            BindFlags::INDEX_BUFFER,
        )?);
        ctx.upload_vb = Some(ctx.create_uploader(
            "vertex upload",
            config.vertex_upload_size,
            BindFlags::VERTEX_BUFFER,
        )?);

        ctx.translate_cache = Some(TranslateCache::new());

        ctx.init_states();

        if !caps.is_r500() {
            ctx.create_texkill_view()?;
        }

        ctx.refresh_variable_sizes();
        ctx.lifecycle = Lifecycle::Initialized;
        info!(context = id, family = ?caps.family, tcl = caps.has_tcl(), "context created");
        Ok(ctx)
    }

    fn init_command_stream(&mut self) -> Result<()> {
        let backend = Arc::clone(self.screen.backend());
        let cs_id = backend.cs_create().map_err(|err| {
            warn!(context = self.id, %err, "command stream creation failed");
            ContextError::Allocation("command stream")
        })?;
        self.cs_id = Some(cs_id);

        let mut cs = CommandStream::new(self.id, self.config.cs_capacity_dwords);
        let log_cs = self.screen.debug_flags().contains(DebugFlags::CS);
        cs.set_flush_handler(Box::new(move |submission| {
            if log_cs {
                info!(
                    context = submission.context_id,
                    dwords = submission.dwords.len(),
                    relocs = submission.relocs.len(),
                    "submitting command stream"
                );
            }
            backend.submit(cs_id, submission)
        }));
        self.cs = Some(cs);
        Ok(())
    }

    fn create_uploader(
        &self,
        label: &'static str,
        size: u64,
        bind: BindFlags,
    ) -> Result<UploadAllocator> {
        let desc = UploadAllocatorDescriptor {
            label,
            default_size: size,
            alignment: self.config.upload_alignment,
            bind,
        };
        UploadAllocator::new(
            desc,
            Arc::clone(self.screen.backend()),
            Some(Arc::clone(self.screen.pools().buffers())),
            self.pool_transfers.clone(),
        )
        .map_err(|err| {
            warn!(context = self.id, label, %err, "upload allocator creation failed");
            match err {
                ContextError::Backend(_) => ContextError::Allocation(label),
                other => other,
            }
        })
    }

    /// Record the fixed command blocks and give every always-present block an initial value.
    fn init_states(&mut self) {
        let caps = self.caps;
        let state = &mut self.state;
        if let Some(flush) = state.gpu_flush.as_mut() {
            flush.flush_clean = emit::build_flush_clean();
        }
        if let Some(invariant) = state.invariant.as_mut() {
            invariant.cb = emit::build_invariant(&caps);
        }
        if let Some(vap) = state.vap_invariant.as_mut() {
            vap.cb = emit::build_vap_invariant();
        }
        if let Some(hyperz) = state.hyperz.as_mut() {
            hyperz.cb = emit::build_hyperz(&caps);
        }
        if let Some(clip) = state.clip.as_mut() {
            if caps.has_tcl() {
                clip.state = ClipState::default();
            } else {
                clip.swtcl_cb = emit::build_swtcl_clip();
            }
        }
        state.blend_color = Some(BlendColor::default());
        state.scissor = Some(ScissorState::default());
        state.viewport = Some(ViewportState::for_drawable(0, 0));

        self.mark_dirty(&[
            AtomId::BlendColorState,
            AtomId::ScissorState,
            AtomId::ViewportState,
            AtomId::ClipState,
        ]);
    }

    /// 1x1 view bound to unit 0 when a texkill program runs with no textures. R300 to R400 lock
    /// up otherwise.
    fn create_texkill_view(&mut self) -> Result<()> {
        let texture = self
            .screen
            .create_texture(TextureDesc::new(1, 1, TextureFormat::I8), BindFlags::SAMPLER_VIEW)
            .map_err(|err| {
                warn!(context = self.id, %err, "texkill texture creation failed");
                ContextError::Allocation("texkill texture")
            })?;
        if let Some(textures) = self.state.textures.as_mut() {
            textures.texkill_fallback = Some(SamplerView::new(texture));
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn screen(&self) -> &Arc<Screen> {
        &self.screen
    }

    pub fn atoms(&self) -> Option<&AtomRegistry> {
        self.atoms.as_ref()
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn command_stream(&self) -> Option<&CommandStream> {
        self.cs.as_ref()
    }

    /// Dwords written but not yet submitted.
    pub fn pending_dwords(&self) -> usize {
        self.cs.as_ref().map_or(0, CommandStream::len)
    }

    pub fn drawable_size(&self) -> (u32, u32) {
        self.drawable
    }

    pub fn last_fence(&self) -> Option<Fence> {
        self.last_fence
    }

    pub fn queries(&self) -> &QueryList {
        &self.queries
    }

    pub fn transfer_pool(&self) -> Option<&Arc<SlotPool>> {
        self.pool_transfers.as_ref()
    }

    pub fn stats(&self) -> ContextStats {
        let upload_bytes = [&self.upload_ib, &self.upload_vb]
            .into_iter()
            .flatten()
            .map(|u| u.stats().bytes)
            .sum();
        ContextStats {
            context_id: self.id,
            flushes: self.cs.as_ref().map_or(0, CommandStream::flushes),
            submitted_dwords: self.cs.as_ref().map_or(0, CommandStream::submitted_dwords),
            draws: self.draws,
            upload_bytes,
            atoms: self
                .atoms
                .as_ref()
                .map(ContextStats::collect_atoms)
                .unwrap_or_default(),
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Dirty tracking
    // ---------------------------------------------------------------------------------------------

    fn mark_dirty(&mut self, ids: &[AtomId]) {
        if let Some(atoms) = self.atoms.as_mut() {
            for &id in ids {
                atoms.mark_dirty(id);
            }
        }
    }

    /// Recompute the budgets of atoms whose size depends on the bound state.
    fn refresh_variable_sizes(&mut self) {
        let Some(atoms) = self.atoms.as_mut() else {
            return;
        };
        for atom in atoms.iter_mut() {
            if let Some(size) = emit::variable_size(atom.id(), &self.state, &self.caps) {
                atom.set_size(size);
            }
        }
    }

    /// Atoms that need a block but lost it while dirty have nothing left to send.
    fn forget_unbound(&mut self) {
        let Some(atoms) = self.atoms.as_mut() else {
            return;
        };
        let unbound: Vec<AtomId> = atoms
            .iter()
            .filter(|atom| {
                atom.is_dirty() && !atom.allow_null_state() && !self.state.has_block(atom.id())
            })
            .map(|atom| atom.id())
            .collect();
        for id in unbound {
            trace!(context = self.id, atom = id.name(), "block unbound, emission dropped");
            atoms.mark_clean(id);
        }
    }

    fn state_changed(&mut self, ids: &[AtomId]) {
        self.mark_dirty(ids);
        self.forget_unbound();
        self.refresh_variable_sizes();
        if self.lifecycle == Lifecycle::Initialized {
            self.lifecycle = Lifecycle::Active;
        }
    }

    // ---------------------------------------------------------------------------------------------
    // State setters
    // ---------------------------------------------------------------------------------------------

    pub fn bind_blend_state(&mut self, blend: Option<BlendState>) {
        let bound = blend.is_some();
        self.state.blend = blend;
        self.state_changed(if bound { &[AtomId::BlendState] } else { &[] });
    }

    pub fn set_blend_color(&mut self, color: BlendColor) {
        self.state.blend_color = Some(color);
        self.state_changed(&[AtomId::BlendColorState]);
    }

    pub fn bind_dsa_state(&mut self, dsa: Option<DepthStencilAlphaState>) {
        let bound = dsa.is_some();
        self.state.dsa = dsa;
        self.update_ztop();
        if bound {
            self.state_changed(&[AtomId::DsaState, AtomId::ZtopState]);
        } else {
            self.state_changed(&[AtomId::ZtopState]);
        }
    }

    pub fn bind_rasterizer_state(&mut self, rasterizer: Option<RasterizerState>) {
        let bound = rasterizer.is_some();
        self.state.rasterizer = rasterizer;
        self.state_changed(if bound { &[AtomId::RsState] } else { &[] });
    }

    pub fn set_scissor_state(&mut self, scissor: ScissorState) -> Result<()> {
        if scissor.minx > scissor.maxx || scissor.miny > scissor.maxy {
            return Err(ContextError::BadArgument("scissor rectangle is inverted"));
        }
        self.state.scissor = Some(scissor);
        self.state_changed(&[AtomId::ScissorState]);
        Ok(())
    }

    pub fn set_viewport_state(&mut self, viewport: ViewportState) {
        self.state.viewport = Some(viewport);
        self.state_changed(&[AtomId::ViewportState]);
    }

    /// User clip planes. Without hardware TCL clipping stays disabled on the chip and the
    /// planes are only recorded.
    pub fn set_clip_state(&mut self, clip: ClipState) {
        let tcl = self.caps.has_tcl();
        if let Some(block) = self.state.clip.as_mut() {
            block.state = clip;
        }
        self.state_changed(if tcl { &[AtomId::ClipState] } else { &[] });
    }

    pub fn set_framebuffer_state(&mut self, fb: FramebufferState) -> Result<()> {
        if fb.cbufs.len() > regs::MAX_COLOR_BUFFERS {
            return Err(ContextError::BadArgument("too many colour buffers"));
        }
        if fb.cbufs.iter().any(|cbuf| cbuf.texture().is_none()) {
            return Err(ContextError::BadArgument("colour buffers must be textures"));
        }
        if let Some(zs) = &fb.zsbuf {
            if !zs.texture().is_some_and(|desc| desc.format.is_depth()) {
                return Err(ContextError::BadArgument(
                    "depth buffer must be a depth texture",
                ));
            }
        }

        for surface in fb.cbufs.iter().chain(fb.zsbuf.iter()) {
            surface.set_owner(self.id);
        }

        if let (Some(mm), Some(block)) = (self.zmask.as_mut(), self.zmask_block.take()) {
            mm.release(block);
        }
        if let (Some(mm), Some(_)) = (self.zmask.as_mut(), fb.zsbuf.as_ref()) {
            self.zmask_block = mm.alloc(ZmaskAllocator::units_for(fb.width, fb.height));
            if self.zmask_block.is_none() {
                debug!(context = self.id, "no zmask RAM left, fast depth clears disabled");
            }
        }

        if let Some(flush) = self.state.gpu_flush.as_mut() {
            flush.width = fb.width;
            flush.height = fb.height;
        }
        self.state.fb = Some(fb);
        self.state_changed(&[
            AtomId::GpuFlush,
            AtomId::AaState,
            AtomId::FbState,
            AtomId::HyperzState,
            AtomId::ZtopState,
            AtomId::FbStatePipelined,
        ]);
        Ok(())
    }

    pub fn set_sampler_views(&mut self, views: Vec<SamplerView>) -> Result<()> {
        if views.len() > regs::MAX_TEXTURE_UNITS {
            return Err(ContextError::BadArgument("too many sampler views"));
        }
        if views.iter().any(|view| view.resource.texture().is_none()) {
            return Err(ContextError::BadArgument("sampler views need a texture"));
        }
        if let Some(textures) = self.state.textures.as_mut() {
            textures.views = views;
        }
        self.state_changed(&[
            AtomId::TextureCacheInval,
            AtomId::TexturesState,
            AtomId::FsRcConstantState,
        ]);
        Ok(())
    }

    pub fn set_vertex_buffers(&mut self, buffers: Vec<VertexBuffer>) -> Result<()> {
        if buffers.len() > MAX_VERTEX_BUFFERS {
            return Err(ContextError::BadArgument("too many vertex buffers"));
        }
        self.vertex_buffers = buffers;
        self.state_changed(&[]);
        Ok(())
    }

    pub fn bind_vertex_elements(&mut self, elements: Vec<VertexElement>) -> Result<()> {
        if elements.len() > MAX_VERTEX_BUFFERS {
            return Err(ContextError::BadArgument("too many vertex elements"));
        }
        if self.caps.has_tcl() {
            let cache = self
                .translate_cache
                .as_mut()
                .ok_or(ContextError::InvalidState("context is not initialized"))?;
            self.state.vertex_stream = Some(cache.get(&elements));
            self.vertex_elements = elements;
            self.state_changed(&[AtomId::VertexStreamState]);
        } else {
            // The software path derives the stream layout from its own output.
            self.vertex_elements = elements;
            self.state_changed(&[]);
        }
        Ok(())
    }

    pub fn bind_vs_state(&mut self, vs: Option<VertexShader>) -> Result<()> {
        let Some(vs) = vs else {
            self.state.vs = None;
            self.state_changed(&[]);
            return Ok(());
        };
        if vs.code.len() % 4 != 0 {
            return Err(ContextError::BadArgument(
                "vertex program code is not whole instructions",
            ));
        }
        self.state.vs = Some(Arc::new(vs));
        if self.caps.has_tcl() {
            self.update_rs_block();
            self.state_changed(&[AtomId::PvsFlush, AtomId::VsState, AtomId::RsBlockState]);
        } else {
            self.state_changed(&[]);
        }
        Ok(())
    }

    pub fn bind_fs_state(&mut self, fs: Option<FragmentShader>) {
        let Some(fs) = fs else {
            self.state.fs = None;
            self.state_changed(&[]);
            return;
        };
        self.state.fs = Some(Arc::new(fs));
        self.update_ztop();
        self.update_rs_block();
        self.state_changed(&[
            AtomId::ZtopState,
            AtomId::RsBlockState,
            AtomId::Fs,
            AtomId::FsRcConstantState,
            AtomId::FsConstants,
            AtomId::TexturesState,
        ]);
    }

    pub fn set_constant_buffer(&mut self, stage: ShaderStage, constants: ConstantBuffer) {
        match stage {
            ShaderStage::Vertex => {
                self.state.vs_constants = Some(constants);
                let tcl = self.caps.has_tcl();
                self.state_changed(if tcl { &[AtomId::VsConstants] } else { &[] });
            }
            ShaderStage::Fragment => {
                self.state.fs_constants = Some(constants);
                self.state_changed(&[AtomId::FsRcConstantState, AtomId::FsConstants]);
            }
        }
    }

    /// Resize the drawable. Viewport and scissor follow the new size.
    pub fn resize_buffers(&mut self, width: i32, height: i32) -> Result<()> {
        if width < 0 || height < 0 {
            return Err(ContextError::BadArgument(
                "drawable size must not be negative",
            ));
        }
        let (width, height) = (width as u32, height as u32);
        self.drawable = (width, height);
        self.state.viewport = Some(ViewportState::for_drawable(width, height));
        self.state.scissor = Some(ScissorState::full(width, height));
        self.state_changed(&[AtomId::ViewportState, AtomId::ScissorState]);
        Ok(())
    }

    /// Early Z is only safe when nothing after the depth test can kill or move a fragment.
    fn update_ztop(&mut self) {
        let alpha_test = self.state.dsa.as_ref().is_some_and(|dsa| dsa.alpha.enabled);
        let fs_blocks = self
            .state
            .fs
            .as_ref()
            .is_some_and(|fs| fs.uses_texkill || fs.writes_depth);
        if let Some(ztop) = self.state.ztop.as_mut() {
            ztop.enabled = !alpha_test && !fs_blocks;
        }
    }

    /// Route vertex outputs to fragment inputs, one interpolator per input.
    fn update_rs_block(&mut self) {
        let inputs = self.state.fs.as_ref().map_or(0, |fs| fs.num_inputs);
        let outputs = match &self.state.vs {
            Some(vs) if self.caps.has_tcl() => vs.num_outputs,
            _ => inputs,
        };
        let count = inputs.min(outputs);
        self.state.rs_block = Some(RsBlockState {
            ip: (0..count).map(|i| (i * 4) | (0xF << 24)).collect(),
            inst: (0..count).map(|i| i | (1 << 3)).collect(),
            count: (count * 4) | (1 << 18),
            inst_count: count.saturating_sub(1),
        });
    }

    // ---------------------------------------------------------------------------------------------
    // Emission
    // ---------------------------------------------------------------------------------------------

    fn cs_mut(&mut self) -> Result<&mut CommandStream> {
        self.cs
            .as_mut()
            .ok_or(ContextError::InvalidState("context is not initialized"))
    }

    /// Emit every atom that needs it, in registry order.
    fn emit_dirty_state(&mut self) -> Result<()> {
        let (Some(atoms), Some(cs)) = (self.atoms.as_mut(), self.cs.as_mut()) else {
            return Err(ContextError::InvalidState("context is not initialized"));
        };
        let ctx = EmitCtx {
            state: &self.state,
            caps: &self.caps,
        };
        for atom in atoms.iter_mut() {
            if !atom.needs_emit() {
                continue;
            }
            if !atom.allow_null_state() && !self.state.has_block(atom.id()) {
                debug_assert!(false, "atom `{}` is dirty without a state block", atom.name());
                warn!(context = self.id, atom = atom.name(), "skipping atom with no state");
                continue;
            }
            atom.emit(&ctx, cs)?;
        }
        Ok(())
    }

    /// Make room for the dirty atoms plus `extra` dwords, flushing first if they do not fit.
    fn reserve(&mut self, extra: usize) -> Result<()> {
        let pending = self
            .atoms
            .as_ref()
            .map_or(0, AtomRegistry::pending_dwords);
        let needed = pending + extra;
        let cs = self.cs_mut()?;
        if needed <= cs.remaining() {
            return Ok(());
        }
        if needed > cs.capacity() {
            return Err(CsError::Full {
                requested: needed,
                remaining: cs.remaining(),
            }
            .into());
        }
        debug!(context = self.id, needed, "command stream full, flushing early");
        self.submit()?;
        Ok(())
    }

    /// Submit what is already in the stream.
    ///
    /// A backend failure consumes the stream, so every atom with state behind it is dirtied again
    /// for the next one.
    fn submit(&mut self) -> Result<Option<Fence>> {
        let fence = match self.cs_mut()?.flush() {
            Ok(fence) => fence,
            Err(CsError::Backend(err)) => {
                warn!(context = self.id, %err, "submission failed, state will be re-emitted");
                if let Some(atoms) = self.atoms.as_mut() {
                    for atom in atoms.iter_mut() {
                        if atom.allow_null_state() || self.state.has_block(atom.id()) {
                            atom.mark_dirty();
                        }
                    }
                }
                return Err(CsError::Backend(err).into());
            }
            Err(err) => return Err(err.into()),
        };
        if let Some(fence) = fence {
            self.last_fence = Some(fence);
            for upload in [&mut self.upload_ib, &mut self.upload_vb].into_iter().flatten() {
                upload.flush();
            }
        }
        Ok(fence)
    }

    /// Run `write` inside a frame of `dwords`, rolling back if it fails.
    fn emit_frame(
        &mut self,
        name: &'static str,
        dwords: usize,
        write: impl FnOnce(&mut CommandStream) -> std::result::Result<(), CsError>,
    ) -> Result<()> {
        let cs = self.cs_mut()?;
        cs.begin(name, dwords as u32)?;
        match write(cs) {
            Ok(()) => {
                cs.end()?;
                Ok(())
            }
            Err(err) => {
                cs.abort();
                Err(err.into())
            }
        }
    }

    /// Emit dirty state, then submit. Returns `None` when there was nothing to send.
    ///
    /// Dirty state that does not fit behind the commands already queued goes out in a stream of
    /// its own.
    pub fn flush(&mut self) -> Result<Option<Fence>> {
        self.reserve(0)?;
        self.emit_dirty_state()?;
        self.submit()
    }

    pub fn wait_fence(&self, fence: Fence) {
        self.screen.backend().fence_wait(fence);
    }

    /// Block until the GPU is done with the bound colour buffer 0, or the depth buffer when no
    /// colour buffer is bound. Returns immediately with no framebuffer.
    pub fn finish(&self) {
        let Some(fb) = &self.state.fb else {
            return;
        };
        if let Some(cbuf) = fb.cbufs.first() {
            cbuf.wait_idle();
        } else if let Some(zs) = &fb.zsbuf {
            zs.wait_idle();
        }
    }

    // ---------------------------------------------------------------------------------------------
    // Draws
    // ---------------------------------------------------------------------------------------------

    fn validate_draw(&self) -> Result<()> {
        if self.state.fb.as_ref().map_or(true, FramebufferState::is_empty) {
            return Err(ContextError::MissingState("framebuffer"));
        }
        if self.state.fs.is_none() {
            return Err(ContextError::MissingState("fragment shader"));
        }
        if self.caps.has_tcl() && self.state.vs.is_none() {
            return Err(ContextError::MissingState("vertex shader"));
        }
        Ok(())
    }

    fn draw_done(&mut self) {
        self.draws += 1;
        if self.lifecycle == Lifecycle::Initialized {
            self.lifecycle = Lifecycle::Active;
        }
    }

    pub fn draw_arrays(&mut self, mode: PrimitiveMode, start: u32, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.validate_draw()?;
        if !self.caps.has_tcl() {
            let (vertices, stride) = self.read_software_vertices(start, count)?;
            return self.render_software(mode, &vertices, stride);
        }
        if self.vertex_buffers.is_empty() {
            return Err(ContextError::MissingState("vertex buffers"));
        }
        if self.state.vertex_stream.is_none() {
            return Err(ContextError::MissingState("vertex elements"));
        }
        let buffers = self.vertex_buffers.clone();
        self.emit_draw_arrays(mode, &buffers, start, count)
    }

    fn emit_draw_arrays(
        &mut self,
        mode: PrimitiveMode,
        buffers: &[VertexBuffer],
        start: u32,
        count: u32,
    ) -> Result<()> {
        let dwords = vbpntr_dwords(buffers.len()) + DRAW_VBUF_DWORDS;
        self.reserve(dwords)?;
        self.emit_dirty_state()?;
        self.emit_frame("draw_arrays", dwords, |cs| {
            emit_vertex_arrays(cs, buffers, start)?;
            cs.out_pkt3(
                PKT3_3D_DRAW_VBUF_2,
                &[mode.hw() | VF_WALK_VERTEX_LIST | (count << VF_NUM_VERTICES_SHIFT)],
            )
        })?;
        self.draw_done();
        Ok(())
    }

    /// Indexed draw of `count` indices starting at index `start` of `indices`.
    pub fn draw_elements(
        &mut self,
        mode: PrimitiveMode,
        indices: &IndexBuffer,
        start: u32,
        count: u32,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.validate_draw()?;
        let index_size = u64::from(indices.format.size_bytes());
        let first = indices.offset + u64::from(start) * index_size;
        if first + u64::from(count) * index_size > indices.resource.size() {
            return Err(ContextError::BadArgument("index range exceeds the buffer"));
        }
        if !self.caps.has_tcl() {
            let (vertices, stride) = self.gather_software_vertices(indices, first, count)?;
            return self.render_software(mode, &vertices, stride);
        }
        if self.vertex_buffers.is_empty() {
            return Err(ContextError::MissingState("vertex buffers"));
        }
        if self.state.vertex_stream.is_none() {
            return Err(ContextError::MissingState("vertex elements"));
        }

        let buffers = self.vertex_buffers.clone();
        let dwords = vbpntr_dwords(buffers.len()) + DRAW_INDX_DWORDS;
        self.reserve(dwords)?;
        self.emit_dirty_state()?;
        let index_flag = match indices.format {
            IndexFormat::U16 => 0,
            IndexFormat::U32 => VF_INDEX_32BIT,
        };
        let resource = indices.resource.clone();
        self.emit_frame("draw_elements", dwords, |cs| {
            emit_vertex_arrays(cs, &buffers, 0)?;
            cs.out_pkt3(
                PKT3_3D_DRAW_INDX_2,
                &[
                    mode.hw() | VF_WALK_INDICES | index_flag | (count << VF_NUM_VERTICES_SHIFT),
                    first as u32,
                    count,
                ],
            )?;
            cs.out_reloc(&resource, RelocUsage::READ)
        })?;
        self.draw_done();
        Ok(())
    }

    /// Indexed draw from caller memory. The indices are copied into the index upload buffer.
    pub fn draw_elements_user(&mut self, mode: PrimitiveMode, indices: &[u16]) -> Result<()> {
        if indices.is_empty() {
            return Ok(());
        }
        self.validate_draw()?;
        let upload = self
            .upload_ib
            .as_mut()
            .ok_or(ContextError::InvalidState("context is not initialized"))?;
        let slice = upload.upload(bytemuck::cast_slice(indices))?;
        let buffer = IndexBuffer {
            resource: slice.buffer,
            format: IndexFormat::U16,
            offset: slice.offset,
        };
        self.draw_elements(mode, &buffer, 0, indices.len() as u32)
    }

    /// Draw vertices held in caller memory, `stride` floats each. On chips with hardware TCL the
    /// data is uploaded and read through the bound vertex elements.
    pub fn draw_user_vertices(
        &mut self,
        mode: PrimitiveMode,
        vertices: &[f32],
        stride: usize,
    ) -> Result<()> {
        if vertices.is_empty() {
            return Ok(());
        }
        if stride == 0 || vertices.len() % stride != 0 {
            return Err(ContextError::BadArgument(
                "vertex data is not a whole number of vertices",
            ));
        }
        self.validate_draw()?;
        if !self.caps.has_tcl() {
            return self.render_software(mode, vertices, stride);
        }
        if self.state.vertex_stream.is_none() {
            return Err(ContextError::MissingState("vertex elements"));
        }
        let upload = self
            .upload_vb
            .as_mut()
            .ok_or(ContextError::InvalidState("context is not initialized"))?;
        let slice = upload.upload(bytemuck::cast_slice(vertices))?;
        let buffers = [VertexBuffer {
            resource: slice.buffer,
            stride: (stride * 4) as u32,
            offset: slice.offset,
        }];
        self.emit_draw_arrays(mode, &buffers, 0, (vertices.len() / stride) as u32)
    }

    fn software_source(&self) -> Result<&VertexBuffer> {
        let vb = self
            .vertex_buffers
            .first()
            .ok_or(ContextError::MissingState("vertex buffers"))?;
        if vb.stride == 0 || vb.stride % 4 != 0 {
            return Err(ContextError::BadArgument(
                "software vertices must be whole floats",
            ));
        }
        Ok(vb)
    }

    fn read_software_vertices(&self, start: u32, count: u32) -> Result<(Vec<f32>, usize)> {
        let vb = self.software_source()?;
        let stride = u64::from(vb.stride);
        let bytes = vb
            .resource
            .read(vb.offset + u64::from(start) * stride, u64::from(count) * stride)?;
        Ok((
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            (vb.stride / 4) as usize,
        ))
    }

    fn gather_software_vertices(
        &self,
        indices: &IndexBuffer,
        first: u64,
        count: u32,
    ) -> Result<(Vec<f32>, usize)> {
        let index_size = indices.format.size_bytes() as usize;
        let raw = indices
            .resource
            .read(first, u64::from(count) * index_size as u64)?;
        let index_values: Vec<u32> = raw
            .chunks_exact(index_size)
            .map(|c| match indices.format {
                IndexFormat::U16 => u32::from(u16::from_le_bytes([c[0], c[1]])),
                IndexFormat::U32 => u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
            })
            .collect();

        let vb = self.software_source()?;
        let stride_bytes = vb.stride as usize;
        let source = vb
            .resource
            .read(vb.offset, vb.resource.size().saturating_sub(vb.offset))?;
        let mut vertices = Vec::with_capacity(index_values.len() * stride_bytes / 4);
        for index in index_values {
            let begin = index as usize * stride_bytes;
            let vertex = source
                .get(begin..begin + stride_bytes)
                .ok_or(ContextError::BadArgument("index past the end of the vertex buffer"))?;
            vertices.extend(
                vertex
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
            );
        }
        Ok((vertices, stride_bytes / 4))
    }

    /// Push vertices through the software pipeline and draw what comes out.
    fn render_software(&mut self, mode: PrimitiveMode, vertices: &[f32], stride: usize) -> Result<()> {
        let raster = self
            .state
            .rasterizer
            .as_ref()
            .map(|rs| RasterParams {
                line_width: rs.line_width,
                point_size: rs.point_size,
            })
            .unwrap_or_default();
        let pipeline = self
            .swtcl
            .as_mut()
            .ok_or(ContextError::InvalidState("no software vertex pipeline"))?;
        pipeline.run(mode, vertices, stride, &raster)?;
        for batch in pipeline.take_batches() {
            let upload = self
                .upload_vb
                .as_mut()
                .ok_or(ContextError::InvalidState("context is not initialized"))?;
            let slice = upload.upload(bytemuck::cast_slice(&batch.vertices))?;
            self.bind_software_stream(batch.stride)?;
            self.vbo = Some(slice.buffer.clone());
            let buffers = [VertexBuffer {
                resource: slice.buffer,
                stride: (batch.stride * 4) as u32,
                offset: slice.offset,
            }];
            self.emit_draw_arrays(batch.mode, &buffers, 0, batch.vertex_count() as u32)?;
        }
        Ok(())
    }

    /// Stream layout for software vertices of `stride` floats: four floats per attribute.
    fn bind_software_stream(&mut self, stride: usize) -> Result<()> {
        let elements: Vec<VertexElement> = (0..stride.div_ceil(4))
            .map(|i| VertexElement {
                buffer_index: 0,
                offset: (i * 16) as u32,
                format: match (stride - i * 4).min(4) {
                    1 => VertexFormat::Float1,
                    2 => VertexFormat::Float2,
                    3 => VertexFormat::Float3,
                    _ => VertexFormat::Float4,
                },
            })
            .collect();
        let cache = self
            .translate_cache
            .as_mut()
            .ok_or(ContextError::InvalidState("context is not initialized"))?;
        let stream = cache.get(&elements);
        let unchanged = self
            .state
            .vertex_stream
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, &stream));
        if !unchanged {
            self.state.vertex_stream = Some(stream);
            self.state_changed(&[AtomId::VertexStreamState]);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Clears
    // ---------------------------------------------------------------------------------------------

    /// Clear the bound surfaces. A depth-only clear of a buffer that owns zmask RAM goes through
    /// the hyper-Z clear atoms; everything else uses a clear packet.
    pub fn clear(
        &mut self,
        buffers: ClearFlags,
        color: [f32; 4],
        depth: f64,
        stencil: u8,
    ) -> Result<()> {
        if buffers.is_empty() {
            return Ok(());
        }
        let fb = self
            .state
            .fb
            .as_ref()
            .filter(|fb| !fb.is_empty())
            .ok_or(ContextError::MissingState("framebuffer"))?;
        if buffers.contains(ClearFlags::COLOR) && fb.cbufs.is_empty() {
            return Err(ContextError::MissingState("colour buffer"));
        }
        if buffers.intersects(ClearFlags::DEPTH | ClearFlags::STENCIL) && fb.zsbuf.is_none() {
            return Err(ContextError::MissingState("depth buffer"));
        }

        let depth_value = (depth.clamp(0.0, 1.0) * f64::from(0x00FF_FFFF)) as u32;
        let mut remaining = buffers;

        let fast_depth = buffers.contains(ClearFlags::DEPTH) && !buffers.contains(ClearFlags::STENCIL);
        let zmask_present = self
            .atoms
            .as_ref()
            .is_some_and(|atoms| atoms.contains(AtomId::ZmaskClear));
        if let (true, true, Some(block)) = (fast_depth, zmask_present, self.zmask_block) {
            let clear = HyperzClear {
                offset: block.offset,
                pitch: fb.width.div_ceil(ZMASK_TILE),
                tiles: block.size,
                value: depth_value,
            };
            let hiz_present = self
                .atoms
                .as_ref()
                .is_some_and(|atoms| atoms.contains(AtomId::HizClear));
            self.state.zmask_clear = Some(clear);
            if hiz_present {
                self.state.hiz_clear = Some(clear);
                self.state_changed(&[AtomId::HyperzState, AtomId::HizClear, AtomId::ZmaskClear]);
            } else {
                self.state_changed(&[AtomId::HyperzState, AtomId::ZmaskClear]);
            }
            remaining.remove(ClearFlags::DEPTH);
            debug!(context = self.id, tiles = block.size, "fast depth clear");
        }

        if remaining.is_empty() {
            self.reserve(0)?;
            self.emit_dirty_state()?;
        } else {
            self.reserve(CLEAR_COLOR_DWORDS)?;
            self.emit_dirty_state()?;
            let payload = [
                remaining.bits(),
                pack_argb8888(color),
                depth_value,
                u32::from(stencil),
            ];
            self.emit_frame("clear", CLEAR_COLOR_DWORDS, |cs| {
                cs.out_pkt3(PKT3_3D_CLEAR_COLOR, &payload)
            })?;
        }
        if self.lifecycle == Lifecycle::Initialized {
            self.lifecycle = Lifecycle::Active;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------------
    // Occlusion queries
    // ---------------------------------------------------------------------------------------------

    pub fn create_query(&mut self) -> Result<QueryId> {
        let result = self
            .screen
            .create_buffer(QUERY_RESULT_SIZE, BindFlags::QUERY)?;
        Ok(self.queries.insert(result))
    }

    pub fn begin_query(&mut self, id: QueryId) -> Result<()> {
        self.queries.begin(id)?;
        self.state.query_start = Some(QueryStartState { active: Some(id.0) });
        self.state_changed(&[AtomId::QueryStart]);
        Ok(())
    }

    /// Stop counting and have the GPU write the per-pipe counts into the query's buffer.
    pub fn end_query(&mut self, id: QueryId) -> Result<()> {
        let result = self.queries.end(id)?;
        self.reserve(QUERY_END_DWORDS)?;
        // A begin that never reached the stream still has to start the counters.
        self.emit_dirty_state()?;
        self.state.query_start = Some(QueryStartState { active: None });
        self.emit_frame("query_end", QUERY_END_DWORDS, |cs| {
            cs.out_reg(regs::ZB_ZPASS_ADDR, 0)?;
            cs.out_reloc(&result, RelocUsage::WRITE)
        })
    }

    pub fn destroy_query(&mut self, id: QueryId) -> Result<()> {
        if self.queries.current() == Some(id) {
            self.state.query_start = Some(QueryStartState { active: None });
        }
        self.queries.remove(id).map(drop)
    }

    /// Samples that passed the depth test, summed over every pipe. Flushes and waits.
    pub fn get_query_result(&mut self, id: QueryId) -> Result<u64> {
        let query = self
            .queries
            .get(id)
            .ok_or(ContextError::BadArgument("unknown query"))?;
        if !query.ended {
            return Err(ContextError::InvalidState("query has not ended"));
        }
        let result = query.result.clone();
        self.flush()?;
        result.wait_idle();
        let bytes = result.read(0, QUERY_RESULT_SIZE)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u64::from(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .sum())
    }

    // ---------------------------------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------------------------------

    /// Destroy the context and return its final counters.
    pub fn destroy(mut self) -> ContextStats {
        self.teardown()
    }

    fn teardown(&mut self) -> ContextStats {
        if self.lifecycle == Lifecycle::Destroyed {
            return self.stats();
        }
        self.lifecycle = Lifecycle::Destroying;

        self.swtcl = None;

        let stats = self.stats();
        if self.atoms.is_some() {
            self.report_stats(&stats);
        }

        self.upload_vb = None;
        self.upload_ib = None;
        self.translate_cache = None;

        self.release_referenced_objects();

        if let (Some(mm), Some(block)) = (self.zmask.as_mut(), self.zmask_block.take()) {
            mm.release(block);
        }
        self.zmask = None;

        if let Some(mut cs) = self.cs.take() {
            cs.abort();
            if let Err(err) = cs.flush() {
                warn!(context = self.id, %err, "final flush failed");
            }
        }
        if let Some(cs_id) = self.cs_id.take() {
            self.screen.backend().cs_destroy(cs_id);
        }

        self.pool_transfers = None;

        if self.registered {
            let live = self.screen.pools().context_destroyed();
            self.registered = false;
            debug!(context = self.id, live, "context unregistered");
        }

        self.atoms = None;
        self.state = PipelineState::default();
        self.lifecycle = Lifecycle::Destroyed;
        stats
    }

    fn report_stats(&self, stats: &ContextStats) {
        if self.screen.debug_flags().contains(DebugFlags::STATS) {
            info!(context = self.id, flushes = stats.flushes, "context statistics");
            for atom in &stats.atoms {
                info!(context = self.id, atom = atom.name, emits = atom.emits, "atom statistics");
            }
        }
        if let Some(sink) = self.screen.stats_sink() {
            sink.report(stats);
        }
    }

    fn release_referenced_objects(&mut self) {
        if let Some(fb) = self.state.fb.as_mut() {
            fb.cbufs.clear();
            fb.zsbuf = None;
        }
        if let Some(textures) = self.state.textures.as_mut() {
            textures.views.clear();
            textures.texkill_fallback = None;
        }
        self.vbo = None;
        self.vertex_buffers.clear();
        self.vertex_elements.clear();
        self.queries.clear();
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle)
            .field("family", &self.caps.family)
            .field("pending_dwords", &self.pending_dwords())
            .field("draws", &self.draws)
            .finish_non_exhaustive()
    }
}

/// `3D_LOAD_VBPNTR` for `buffers`, each offset by `start` vertices, followed by one relocation
/// per buffer.
fn emit_vertex_arrays(
    cs: &mut CommandStream,
    buffers: &[VertexBuffer],
    start: u32,
) -> std::result::Result<(), CsError> {
    let mut payload = Vec::with_capacity(1 + 2 * buffers.len());
    payload.push(buffers.len() as u32);
    for vb in buffers {
        let dwords_per_vertex = vb.stride / 4;
        payload.push((dwords_per_vertex << 8) | dwords_per_vertex);
        payload.push((vb.offset + u64::from(start) * u64::from(vb.stride)) as u32);
    }
    cs.out_pkt3(PKT3_3D_LOAD_VBPNTR, &payload)?;
    for vb in buffers {
        cs.out_reloc(&vb.resource, RelocUsage::READ)?;
    }
    Ok(())
}
