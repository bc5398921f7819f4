//! Register emitters for every atom, their variable-size estimates, and the command blocks
//! recorded once at context initialization.
//!
//! Each emitter writes at most the dword count its atom declares. For variable atoms that count
//! comes from [`variable_size`], which must mirror the emitter exactly.

use half::f16;
use pipegpu_protocol::cmd_writer::{f32_bits, RegWriter};
use pipegpu_protocol::packet::{PKT3_3D_CLEAR_HIZ, PKT3_3D_CLEAR_ZMASK, RELOC_DWORDS};
use pipegpu_protocol::regs;

use crate::atom::{AtomId, EmitCtx};
use crate::backend::RelocUsage;
use crate::caps::DeviceCaps;
use crate::cs::CommandStream;
use crate::error::CsError;
use crate::resource::ResourceHandle;
use crate::state::{
    pack_argb8888, scissor_corner, CullMode, DepthStencilAlphaState, PipelineState, RcConstant,
    StencilState, TextureFilter,
};

type EmitResult = Result<(), CsError>;

/// Multisample positions for single-sampled rendering (all samples at the pixel centre).
const MSPOS_CENTERED: u32 = 0x6666_6666;
/// Fixed-point scale of point sizes and line widths.
const SUBPIXEL_SCALE: f32 = 6.0;

const fn seq_dwords(n: usize) -> u32 {
    if n == 0 {
        0
    } else {
        1 + n as u32
    }
}

/// Pitch in pixels and hardware format of a surface.
fn surface_layout(resource: &ResourceHandle) -> (u32, u32) {
    match resource.texture() {
        Some(desc) => (
            desc.pitch_bytes() / desc.format.bytes_per_pixel(),
            desc.format.hw_format(),
        ),
        None => (0, 0),
    }
}

// -------------------------------------------------------------------------------------------------
// Emitters, in registry order
// -------------------------------------------------------------------------------------------------

pub fn gpu_flush(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(flush) = &ctx.state.gpu_flush else {
        return Ok(());
    };
    let (w, h) = (flush.width.max(1), flush.height.max(1));
    cs.out_reg_seq(
        regs::SC_SCISSOR0,
        &[scissor_corner(0, 0), scissor_corner(w - 1, h - 1)],
    )?;
    cs.out_raw(&flush.flush_clean)
}

pub fn aa_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(aa) = &ctx.state.aa else {
        return Ok(());
    };
    cs.out_reg(regs::GB_AA_CONFIG, aa.aa_config)?;
    cs.out_reg(regs::RB3D_AARESOLVE_CTL, aa.aaresolve_ctl)
}

pub fn fb_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(fb) = &ctx.state.fb else {
        return Ok(());
    };
    cs.out_reg(
        regs::RB3D_CCTL,
        (fb.cbufs.len().saturating_sub(1) as u32) << 5,
    )?;
    for (i, cbuf) in fb.cbufs.iter().enumerate() {
        let offset = regs::RB3D_CBUF_STRIDE * i as u32;
        let (pitch, format) = surface_layout(cbuf);
        cs.out_reg(regs::RB3D_COLOROFFSET0 + offset, 0)?;
        cs.out_reloc(cbuf, RelocUsage::WRITE)?;
        cs.out_reg(regs::RB3D_COLORPITCH0 + offset, pitch | (format << 21))?;
        cs.out_reloc(cbuf, RelocUsage::WRITE)?;
    }
    if let Some(zs) = &fb.zsbuf {
        let (pitch, format) = surface_layout(zs);
        cs.out_reg(regs::ZB_FORMAT, format)?;
        cs.out_reg(regs::ZB_DEPTHOFFSET, 0)?;
        cs.out_reloc(zs, RelocUsage::WRITE)?;
        cs.out_reg(regs::ZB_DEPTHPITCH, pitch)?;
        cs.out_reloc(zs, RelocUsage::WRITE)?;
    }
    Ok(())
}

pub fn prebuilt_hyperz(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    match &ctx.state.hyperz {
        Some(block) => cs.out_raw(&block.cb),
        None => Ok(()),
    }
}

pub fn ztop_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(ztop) = &ctx.state.ztop else {
        return Ok(());
    };
    let value = if ztop.enabled {
        regs::ZB_ZTOP_ENABLE
    } else {
        regs::ZB_ZTOP_DISABLE
    };
    cs.out_reg(regs::ZB_ZTOP, value)
}

fn stencil_refmask(stencil: &StencilState) -> u32 {
    u32::from(stencil.ref_value)
        | (u32::from(stencil.value_mask) << 8)
        | (u32::from(stencil.write_mask) << 16)
}

fn dsa_common(dsa: &DepthStencilAlphaState, cs: &mut CommandStream) -> EmitResult {
    let [front, back] = &dsa.stencil;
    let zb_cntl = u32::from(front.enabled)
        | (u32::from(dsa.depth.enabled) << 1)
        | (u32::from(dsa.depth.write) << 2)
        | (u32::from(back.enabled) << 4);
    let zstencil = dsa.depth.func.hw() | (front.func.hw() << 3) | (back.func.hw() << 12);
    cs.out_reg_seq(regs::ZB_CNTL, &[zb_cntl, zstencil, stencil_refmask(front)])?;

    let alpha = if dsa.alpha.enabled {
        let reference = (dsa.alpha.ref_value.clamp(0.0, 1.0) * 255.0) as u32;
        reference | (dsa.alpha.func.hw() << 8) | (1 << 11)
    } else {
        0
    };
    cs.out_reg(regs::FG_ALPHA_FUNC, alpha)
}

pub fn dsa_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    match &ctx.state.dsa {
        Some(dsa) => dsa_common(dsa, cs),
        None => Ok(()),
    }
}

pub fn r500_dsa_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(dsa) = &ctx.state.dsa else {
        return Ok(());
    };
    dsa_common(dsa, cs)?;
    cs.out_reg(regs::ZB_STENCILREFMASK_BF, stencil_refmask(&dsa.stencil[1]))
}

pub fn blend_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(blend) = &ctx.state.blend else {
        return Ok(());
    };
    let (blendcntl, ablendcntl) = if blend.enabled {
        (
            1 | (blend.rgb_func.hw() << 12)
                | (blend.src_rgb.hw() << 16)
                | (blend.dst_rgb.hw() << 24),
            (blend.alpha_func.hw() << 12)
                | (blend.src_alpha.hw() << 16)
                | (blend.dst_alpha.hw() << 24),
        )
    } else {
        (0, 0)
    };
    cs.out_reg_seq(
        regs::RB3D_BLENDCNTL,
        &[
            blendcntl,
            ablendcntl,
            u32::from(blend.color_mask) & regs::RB3D_COLOR_CHANNEL_MASK_ALL,
        ],
    )?;
    let rop = blend
        .logic_op
        .map_or(0, |op| (u32::from(op) << 8) | (1 << 2));
    cs.out_reg(regs::RB3D_ROPCNTL, rop)?;
    cs.out_reg(regs::RB3D_DITHER_CTL, if blend.dither { 0x45 } else { 0 })
}

pub fn blend_color_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(bc) = &ctx.state.blend_color else {
        return Ok(());
    };
    cs.out_reg(regs::RB3D_BLEND_COLOR, pack_argb8888(bc.color))
}

pub fn r500_blend_color_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(bc) = &ctx.state.blend_color else {
        return Ok(());
    };
    let h = |c: f32| u32::from(f16::from_f32(c).to_bits());
    let [r, g, b, a] = bc.color;
    cs.out_reg_seq(
        regs::RB3D_CONSTANT_COLOR_AR,
        &[(h(a) << 16) | h(r), (h(g) << 16) | h(b)],
    )
}

pub fn scissor_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(s) = &ctx.state.scissor else {
        return Ok(());
    };
    cs.out_reg_seq(
        regs::SC_SCISSORS_TL,
        &[
            scissor_corner(s.minx, s.miny),
            scissor_corner(s.maxx.saturating_sub(1), s.maxy.saturating_sub(1)),
        ],
    )
}

pub fn prebuilt_invariant(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    match &ctx.state.invariant {
        Some(block) => cs.out_raw(&block.cb),
        None => Ok(()),
    }
}

pub fn viewport_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(vp) = &ctx.state.viewport else {
        return Ok(());
    };
    cs.out_reg_seq(
        regs::SE_VPORT_XSCALE,
        &[
            f32_bits(vp.scale[0]),
            f32_bits(vp.translate[0]),
            f32_bits(vp.scale[1]),
            f32_bits(vp.translate[1]),
            f32_bits(vp.scale[2]),
            f32_bits(vp.translate[2]),
        ],
    )?;
    cs.out_reg(regs::VAP_VTE_CNTL, regs::VAP_VTE_ENABLE_ALL)
}

pub fn pvs_flush(_ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    cs.out_reg(regs::VAP_PVS_STATE_FLUSH_REG, 0)
}

pub fn prebuilt_vap_invariant(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    match &ctx.state.vap_invariant {
        Some(block) => cs.out_raw(&block.cb),
        None => Ok(()),
    }
}

pub fn vertex_stream_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(stream) = &ctx.state.vertex_stream else {
        return Ok(());
    };
    cs.out_reg_seq(regs::VAP_PROG_STREAM_CNTL_0, &stream.prog_stream_cntl)?;
    cs.out_reg_seq(regs::VAP_PROG_STREAM_CNTL_EXT_0, &stream.prog_stream_cntl_ext)?;
    cs.out_reg(regs::VAP_VTX_SIZE, stream.vtx_size)
}

pub fn vs_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(vs) = &ctx.state.vs else {
        return Ok(());
    };
    let last_inst = ((vs.code.len() / 4) as u32).saturating_sub(1);
    cs.out_reg(regs::VAP_PVS_CODE_CNTL_0, last_inst << 20)?;
    cs.out_reg(regs::VAP_PVS_CODE_CNTL_1, last_inst)?;
    cs.out_reg(regs::VAP_PVS_VECTOR_INDX_REG, regs::PVS_CODE_VECTOR_BASE)?;
    cs.out_reg_one(regs::VAP_PVS_UPLOAD_DATA, &vs.code)
}

pub fn vs_constants(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(consts) = &ctx.state.vs_constants else {
        return Ok(());
    };
    if consts.constants.is_empty() {
        return Ok(());
    }
    cs.out_reg(regs::VAP_PVS_VECTOR_INDX_REG, regs::PVS_CONST_VECTOR_BASE)?;
    cs.out_reg_one(regs::VAP_PVS_UPLOAD_DATA, consts.dwords())
}

pub fn clip_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(clip) = &ctx.state.clip else {
        return Ok(());
    };
    let planes: Vec<u32> = clip
        .state
        .planes
        .iter()
        .flatten()
        .map(|&f| f32_bits(f))
        .collect();
    cs.out_reg(regs::VAP_PVS_VECTOR_INDX_REG, regs::PVS_CLIP_PLANE_VECTOR_BASE)?;
    cs.out_reg_one(regs::VAP_PVS_UPLOAD_DATA, &planes)?;
    cs.out_reg(regs::VAP_CLIP_CNTL, u32::from(clip.state.enabled))
}

pub fn swtcl_clip_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    match &ctx.state.clip {
        Some(clip) => cs.out_raw(&clip.swtcl_cb),
        None => Ok(()),
    }
}

pub fn rs_block_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(rs) = &ctx.state.rs_block else {
        return Ok(());
    };
    cs.out_reg_seq(regs::RS_IP_0, &rs.ip)?;
    cs.out_reg_seq(regs::RS_COUNT, &[rs.count, rs.inst_count])?;
    cs.out_reg_seq(regs::RS_INST_0, &rs.inst)
}

pub fn rs_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(rs) = &ctx.state.rasterizer else {
        return Ok(());
    };
    let point = (rs.point_size * SUBPIXEL_SCALE) as u32 & 0xFFFF;
    let line = (rs.line_width * SUBPIXEL_SCALE) as u32 & 0xFFFF;
    let cull = match rs.cull {
        CullMode::None => 0,
        CullMode::Front => 1,
        CullMode::Back => 2,
    } | (u32::from(!rs.front_ccw) << 2);
    cs.out_reg(regs::GA_POINT_SIZE, (point << 16) | point)?;
    cs.out_reg(regs::GA_LINE_CNTL, line | (1 << 17))?;
    cs.out_reg(regs::SU_POLY_OFFSET_ENABLE, if rs.poly_offset { 3 } else { 0 })?;
    cs.out_reg(regs::SU_CULL_MODE, cull)?;
    cs.out_reg(regs::GA_COLOR_CONTROL, if rs.flatshade { 0x0 } else { 0xAAAA })
}

pub fn fb_state_pipelined(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let mut formats = [regs::US_OUT_FMT_UNUSED; regs::MAX_COLOR_BUFFERS];
    if let Some(fb) = &ctx.state.fb {
        for (slot, cbuf) in formats.iter_mut().zip(&fb.cbufs) {
            *slot = surface_layout(cbuf).1;
        }
    }
    cs.out_reg_seq(regs::US_OUT_FMT_0, &formats)?;
    if ctx.caps.drm_2_3_0() {
        cs.out_reg_seq(regs::GB_MSPOS0, &[MSPOS_CENTERED, MSPOS_CENTERED])?;
    }
    Ok(())
}

pub fn fs(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(fs) = &ctx.state.fs else {
        return Ok(());
    };
    cs.out_reg(regs::US_CONFIG, 0)?;
    cs.out_reg(regs::US_PIXSIZE, fs.num_temps.saturating_sub(1))?;
    cs.out_reg(regs::US_CODE_OFFSET, (fs.code.len() as u32).saturating_sub(1))?;
    cs.out_reg_seq(regs::US_ALU_RGB_INST_0, &fs.code)
}

pub fn r500_fs(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(fs) = &ctx.state.fs else {
        return Ok(());
    };
    cs.out_reg(regs::US_CODE_RANGE, (fs.code.len() as u32).saturating_sub(1))?;
    cs.out_reg(regs::US_CODE_ADDR, 0)?;
    cs.out_reg(regs::GA_US_VECTOR_INDEX, regs::GA_US_VECTOR_INDEX_TYPE_INSTR)?;
    cs.out_reg_one(regs::GA_US_VECTOR_DATA, &fs.code)
}

/// Runtime constants of the bound fragment program, resolved against current textures.
fn rc_constant_values(state: &PipelineState) -> Vec<u32> {
    let Some(fs) = &state.fs else {
        return Vec::new();
    };
    let views = state
        .textures
        .as_ref()
        .map(|t| t.effective_views(Some(fs.as_ref())))
        .unwrap_or_default();
    fs.rc_constants
        .iter()
        .flat_map(|rc| {
            let value = match *rc {
                RcConstant::Immediate(v) => v,
                RcConstant::TexelSize { unit } => views
                    .get(unit as usize)
                    .and_then(|view| view.resource.texture())
                    .map_or([0.0; 4], |desc| {
                        [
                            1.0 / desc.width.max(1) as f32,
                            1.0 / desc.height.max(1) as f32,
                            0.0,
                            0.0,
                        ]
                    }),
            };
            value.map(f32_bits)
        })
        .collect()
}

fn user_fs_constants(state: &PipelineState) -> u32 {
    state
        .fs_constants
        .as_ref()
        .map_or(0, |c| c.constants.len() as u32)
}

pub fn fs_rc_constant_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let values = rc_constant_values(ctx.state);
    let first = user_fs_constants(ctx.state);
    cs.out_reg_seq(regs::FS_PARAM_0_X + 16 * first, &values)
}

pub fn r500_fs_rc_constant_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let values = rc_constant_values(ctx.state);
    if values.is_empty() {
        return Ok(());
    }
    let first = user_fs_constants(ctx.state);
    cs.out_reg(
        regs::GA_US_VECTOR_INDEX,
        regs::GA_US_VECTOR_INDEX_TYPE_CONST | first,
    )?;
    cs.out_reg_one(regs::GA_US_VECTOR_DATA, &values)
}

pub fn fs_constants(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    match &ctx.state.fs_constants {
        Some(consts) => cs.out_reg_seq(regs::FS_PARAM_0_X, consts.dwords()),
        None => Ok(()),
    }
}

pub fn r500_fs_constants(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(consts) = &ctx.state.fs_constants else {
        return Ok(());
    };
    if consts.constants.is_empty() {
        return Ok(());
    }
    cs.out_reg(regs::GA_US_VECTOR_INDEX, regs::GA_US_VECTOR_INDEX_TYPE_CONST)?;
    cs.out_reg_one(regs::GA_US_VECTOR_DATA, consts.dwords())
}

pub fn texture_cache_inval(_ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    cs.out_reg(regs::TX_INVALTAGS, 0)
}

const TEXTURE_UNIT_DWORDS: u32 = 6 * 2 + RELOC_DWORDS;

pub fn textures_state(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(textures) = &ctx.state.textures else {
        return Ok(());
    };
    let views = textures.effective_views(ctx.state.fs.as_deref());
    let enable = (1u32 << views.len().min(regs::MAX_TEXTURE_UNITS)) - 1;
    cs.out_reg(regs::TX_ENABLE, enable)?;
    for (unit, view) in views.iter().enumerate() {
        let offset = regs::TX_UNIT_STRIDE * unit as u32;
        let (size, format, pitch) = match view.resource.texture() {
            Some(desc) => (
                desc.width.saturating_sub(1) | (desc.height.saturating_sub(1) << 11),
                desc.format.hw_format(),
                desc.pitch_bytes() / desc.format.bytes_per_pixel(),
            ),
            None => (0, 0, 0),
        };
        let filter = match view.filter {
            TextureFilter::Nearest => 0,
            TextureFilter::Linear => (2 << 11) | (2 << 9),
        };
        cs.out_reg(regs::TX_FILTER0_0 + offset, filter)?;
        cs.out_reg(regs::TX_FILTER1_0 + offset, 0)?;
        cs.out_reg(regs::TX_FORMAT0_0 + offset, size)?;
        cs.out_reg(regs::TX_FORMAT1_0 + offset, format)?;
        cs.out_reg(regs::TX_FORMAT2_0 + offset, pitch.saturating_sub(1))?;
        cs.out_reg(regs::TX_OFFSET_0 + offset, 0)?;
        cs.out_reloc(&view.resource, RelocUsage::READ)?;
    }
    Ok(())
}

pub fn hiz_clear(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(clear) = &ctx.state.hiz_clear else {
        return Ok(());
    };
    cs.out_reg(regs::ZB_HIZ_OFFSET, clear.offset)?;
    cs.out_reg(regs::ZB_HIZ_PITCH, clear.pitch)?;
    cs.out_pkt3(PKT3_3D_CLEAR_HIZ, &[clear.offset, clear.tiles, clear.value])
}

pub fn zmask_clear(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let Some(clear) = &ctx.state.zmask_clear else {
        return Ok(());
    };
    cs.out_reg(regs::ZB_ZMASK_OFFSET, clear.offset)?;
    cs.out_reg(regs::ZB_ZMASK_PITCH, clear.pitch)?;
    cs.out_pkt3(PKT3_3D_CLEAR_ZMASK, &[clear.offset, clear.tiles, clear.value])
}

pub fn query_start(ctx: &EmitCtx<'_>, cs: &mut CommandStream) -> EmitResult {
    let active = ctx
        .state
        .query_start
        .as_ref()
        .is_some_and(|q| q.active.is_some());
    if active {
        // Count on every pipe from zero.
        cs.out_reg(regs::SU_REG_DEST, 0xF)?;
        cs.out_reg(regs::ZB_ZPASS_DATA, 0)?;
    }
    Ok(())
}

const HYPERZ_CLEAR_DWORDS: u32 = 2 + 2 + 4;

/// Dword budget of a variable-size atom given the current state. `None` for fixed-size atoms.
pub fn variable_size(id: AtomId, state: &PipelineState, caps: &DeviceCaps) -> Option<u32> {
    let size = match id {
        AtomId::FbState => state.fb.as_ref().map_or(0, |fb| {
            let per_cbuf = 2 * (2 + RELOC_DWORDS);
            let zs = if fb.zsbuf.is_some() {
                2 + 2 * (2 + RELOC_DWORDS)
            } else {
                0
            };
            2 + per_cbuf * fb.cbufs.len() as u32 + zs
        }),
        AtomId::VertexStreamState => state.vertex_stream.as_ref().map_or(0, |s| {
            seq_dwords(s.prog_stream_cntl.len()) + seq_dwords(s.prog_stream_cntl_ext.len()) + 2
        }),
        AtomId::VsState => state
            .vs
            .as_ref()
            .map_or(0, |vs| 6 + seq_dwords(vs.code.len())),
        AtomId::VsConstants => state.vs_constants.as_ref().map_or(0, |c| {
            match c.constants.len() {
                0 => 0,
                n => 2 + seq_dwords(4 * n),
            }
        }),
        AtomId::RsBlockState => state.rs_block.as_ref().map_or(0, |rs| {
            seq_dwords(rs.ip.len()) + 3 + seq_dwords(rs.inst.len())
        }),
        AtomId::RsState => state.rasterizer.as_ref().map_or(0, |_| 5 * 2),
        AtomId::Fs => state
            .fs
            .as_ref()
            .map_or(0, |fs| 6 + seq_dwords(fs.code.len())),
        AtomId::FsRcConstantState => match rc_constant_values(state).len() {
            0 => 0,
            n if caps.is_r500() => 2 + seq_dwords(n),
            n => seq_dwords(n),
        },
        AtomId::FsConstants => match user_fs_constants(state) as usize {
            0 => 0,
            n if caps.is_r500() => 2 + seq_dwords(4 * n),
            n => seq_dwords(4 * n),
        },
        AtomId::TexturesState => state.textures.as_ref().map_or(0, |t| {
            let units = t.effective_views(state.fs.as_deref()).len() as u32;
            2 + TEXTURE_UNIT_DWORDS * units
        }),
        AtomId::HizClear => state.hiz_clear.map_or(0, |_| HYPERZ_CLEAR_DWORDS),
        AtomId::ZmaskClear => state.zmask_clear.map_or(0, |_| HYPERZ_CLEAR_DWORDS),
        _ => return None,
    };
    Some(size)
}

// -------------------------------------------------------------------------------------------------
// Blocks recorded at initialization
// -------------------------------------------------------------------------------------------------

/// Colour and depth cache flush followed by a wait for the 3D engine to go idle.
pub fn build_flush_clean() -> Vec<u32> {
    let mut w = RegWriter::with_capacity(6);
    w.out_reg(
        regs::RB3D_DSTCACHE_CTLSTAT,
        regs::RB3D_DSTCACHE_CTLSTAT_DC_FLUSH_FLUSH_DIRTY_3D
            | regs::RB3D_DSTCACHE_CTLSTAT_DC_FREE_FREE_3D_TAGS,
    )
    .out_reg(
        regs::ZB_ZCACHE_CTLSTAT,
        regs::ZB_ZCACHE_CTLSTAT_ZC_FLUSH_FLUSH_AND_FREE | regs::ZB_ZCACHE_CTLSTAT_ZC_FREE_FREE,
    )
    .out_reg(regs::WAIT_UNTIL, regs::WAIT_3D_IDLECLEAN);
    w.finish()
}

pub fn build_invariant(caps: &DeviceCaps) -> Vec<u32> {
    let mut w = RegWriter::with_capacity(20);
    w.out_reg(regs::GB_SELECT, 0)
        .out_reg(regs::FG_FOG_BLEND, 0)
        .out_reg(regs::GA_ROUND_MODE, 1)
        .out_reg(regs::GA_OFFSET, 0)
        .out_reg(regs::SU_TEX_WRAP, 0)
        .out_reg(regs::SU_DEPTH_SCALE, 0x4B7F_FFFF)
        .out_reg(regs::SU_DEPTH_OFFSET, 0)
        .out_reg(regs::SC_EDGERULE, regs::SC_EDGERULE_DEFAULT);
    if caps.is_rv350() {
        w.out_reg(regs::RB3D_DISCARD_SRC_PIXEL_LTE_THRESHOLD, 0x0101_0101)
            .out_reg(regs::RB3D_DISCARD_SRC_PIXEL_GTE_THRESHOLD, 0xFEFE_FEFE);
    }
    w.finish()
}

pub fn build_vap_invariant() -> Vec<u32> {
    let one = f32_bits(1.0);
    let mut w = RegWriter::with_capacity(9);
    w.out_reg(regs::VAP_PVS_VTX_TIMEOUT_REG, 0xFFFF)
        .out_reg_seq(regs::VAP_GB_VERT_CLIP_ADJ, &[one; 4])
        .out_reg(regs::VAP_PSC_SGN_NORM_CNTL, regs::VAP_SGN_NORM_NO_ZERO);
    w.finish()
}

pub fn build_hyperz(caps: &DeviceCaps) -> Vec<u32> {
    let mut w = RegWriter::with_capacity(10);
    w.out_reg(
        regs::ZB_ZCACHE_CTLSTAT,
        regs::ZB_ZCACHE_CTLSTAT_ZC_FLUSH_FLUSH_AND_FREE | regs::ZB_ZCACHE_CTLSTAT_ZC_FREE_FREE,
    )
    .out_reg(regs::ZB_BW_CNTL, 0)
    .out_reg(regs::ZB_DEPTHCLEARVALUE, 0)
    .out_reg(regs::SC_HYPERZ, regs::SC_HYPERZ_ADJ_2);
    if caps.has_z_peq_config() {
        w.out_reg(regs::GB_Z_PEQ_CONFIG, 0);
    }
    w.finish()
}

pub fn build_swtcl_clip() -> Vec<u32> {
    let mut w = RegWriter::with_capacity(2);
    w.out_reg(regs::VAP_CLIP_CNTL, regs::VAP_CLIP_DISABLE);
    w.finish()
}
