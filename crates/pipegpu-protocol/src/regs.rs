//! Register offsets and well-known field values.
//!
//! Offsets are byte addresses in the 3D register aperture; packet headers encode them as dword
//! indices (`reg >> 2`). Only the registers the driver core writes are listed here.

// ---------------------------------------------------------------------------------------------
// Command processor
// ---------------------------------------------------------------------------------------------

pub const WAIT_UNTIL: u32 = 0x1720;
pub const WAIT_3D_IDLECLEAN: u32 = 1 << 17;

// ---------------------------------------------------------------------------------------------
// GB: geometry block
// ---------------------------------------------------------------------------------------------

pub const GB_MSPOS0: u32 = 0x4010;
pub const GB_MSPOS1: u32 = 0x4014;
pub const GB_AA_CONFIG: u32 = 0x4020;
pub const GB_SELECT: u32 = 0x401C;
pub const GB_Z_PEQ_CONFIG: u32 = 0x4028;
pub const GB_ENABLE: u32 = 0x4008;

pub const GB_AA_CONFIG_AA_ENABLE: u32 = 1 << 0;

// ---------------------------------------------------------------------------------------------
// VAP: vertex assembly and processing
// ---------------------------------------------------------------------------------------------

pub const VAP_VTE_CNTL: u32 = 0x20B0;
pub const VAP_VF_CNTL: u32 = 0x2084;
pub const VAP_PROG_STREAM_CNTL_0: u32 = 0x2150;
pub const VAP_PROG_STREAM_CNTL_EXT_0: u32 = 0x21E0;
pub const VAP_VTX_SIZE: u32 = 0x20B4;
pub const VAP_PSC_SGN_NORM_CNTL: u32 = 0x21DC;
pub const VAP_CLIP_CNTL: u32 = 0x221C;
pub const VAP_GB_VERT_CLIP_ADJ: u32 = 0x2220;
pub const VAP_PVS_VECTOR_INDX_REG: u32 = 0x2200;
pub const VAP_PVS_UPLOAD_DATA: u32 = 0x2208;
pub const VAP_PVS_STATE_FLUSH_REG: u32 = 0x2284;
pub const VAP_PVS_VTX_TIMEOUT_REG: u32 = 0x2288;
pub const VAP_PVS_CODE_CNTL_0: u32 = 0x22D0;
pub const VAP_PVS_CODE_CNTL_1: u32 = 0x22D8;
pub const VAP_CNTL: u32 = 0x2080;

pub const VAP_CLIP_DISABLE: u32 = 1 << 16;
pub const VAP_SGN_NORM_NO_ZERO: u32 = 0xAAAA_AAAA;
pub const VAP_VTE_ENABLE_ALL: u32 = 0x3F | (1 << 8) | (1 << 9);

/// PVS vector index where user clip planes live.
pub const PVS_CLIP_PLANE_VECTOR_BASE: u32 = 0x600;
/// PVS vector index where vertex shader constants live.
pub const PVS_CONST_VECTOR_BASE: u32 = 0x400;
/// PVS vector index where vertex shader code lives.
pub const PVS_CODE_VECTOR_BASE: u32 = 0x000;

// ---------------------------------------------------------------------------------------------
// SE: setup engine (viewport)
// ---------------------------------------------------------------------------------------------

pub const SE_VPORT_XSCALE: u32 = 0x1D98;
pub const SE_VPORT_XOFFSET: u32 = 0x1D9C;
pub const SE_VPORT_YSCALE: u32 = 0x1DA0;
pub const SE_VPORT_YOFFSET: u32 = 0x1DA4;
pub const SE_VPORT_ZSCALE: u32 = 0x1DA8;
pub const SE_VPORT_ZOFFSET: u32 = 0x1DAC;

// ---------------------------------------------------------------------------------------------
// GA / SU: graphics assembly and setup unit
// ---------------------------------------------------------------------------------------------

pub const GA_POINT_SIZE: u32 = 0x421C;
pub const GA_LINE_CNTL: u32 = 0x4234;
pub const GA_POLY_MODE: u32 = 0x4288;
pub const GA_ROUND_MODE: u32 = 0x428C;
pub const GA_OFFSET: u32 = 0x4290;
pub const GA_COLOR_CONTROL: u32 = 0x4278;
pub const GA_US_VECTOR_INDEX: u32 = 0x4250;
pub const GA_US_VECTOR_DATA: u32 = 0x4254;

pub const SU_TEX_WRAP: u32 = 0x42A0;
pub const SU_DEPTH_SCALE: u32 = 0x42C0;
pub const SU_DEPTH_OFFSET: u32 = 0x42C4;
pub const SU_REG_DEST: u32 = 0x42C8;
pub const SU_CULL_MODE: u32 = 0x42B8;
pub const SU_POLY_OFFSET_ENABLE: u32 = 0x42B4;

pub const GA_US_VECTOR_INDEX_TYPE_INSTR: u32 = 0 << 16;
pub const GA_US_VECTOR_INDEX_TYPE_CONST: u32 = 1 << 16;

// ---------------------------------------------------------------------------------------------
// RS: rasterizer interpolators
// ---------------------------------------------------------------------------------------------

pub const RS_COUNT: u32 = 0x4300;
pub const RS_INST_COUNT: u32 = 0x4304;
pub const RS_IP_0: u32 = 0x4310;
pub const RS_INST_0: u32 = 0x4330;

// ---------------------------------------------------------------------------------------------
// SC: scan converter
// ---------------------------------------------------------------------------------------------

pub const SC_HYPERZ: u32 = 0x43A4;
pub const SC_EDGERULE: u32 = 0x43A8;
pub const SC_SCISSOR0: u32 = 0x43E0;
pub const SC_SCISSOR1: u32 = 0x43E4;
pub const SC_SCISSORS_TL: u32 = 0x43E8;
pub const SC_SCISSORS_BR: u32 = 0x43EC;

pub const SC_HYPERZ_ADJ_2: u32 = 1 << 1;
pub const SC_EDGERULE_DEFAULT: u32 = 0x2DA4_9525;

/// Scissor coordinates are biased by this amount on all chips handled here.
pub const SCISSORS_OFFSET: u32 = 1440;
pub const SCISSORS_X_SHIFT: u32 = 0;
pub const SCISSORS_Y_SHIFT: u32 = 13;

// ---------------------------------------------------------------------------------------------
// US: fragment (unified shader) block
// ---------------------------------------------------------------------------------------------

pub const US_CONFIG: u32 = 0x4600;
pub const US_PIXSIZE: u32 = 0x4604;
pub const US_CODE_OFFSET: u32 = 0x4608;
pub const US_CODE_ADDR_0: u32 = 0x4610;
pub const US_ALU_RGB_INST_0: u32 = 0x48C0;
pub const US_OUT_FMT_0: u32 = 0x46A4;
pub const US_W_FMT: u32 = 0x46B4;
pub const US_CODE_RANGE: u32 = 0x4634;
pub const US_CODE_ADDR: u32 = 0x4630;
pub const FS_PARAM_0_X: u32 = 0x4C00;

pub const US_OUT_FMT_UNUSED: u32 = 0xF;

// ---------------------------------------------------------------------------------------------
// FG: fog/alpha
// ---------------------------------------------------------------------------------------------

pub const FG_FOG_BLEND: u32 = 0x4BC0;
pub const FG_ALPHA_FUNC: u32 = 0x4BD4;
pub const FG_DEPTH_SRC: u32 = 0x4BD8;

// ---------------------------------------------------------------------------------------------
// TX: texture units
// ---------------------------------------------------------------------------------------------

pub const TX_INVALTAGS: u32 = 0x4100;
pub const TX_ENABLE: u32 = 0x4104;
pub const TX_FILTER0_0: u32 = 0x4400;
pub const TX_FILTER1_0: u32 = 0x4440;
pub const TX_FORMAT0_0: u32 = 0x4480;
pub const TX_FORMAT1_0: u32 = 0x44C0;
pub const TX_FORMAT2_0: u32 = 0x4500;
pub const TX_OFFSET_0: u32 = 0x4540;

/// Stride between consecutive texture units' registers.
pub const TX_UNIT_STRIDE: u32 = 4;
pub const MAX_TEXTURE_UNITS: usize = 16;

// ---------------------------------------------------------------------------------------------
// RB3D: render backend
// ---------------------------------------------------------------------------------------------

pub const RB3D_CCTL: u32 = 0x4E00;
pub const RB3D_BLENDCNTL: u32 = 0x4E04;
pub const RB3D_ABLENDCNTL: u32 = 0x4E08;
pub const RB3D_COLOR_CHANNEL_MASK: u32 = 0x4E0C;
pub const RB3D_BLEND_COLOR: u32 = 0x4E10;
pub const RB3D_ROPCNTL: u32 = 0x4E18;
pub const RB3D_COLOROFFSET0: u32 = 0x4E28;
pub const RB3D_COLORPITCH0: u32 = 0x4E38;
pub const RB3D_DSTCACHE_CTLSTAT: u32 = 0x4E4C;
pub const RB3D_DITHER_CTL: u32 = 0x4E50;
pub const RB3D_AARESOLVE_CTL: u32 = 0x4E88;
pub const RB3D_DISCARD_SRC_PIXEL_LTE_THRESHOLD: u32 = 0x4EA0;
pub const RB3D_DISCARD_SRC_PIXEL_GTE_THRESHOLD: u32 = 0x4EA4;
pub const RB3D_CONSTANT_COLOR_AR: u32 = 0x4EF8;
pub const RB3D_CONSTANT_COLOR_GB: u32 = 0x4EFC;

pub const RB3D_DSTCACHE_CTLSTAT_DC_FREE_FREE_3D_TAGS: u32 = 2 << 2;
pub const RB3D_DSTCACHE_CTLSTAT_DC_FLUSH_FLUSH_DIRTY_3D: u32 = 2;
pub const RB3D_COLOR_CHANNEL_MASK_ALL: u32 = 0xF;

/// Stride between consecutive colour buffer registers.
pub const RB3D_CBUF_STRIDE: u32 = 4;
pub const MAX_COLOR_BUFFERS: usize = 4;

// ---------------------------------------------------------------------------------------------
// ZB: depth/stencil buffer
// ---------------------------------------------------------------------------------------------

pub const ZB_CNTL: u32 = 0x4F00;
pub const ZB_ZSTENCILCNTL: u32 = 0x4F04;
pub const ZB_STENCILREFMASK: u32 = 0x4F08;
pub const ZB_FORMAT: u32 = 0x4F10;
pub const ZB_ZTOP: u32 = 0x4F14;
pub const ZB_ZCACHE_CTLSTAT: u32 = 0x4F18;
pub const ZB_BW_CNTL: u32 = 0x4F1C;
pub const ZB_DEPTHOFFSET: u32 = 0x4F20;
pub const ZB_DEPTHPITCH: u32 = 0x4F24;
pub const ZB_DEPTHCLEARVALUE: u32 = 0x4F28;
pub const ZB_ZMASK_OFFSET: u32 = 0x4F30;
pub const ZB_ZMASK_PITCH: u32 = 0x4F34;
pub const ZB_HIZ_OFFSET: u32 = 0x4F44;
pub const ZB_HIZ_PITCH: u32 = 0x4F54;
pub const ZB_ZPASS_DATA: u32 = 0x4F58;
pub const ZB_ZPASS_ADDR: u32 = 0x4F5C;
pub const ZB_STENCILREFMASK_BF: u32 = 0x4FD4;

pub const ZB_ZCACHE_CTLSTAT_ZC_FLUSH_FLUSH_AND_FREE: u32 = 1;
pub const ZB_ZCACHE_CTLSTAT_ZC_FREE_FREE: u32 = 1 << 1;
pub const ZB_ZTOP_ENABLE: u32 = 1;
pub const ZB_ZTOP_DISABLE: u32 = 0;
