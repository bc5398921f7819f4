mod common;

use std::sync::Arc;

use pipegpu::atom::AtomId;
use pipegpu::state::{BlendColor, BlendState};
use pipegpu::{
    CapFlags, ChipFamily, ClearFlags, CollectingStatsSink, ContextConfig, ContextError, DebugFlags,
    DeviceBackend, DeviceCaps, ImmediateDevice, Lifecycle, Screen, ScreenDescriptor,
};
use pipegpu_protocol::packet::{PKT3_3D_CLEAR_COLOR, PKT3_3D_DRAW_VBUF_2, PKT3_3D_LOAD_VBPNTR};
use pipegpu_protocol::{decode_packets, register_writes, regs, Packet};
use pretty_assertions::assert_eq;

fn written_registers(dwords: &[u32]) -> Vec<u32> {
    register_writes(dwords)
        .expect("stream decodes")
        .into_iter()
        .map(|(reg, _)| reg)
        .collect()
}

#[test]
fn first_flush_primes_invariant_state() {
    let (device, screen) = common::setup(ChipFamily::Rv350);
    let mut ctx = common::context(&screen);

    let fence = ctx.flush().unwrap();
    assert!(fence.is_some());

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].context_id, ctx.id());
    let regs_written = written_registers(&submissions[0].dwords);
    for reg in [
        regs::RB3D_BLEND_COLOR,
        regs::SC_SCISSORS_TL,
        regs::SC_EDGERULE,
        regs::RB3D_DISCARD_SRC_PIXEL_LTE_THRESHOLD,
        regs::SE_VPORT_XSCALE,
        regs::VAP_PVS_STATE_FLUSH_REG,
        regs::VAP_PVS_VTX_TIMEOUT_REG,
        regs::VAP_CLIP_CNTL,
        regs::TX_INVALTAGS,
    ] {
        assert!(regs_written.contains(&reg), "register {reg:#06x} not primed");
    }

    // Nothing changed since, so there is nothing to send.
    assert_eq!(ctx.flush().unwrap(), None);
    assert_eq!(device.submissions().len(), 1);
}

#[test]
fn software_tcl_context_disables_hardware_clipping() {
    let caps = DeviceCaps::new(ChipFamily::Rv350).without(CapFlags::HAS_TCL);
    let device = common::device(caps);
    let screen = common::screen_on(&device);
    let mut ctx = common::context(&screen);
    ctx.flush().unwrap();

    let writes = register_writes(&device.submissions()[0].dwords).unwrap();
    assert!(writes.contains(&(regs::VAP_CLIP_CNTL, regs::VAP_CLIP_DISABLE)));
}

fn assert_nothing_leaked(device: &ImmediateDevice, screen: &Screen) {
    assert_eq!(device.live_buffers(), 0, "buffers leaked");
    assert_eq!(device.live_command_streams(), 0, "command streams leaked");
    assert_eq!(device.invalid_destroys(), 0, "double release");
    assert_eq!(screen.live_contexts(), 0, "context still registered");
}

#[test]
fn failed_command_stream_creation_leaves_nothing_behind() {
    let (device, screen) = common::setup(ChipFamily::R300);
    device.fail_next_cs_create();
    let err = screen.create_context(ContextConfig::default()).unwrap_err();
    assert_eq!(err, ContextError::Allocation("command stream"));
    assert_nothing_leaked(&device, &screen);

    // The fault is one-shot.
    let ctx = common::context(&screen);
    drop(ctx);
    assert_nothing_leaked(&device, &screen);
}

#[test]
fn failed_buffer_creation_at_each_step_leaves_nothing_behind() {
    // Index upload buffer, vertex upload buffer, texkill texture.
    for (allowed, expected) in [
        (0, ContextError::Allocation("index upload")),
        (1, ContextError::Allocation("vertex upload")),
        (2, ContextError::Allocation("texkill texture")),
    ] {
        let (device, screen) = common::setup(ChipFamily::R300);
        device.fail_buffer_create_after(allowed);
        let err = screen.create_context(ContextConfig::default()).unwrap_err();
        assert_eq!(err, expected);
        assert_nothing_leaked(&device, &screen);
    }
}

#[test]
fn r500_creation_needs_no_texkill_texture() {
    let (device, screen) = common::setup(ChipFamily::R500);
    device.fail_buffer_create_after(2);
    let ctx = common::context(&screen);
    assert_eq!(device.live_buffers(), 2);
    drop(ctx);
    assert_nothing_leaked(&device, &screen);
}

#[test]
fn missing_zmask_ram_fails_hyperz_context_creation() {
    let caps = DeviceCaps::new(ChipFamily::Rv350)
        .with(CapFlags::CAN_HYPERZ)
        .with_zmask_ram(0);
    let device = common::device(caps);
    let screen = common::screen_on(&device);
    let err = screen.create_context(ContextConfig::default()).unwrap_err();
    assert_eq!(err, ContextError::Allocation("zmask memory manager"));
    assert_nothing_leaked(&device, &screen);
}

#[test]
fn invalid_upload_configuration_is_rejected() {
    let (device, screen) = common::setup(ChipFamily::R300);
    let config = ContextConfig {
        upload_alignment: 3,
        ..ContextConfig::default()
    };
    assert!(matches!(
        screen.create_context(config),
        Err(ContextError::BadArgument(_))
    ));
    assert_nothing_leaked(&device, &screen);
}

#[test]
fn destroy_submits_pending_commands() {
    let (device, screen) = common::setup(ChipFamily::R300);
    let mut ctx = common::context(&screen);
    ctx.set_framebuffer_state(common::framebuffer(&screen, 16, 16, false))
        .unwrap();
    ctx.clear(ClearFlags::COLOR, [0.0, 0.0, 1.0, 1.0], 1.0, 0)
        .unwrap();
    assert!(device.submissions().is_empty());
    assert!(ctx.pending_dwords() > 0);

    ctx.destroy();

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    let packets = decode_packets(&submissions[0].dwords).unwrap();
    assert!(matches!(
        packets.last(),
        Some(Packet::Type3 { opcode: PKT3_3D_CLEAR_COLOR, .. })
    ));
    assert_eq!(screen.live_contexts(), 0);
    assert_eq!(device.live_command_streams(), 0);
}

#[test]
fn draw_emits_dirty_state_before_the_draw_packets() {
    let (device, screen) = common::setup(ChipFamily::R300);
    let mut ctx = common::context(&screen);
    assert_eq!(ctx.lifecycle(), Lifecycle::Initialized);
    common::bind_draw_state(&mut ctx, &screen, 3);
    assert_eq!(ctx.lifecycle(), Lifecycle::Active);

    ctx.draw_arrays(pipegpu::state::PrimitiveMode::Triangles, 0, 3)
        .unwrap();
    assert!(ctx.atoms().unwrap().dirty_ids().is_empty());
    ctx.flush().unwrap();

    let dwords = &device.submissions()[0].dwords;
    let packets = decode_packets(dwords).unwrap();
    let opcodes: Vec<u8> = packets
        .iter()
        .filter_map(|p| match p {
            Packet::Type3 { opcode, .. } => Some(*opcode),
            _ => None,
        })
        .collect();
    assert_eq!(opcodes, vec![PKT3_3D_LOAD_VBPNTR, PKT3_3D_DRAW_VBUF_2]);
    assert!(matches!(
        packets.last(),
        Some(Packet::Type3 { opcode: PKT3_3D_DRAW_VBUF_2, payload }) if payload[0] >> 16 == 3
    ));
    let regs_written = written_registers(dwords);
    assert!(regs_written.contains(&regs::VAP_PVS_CODE_CNTL_0));
    assert!(regs_written.contains(&regs::RB3D_COLOROFFSET0));
}

#[test]
fn clean_state_is_not_emitted_twice() {
    let (_device, screen) = common::setup(ChipFamily::R300);
    let mut ctx = common::context(&screen);
    common::bind_draw_state(&mut ctx, &screen, 3);
    ctx.draw_arrays(pipegpu::state::PrimitiveMode::Triangles, 0, 3)
        .unwrap();
    ctx.flush().unwrap();

    ctx.draw_arrays(pipegpu::state::PrimitiveMode::Triangles, 0, 3)
        .unwrap();
    // LOAD_VBPNTR with one buffer plus DRAW_VBUF_2.
    assert_eq!(ctx.pending_dwords(), 6 + 2);

    ctx.set_blend_color(BlendColor {
        color: [1.0, 0.0, 0.0, 1.0],
    });
    assert_eq!(ctx.atoms().unwrap().dirty_ids(), vec![AtomId::BlendColorState]);
}

#[test]
fn unbinding_shaders_leaves_nothing_to_emit() {
    let (device, screen) = common::setup(ChipFamily::R300);
    let mut ctx = common::context(&screen);
    ctx.flush().unwrap();

    ctx.bind_vs_state(None).unwrap();
    ctx.bind_fs_state(None);
    assert_eq!(ctx.atoms().unwrap().dirty_ids(), Vec::<AtomId>::new());
    assert_eq!(ctx.flush().unwrap(), None);

    ctx.bind_fs_state(Some(common::fragment_shader()));
    ctx.flush().unwrap();
    ctx.bind_fs_state(None);
    assert_eq!(ctx.flush().unwrap(), None);
    assert_eq!(device.submissions().len(), 2);
}

#[test]
fn state_unbound_before_flush_is_not_emitted() {
    let (device, screen) = common::setup(ChipFamily::R300);
    let mut ctx = common::context(&screen);
    ctx.flush().unwrap();
    device.take_submissions();

    ctx.bind_vs_state(Some(common::vertex_shader())).unwrap();
    ctx.bind_fs_state(Some(common::fragment_shader()));
    ctx.bind_blend_state(Some(BlendState::default()));
    ctx.bind_vs_state(None).unwrap();
    ctx.bind_fs_state(None);
    ctx.bind_blend_state(None);

    let dirty = ctx.atoms().unwrap().dirty_ids();
    for gone in [AtomId::VsState, AtomId::Fs, AtomId::BlendState] {
        assert!(!dirty.contains(&gone), "{gone:?} still dirty");
    }
    ctx.flush().unwrap();
    assert!(ctx.atoms().unwrap().dirty_ids().is_empty());
    let regs_written = written_registers(&device.submissions()[0].dwords);
    assert!(!regs_written.contains(&regs::VAP_PVS_CODE_CNTL_0));
}

#[test]
fn stats_are_reported_on_destroy() {
    init();
    let sink = Arc::new(CollectingStatsSink::new());
    let device = common::device(DeviceCaps::new(ChipFamily::R300));
    let backend: Arc<dyn DeviceBackend> = device.clone();
    let screen = Screen::new(
        backend,
        ScreenDescriptor {
            debug: DebugFlags::STATS,
            stats_sink: Some(sink.clone()),
        },
    );

    let mut ctx = common::context(&screen);
    let id = ctx.id();
    ctx.flush().unwrap();
    ctx.set_blend_color(BlendColor::default());
    ctx.flush().unwrap();
    drop(ctx);

    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    let stats = &reports[0];
    assert_eq!(stats.context_id, id);
    assert_eq!(stats.flushes, 2);
    assert_eq!(stats.emits_of("invariant_state"), Some(1));
    assert_eq!(stats.emits_of("blend_color_state"), Some(2));
    assert_eq!(stats.emits_of("dsa_state"), Some(0));
    assert!(stats.to_json().contains("\"flushes\":2"));
}

fn init() {
    common::init_tracing();
}
