//! Shared helpers for `pipegpu` integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use pipegpu::state::{
    FragmentShader, FramebufferState, VertexBuffer, VertexElement, VertexFormat, VertexShader,
};
use pipegpu::{
    BindFlags, ChipFamily, Context, ContextConfig, DeviceBackend, DeviceCaps, ImmediateDevice,
    Screen, ScreenDescriptor, TextureDesc, TextureFormat,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn device(caps: DeviceCaps) -> Arc<ImmediateDevice> {
    Arc::new(ImmediateDevice::new(caps))
}

pub fn screen_on(device: &Arc<ImmediateDevice>) -> Arc<Screen> {
    let backend: Arc<dyn DeviceBackend> = device.clone();
    Screen::new(backend, ScreenDescriptor::default())
}

/// Device plus screen for `family` with default capabilities.
pub fn setup(family: ChipFamily) -> (Arc<ImmediateDevice>, Arc<Screen>) {
    init_tracing();
    let device = device(DeviceCaps::new(family));
    let screen = screen_on(&device);
    (device, screen)
}

pub fn context(screen: &Arc<Screen>) -> Context {
    screen
        .create_context(ContextConfig::default())
        .expect("context creation")
}

/// Framebuffer with one RGBA8 colour buffer and, optionally, a Z24S8 depth buffer.
pub fn framebuffer(screen: &Screen, width: u32, height: u32, depth: bool) -> FramebufferState {
    let cbuf = screen
        .create_texture(
            TextureDesc::new(width, height, TextureFormat::Rgba8),
            BindFlags::RENDER_TARGET,
        )
        .expect("colour buffer");
    let zsbuf = depth.then(|| {
        screen
            .create_texture(
                TextureDesc::new(width, height, TextureFormat::Z24S8),
                BindFlags::DEPTH_STENCIL,
            )
            .expect("depth buffer")
    });
    FramebufferState {
        width,
        height,
        cbufs: vec![cbuf],
        zsbuf,
    }
}

pub fn vertex_shader() -> VertexShader {
    VertexShader {
        code: vec![0x00F0_0203, 0x00D1_0001, 0x0124_8001, 0x0124_8001],
        num_outputs: 1,
    }
}

pub fn fragment_shader() -> FragmentShader {
    FragmentShader {
        code: vec![0x0000_0001; 4],
        num_temps: 1,
        num_inputs: 1,
        ..FragmentShader::default()
    }
}

/// Bind everything a hardware-TCL draw needs: a 64x64 target, both shaders, and one vertex
/// buffer of `vertices` float4 positions.
pub fn bind_draw_state(ctx: &mut Context, screen: &Screen, vertices: u32) {
    ctx.set_framebuffer_state(framebuffer(screen, 64, 64, false))
        .expect("framebuffer");
    ctx.bind_vs_state(Some(vertex_shader())).expect("vertex shader");
    ctx.bind_fs_state(Some(fragment_shader()));
    let vbo = screen
        .create_buffer(u64::from(vertices) * 16, BindFlags::VERTEX_BUFFER)
        .expect("vertex buffer");
    ctx.set_vertex_buffers(vec![VertexBuffer {
        resource: vbo,
        stride: 16,
        offset: 0,
    }])
    .expect("vertex buffers");
    ctx.bind_vertex_elements(vec![VertexElement {
        buffer_index: 0,
        offset: 0,
        format: VertexFormat::Float4,
    }])
    .expect("vertex elements");
}
