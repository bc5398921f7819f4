//! Software vertex path for chips without hardware TCL.
//!
//! Vertices arrive already in window coordinates with the position in the first four floats of
//! each vertex. The pipeline splits strips into lists, widens lines and points above the
//! configured thresholds into triangles, and hands the resulting batches to a [`RenderStage`].

use std::fmt;

use tracing::trace;

use crate::error::ContextError;
use crate::state::PrimitiveMode;

/// Widening thresholds of a freshly created pipeline.
pub const DEFAULT_WIDE_LINE_THRESHOLD: f32 = 1.5;
pub const DEFAULT_WIDE_POINT_THRESHOLD: f32 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct PrimitiveBatch {
    pub mode: PrimitiveMode,
    /// Floats per vertex.
    pub stride: usize,
    pub vertices: Vec<f32>,
}

impl PrimitiveBatch {
    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / self.stride.max(1)
    }
}

/// Consumer of processed primitives.
pub trait RenderStage: Send {
    fn render(&mut self, batch: PrimitiveBatch);
    /// Hand over everything rendered since the last call.
    fn take_batches(&mut self) -> Vec<PrimitiveBatch>;
}

/// Stage that queues batches until the owner drains them.
#[derive(Debug, Default)]
pub struct QueueStage {
    batches: Vec<PrimitiveBatch>,
}

impl RenderStage for QueueStage {
    fn render(&mut self, batch: PrimitiveBatch) {
        self.batches.push(batch);
    }

    fn take_batches(&mut self) -> Vec<PrimitiveBatch> {
        std::mem::take(&mut self.batches)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterParams {
    pub line_width: f32,
    pub point_size: f32,
}

impl Default for RasterParams {
    fn default() -> Self {
        Self {
            line_width: 1.0,
            point_size: 1.0,
        }
    }
}

pub struct SoftwarePipeline {
    stage: Box<dyn RenderStage>,
    wide_line_threshold: f32,
    wide_point_threshold: f32,
}

impl SoftwarePipeline {
    pub fn new(stage: Box<dyn RenderStage>) -> Self {
        Self {
            stage,
            wide_line_threshold: DEFAULT_WIDE_LINE_THRESHOLD,
            wide_point_threshold: DEFAULT_WIDE_POINT_THRESHOLD,
        }
    }

    pub fn set_wide_line_threshold(&mut self, threshold: f32) {
        self.wide_line_threshold = threshold;
    }

    pub fn set_wide_point_threshold(&mut self, threshold: f32) {
        self.wide_point_threshold = threshold;
    }

    pub fn wide_line_threshold(&self) -> f32 {
        self.wide_line_threshold
    }

    pub fn wide_point_threshold(&self) -> f32 {
        self.wide_point_threshold
    }

    pub fn run(
        &mut self,
        mode: PrimitiveMode,
        vertices: &[f32],
        stride: usize,
        raster: &RasterParams,
    ) -> Result<(), ContextError> {
        if stride < 4 {
            return Err(ContextError::BadArgument(
                "software vertices need at least a position",
            ));
        }
        if vertices.len() % stride != 0 {
            return Err(ContextError::BadArgument(
                "vertex data is not a whole number of vertices",
            ));
        }
        let verts: Vec<&[f32]> = vertices.chunks_exact(stride).collect();
        if verts.is_empty() {
            return Ok(());
        }

        let batch = match mode {
            PrimitiveMode::Lines | PrimitiveMode::LineStrip
                if raster.line_width > self.wide_line_threshold =>
            {
                let segments = line_segments(mode, &verts);
                widen_lines(&segments, stride, raster.line_width * 0.5)
            }
            PrimitiveMode::Points if raster.point_size > self.wide_point_threshold => {
                widen_points(&verts, stride, raster.point_size * 0.5)
            }
            PrimitiveMode::TriangleStrip | PrimitiveMode::TriangleFan => PrimitiveBatch {
                mode: PrimitiveMode::Triangles,
                stride,
                vertices: triangulate(mode, &verts),
            },
            _ => PrimitiveBatch {
                mode,
                stride,
                vertices: vertices.to_vec(),
            },
        };
        trace!(mode = ?batch.mode, vertices = batch.vertex_count(), "software batch");
        if batch.vertex_count() > 0 {
            self.stage.render(batch);
        }
        Ok(())
    }

    pub fn take_batches(&mut self) -> Vec<PrimitiveBatch> {
        self.stage.take_batches()
    }
}

impl fmt::Debug for SoftwarePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwarePipeline")
            .field("wide_line_threshold", &self.wide_line_threshold)
            .field("wide_point_threshold", &self.wide_point_threshold)
            .finish()
    }
}

fn line_segments<'a>(mode: PrimitiveMode, verts: &[&'a [f32]]) -> Vec<(&'a [f32], &'a [f32])> {
    match mode {
        PrimitiveMode::LineStrip => verts.windows(2).map(|w| (w[0], w[1])).collect(),
        _ => verts.chunks_exact(2).map(|c| (c[0], c[1])).collect(),
    }
}

fn push_offset(out: &mut Vec<f32>, v: &[f32], dx: f32, dy: f32) {
    out.push(v[0] + dx);
    out.push(v[1] + dy);
    out.extend_from_slice(&v[2..]);
}

fn widen_lines(segments: &[(&[f32], &[f32])], stride: usize, half_width: f32) -> PrimitiveBatch {
    let mut out = Vec::with_capacity(segments.len() * 6 * stride);
    for &(a, b) in segments {
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        let len = (dx * dx + dy * dy).sqrt();
        if len == 0.0 {
            continue;
        }
        let (nx, ny) = (-dy / len * half_width, dx / len * half_width);
        push_offset(&mut out, a, nx, ny);
        push_offset(&mut out, a, -nx, -ny);
        push_offset(&mut out, b, nx, ny);
        push_offset(&mut out, b, nx, ny);
        push_offset(&mut out, a, -nx, -ny);
        push_offset(&mut out, b, -nx, -ny);
    }
    PrimitiveBatch {
        mode: PrimitiveMode::Triangles,
        stride,
        vertices: out,
    }
}

fn widen_points(verts: &[&[f32]], stride: usize, half: f32) -> PrimitiveBatch {
    let mut out = Vec::with_capacity(verts.len() * 6 * stride);
    for v in verts {
        push_offset(&mut out, v, -half, -half);
        push_offset(&mut out, v, half, -half);
        push_offset(&mut out, v, half, half);
        push_offset(&mut out, v, -half, -half);
        push_offset(&mut out, v, half, half);
        push_offset(&mut out, v, -half, half);
    }
    PrimitiveBatch {
        mode: PrimitiveMode::Triangles,
        stride,
        vertices: out,
    }
}

fn triangulate(mode: PrimitiveMode, verts: &[&[f32]]) -> Vec<f32> {
    let mut out = Vec::new();
    for i in 2..verts.len() {
        let tri = match mode {
            PrimitiveMode::TriangleFan => [verts[0], verts[i - 1], verts[i]],
            // Keep winding consistent on odd strip triangles.
            _ if i % 2 == 1 => [verts[i - 1], verts[i - 2], verts[i]],
            _ => [verts[i - 2], verts[i - 1], verts[i]],
        };
        for v in tri {
            out.extend_from_slice(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn pipeline() -> SoftwarePipeline {
        SoftwarePipeline::new(Box::<QueueStage>::default())
    }

    fn wide(line_width: f32) -> RasterParams {
        RasterParams {
            line_width,
            point_size: 1.0,
        }
    }

    #[test]
    fn thin_lines_pass_through() {
        let mut p = pipeline();
        let verts = [0.0, 0.0, 0.0, 1.0, 10.0, 0.0, 0.0, 1.0];
        p.run(PrimitiveMode::Lines, &verts, 4, &wide(1.0)).unwrap();
        let batches = p.take_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].mode, PrimitiveMode::Lines);
        assert_eq!(batches[0].vertices, verts.to_vec());
    }

    #[test]
    fn lines_above_threshold_become_quads() {
        let mut p = pipeline();
        p.set_wide_line_threshold(1.0);
        let verts = [0.0, 0.0, 0.5, 1.0, 10.0, 0.0, 0.5, 1.0];
        p.run(PrimitiveMode::Lines, &verts, 4, &wide(4.0)).unwrap();

        let batch = p.take_batches().remove(0);
        assert_eq!(batch.mode, PrimitiveMode::Triangles);
        assert_eq!(batch.vertex_count(), 6);
        let ys: Vec<f32> = batch.vertices.chunks(4).map(|v| v[1]).collect();
        assert_eq!(ys, vec![2.0, -2.0, 2.0, 2.0, -2.0, -2.0]);
        // Non-position attributes are carried over.
        assert!(batch.vertices.chunks(4).all(|v| v[2] == 0.5 && v[3] == 1.0));
    }

    #[test]
    fn default_context_threshold_never_widens_ordinary_lines() {
        let mut p = pipeline();
        p.set_wide_line_threshold(10_000_000.0);
        let verts = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0];
        p.run(PrimitiveMode::Lines, &verts, 4, &wide(64.0)).unwrap();
        assert_eq!(p.take_batches()[0].mode, PrimitiveMode::Lines);
    }

    #[test]
    fn line_strips_widen_per_segment() {
        let mut p = pipeline();
        let verts = [0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 1.0];
        p.run(PrimitiveMode::LineStrip, &verts, 4, &wide(2.0)).unwrap();
        assert_eq!(p.take_batches()[0].vertex_count(), 12);
    }

    #[test]
    fn wide_points_become_two_triangles() {
        let mut p = pipeline();
        let verts = [5.0, 5.0, 0.0, 1.0];
        p.run(
            PrimitiveMode::Points,
            &verts,
            4,
            &RasterParams {
                line_width: 1.0,
                point_size: 2.0,
            },
        )
        .unwrap();
        let batch = p.take_batches().remove(0);
        assert_eq!(batch.vertex_count(), 6);
        assert_eq!(&batch.vertices[..2], &[4.0, 4.0]);
    }

    #[test]
    fn fans_are_triangulated() {
        let mut p = pipeline();
        let verts: Vec<f32> = (0..5).flat_map(|i| [i as f32, 0.0, 0.0, 1.0]).collect();
        p.run(PrimitiveMode::TriangleFan, &verts, 4, &RasterParams::default())
            .unwrap();
        let batch = p.take_batches().remove(0);
        assert_eq!(batch.vertex_count(), 9);
        let xs: Vec<f32> = batch.vertices.chunks(4).map(|v| v[0]).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 0.0, 2.0, 3.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn ragged_vertex_data_is_rejected() {
        let mut p = pipeline();
        assert!(matches!(
            p.run(PrimitiveMode::Points, &[0.0; 6], 4, &RasterParams::default()),
            Err(ContextError::BadArgument(_))
        ));
        assert!(p.take_batches().is_empty());
    }
}
