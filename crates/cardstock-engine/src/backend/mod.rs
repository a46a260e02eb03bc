//! Device seam for the renderer.
//!
//! `Renderer` drives a `GpuBackend` with GL-like semantics:
//! - storage row 0 of any framebuffer is clip-space `y = -1`
//! - texture coordinate `v = 0` samples storage row 0
//! - uploaded images keep their first row at `v = 0`
//!
//! `WgpuBackend` maps these onto wgpu. `SoftwareBackend` executes them on the CPU and
//! serves as the reference device for tests.

use std::collections::HashSet;

use image::RgbaImage;

use crate::coords::{ColorRgba, Projection, Viewport};
use crate::error::RenderResult;
use crate::filter::{Filter, FILTER_PARAM_COUNT};
use crate::shader::ProgramKind;

mod gpu;
mod software;

pub use gpu::WgpuBackend;
pub use software::{SoftwareBackend, SoftwareStats};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TextureHandle(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FramebufferHandle(pub u64);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ProgramHandle(pub u64);

/// Generated program text plus the metadata a backend needs to build a pipeline.
#[derive(Debug, Clone)]
pub struct ProgramSource {
    pub label: String,
    pub kind: ProgramKind,
    /// Number of sampled textures the program declares.
    pub slot_count: usize,
    /// Texel data is premultiplied and must be divided by alpha when sampled.
    pub premultiply: bool,
    pub wgsl: String,
}

/// One batch draw: `card_count * 6` vertices over the current slot table.
pub struct BatchDraw<'a> {
    pub program: ProgramHandle,
    pub projection: &'a Projection,
    /// Two floats per vertex.
    pub vertices: &'a [f32],
    /// Two floats per vertex.
    pub uvs: &'a [f32],
    /// Texture slot per vertex.
    pub indices: &'a [f32],
    pub alphas: &'a [f32],
    pub card_count: usize,
    /// One handle per program slot.
    pub textures: &'a [TextureHandle],
    /// Slots holding premultiplied texels the program does not already divide by
    /// alpha. Parallel to `textures`.
    pub premultiplied: &'a [bool],
}

/// One full-target quad sampling `source` through a cover program.
pub struct CoverDraw<'a> {
    pub program: ProgramHandle,
    pub source: TextureHandle,
    /// Use the flipped UV set. Without it the copy inverts storage rows.
    pub flip_y: bool,
    pub params: [f32; FILTER_PARAM_COUNT],
    /// Filter the program was generated from; `None` for a plain blit.
    pub filter: Option<&'a dyn Filter>,
}

/// GPU operations used by the renderer. All calls happen on one thread, in order.
pub trait GpuBackend {
    /// Hardware texture units available to one program.
    fn max_texture_units(&self) -> usize;

    fn max_texture_size(&self) -> u32;

    /// Size of the visible surface.
    fn surface_size(&self) -> Viewport;

    fn begin_frame(&mut self) -> RenderResult<()> {
        Ok(())
    }

    fn end_frame(&mut self) -> RenderResult<()> {
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> RenderResult<TextureHandle>;

    /// Resizes in place. Contents become undefined.
    fn resize_texture(&mut self, texture: TextureHandle, width: u32, height: u32)
    -> RenderResult<()>;

    /// Uploads pixels, resizing the texture to match. A `restricted` upload taints it.
    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        image: &RgbaImage,
        restricted: bool,
    ) -> RenderResult<()>;

    fn delete_texture(&mut self, texture: TextureHandle);

    fn create_framebuffer(&mut self, texture: TextureHandle) -> RenderResult<FramebufferHandle>;

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// `None` targets the visible surface.
    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>);

    fn bound_framebuffer(&self) -> Option<FramebufferHandle>;

    fn set_viewport(&mut self, viewport: Viewport);

    /// Linear card sampling when `smooth`, nearest otherwise.
    fn set_smooth_sampling(&mut self, smooth: bool);

    fn viewport(&self) -> Viewport;

    /// Clears the bound target.
    fn clear(&mut self, color: ColorRgba) -> RenderResult<()>;

    fn compile_program(&mut self, source: &ProgramSource) -> RenderResult<ProgramHandle>;

    fn delete_program(&mut self, program: ProgramHandle);

    fn draw_batch(&mut self, draw: &BatchDraw<'_>) -> RenderResult<()>;

    fn draw_cover(&mut self, draw: &CoverDraw<'_>) -> RenderResult<()>;

    /// Reads a texture back in storage order. Fails with `SecurityRestriction` for
    /// tainted textures.
    fn read_pixels(&mut self, texture: TextureHandle) -> RenderResult<RgbaImage>;
}

/// Tracks textures holding restricted pixels, shared by both backends.
#[derive(Debug, Default)]
pub(crate) struct TaintSet {
    tainted: HashSet<TextureHandle>,
}

impl TaintSet {
    pub fn set(&mut self, texture: TextureHandle, tainted: bool) {
        if tainted {
            self.tainted.insert(texture);
        } else {
            self.tainted.remove(&texture);
        }
    }

    pub fn contains(&self, texture: TextureHandle) -> bool {
        self.tainted.contains(&texture)
    }

    /// Taints `target` if any of `inputs` is tainted.
    pub fn propagate(&mut self, inputs: &[TextureHandle], target: Option<TextureHandle>) {
        let Some(target) = target else { return };
        if inputs.iter().any(|t| self.tainted.contains(t)) {
            self.tainted.insert(target);
        }
    }

    pub fn forget(&mut self, texture: TextureHandle) {
        self.tainted.remove(&texture);
    }
}

/// Copy of `image` with color channels multiplied by alpha.
pub(crate) fn premultiplied(image: &RgbaImage) -> RgbaImage {
    let mut out = image.clone();
    for px in out.pixels_mut() {
        let a = u16::from(px[3]);
        for c in 0..3 {
            px[c] = ((u16::from(px[c]) * a + 127) / 255) as u8;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taint_propagates_to_target_only_from_tainted_inputs() {
        let mut taint = TaintSet::default();
        let (a, b, target) = (TextureHandle(1), TextureHandle(2), TextureHandle(3));

        taint.propagate(&[a, b], Some(target));
        assert!(!taint.contains(target));

        taint.set(b, true);
        taint.propagate(&[a, b], Some(target));
        assert!(taint.contains(target));

        taint.forget(target);
        assert!(!taint.contains(target));
    }

    #[test]
    fn premultiply_scales_color_by_alpha() {
        let img = RgbaImage::from_pixel(1, 1, image::Rgba([200, 100, 50, 128]));
        let p = premultiplied(&img);
        assert_eq!(p.get_pixel(0, 0).0, [100, 50, 25, 128]);
    }
}
