//! Filters applied to cached subtrees.
//!
//! A filter supplies two renditions of the same effect: a WGSL fragment body for the
//! GPU cover pass and a CPU kernel for read-back pixels. Both see the premultiplied
//! color that render targets hold and must produce premultiplied color. Multi-pass
//! effects chain additional passes through `multi_pass`.

use std::borrow::Cow;

use image::RgbaImage;

use crate::coords::Rect;

mod blur;
mod color;
mod color_matrix;
mod pipeline;

pub use blur::{BlurFilter, BlurPass};
pub use color::ColorFilter;
pub use color_matrix::ColorMatrixFilter;
pub(crate) use pipeline::{apply_cpu_filters, ChainOutput, FilterCtx, FilterPipeline};

/// Floats available to a cover program (`array<vec4<f32>, 5>` in WGSL).
pub const FILTER_PARAM_COUNT: usize = 20;

pub trait Filter {
    /// Identifies the generated program. Filters with equal keys must have equal
    /// fragment bodies.
    fn shader_key(&self) -> Cow<'_, str>;

    /// WGSL statements ending in `return`. In scope: `in.uv`, `src_tex`, `src_smp`,
    /// `u.texel` (source texel size) and `u.params`.
    fn fragment_body(&self) -> Cow<'_, str>;

    fn params(&self) -> [f32; FILTER_PARAM_COUNT] {
        [0.0; FILTER_PARAM_COUNT]
    }

    /// Extra space the effect needs around the content, relative to the content rect.
    fn bounds(&self) -> Option<Rect> {
        None
    }

    /// Next pass of the same effect, if any.
    fn multi_pass(&self) -> Option<&dyn Filter> {
        None
    }

    /// Applies this pass to premultiplied pixels in place, matching what the fragment
    /// body does to a sampled texel. Returns false if the filter could not run.
    fn apply_pixels(&self, image: &mut RgbaImage) -> bool;
}

/// Runs `f` over the straight-alpha color of each premultiplied pixel, then clamps and
/// premultiplies the result. Mirrors the divide, map, multiply sequence of the
/// color filter bodies.
fn map_straight(image: &mut RgbaImage, f: impl Fn([f32; 4]) -> [f32; 4]) {
    for px in image.pixels_mut() {
        let mut color = px.0.map(|c| f32::from(c) / 255.0);
        let alpha = color[3];
        if alpha > 0.0 {
            for c in &mut color[..3] {
                *c /= alpha;
            }
        }
        let out = f(color).map(|c| c.clamp(0.0, 1.0));
        let q = |v: f32| (v * 255.0).round() as u8;
        px.0 = [
            q(out[0] * out[3]),
            q(out[1] * out[3]),
            q(out[2] * out[3]),
            q(out[3]),
        ];
    }
}

/// Flattens filters and their multi-pass chains into execution order.
pub fn expand_passes<'a>(filters: &[&'a dyn Filter]) -> Vec<&'a dyn Filter> {
    let mut passes = Vec::with_capacity(filters.len());
    for &filter in filters {
        let mut next = Some(filter);
        while let Some(pass) = next {
            passes.push(pass);
            next = pass.multi_pass();
        }
    }
    passes
}

/// Union of every pass's bounds, or `None` if no pass bleeds.
pub fn combined_bounds(filters: &[&dyn Filter]) -> Option<Rect> {
    expand_passes(filters)
        .iter()
        .filter_map(|f| f.bounds())
        .reduce(Rect::union)
}
