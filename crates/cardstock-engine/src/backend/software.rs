use std::collections::HashMap;

use image::{Rgba, RgbaImage};

use crate::coords::{ColorRgba, Projection, Vec2, Viewport};
use crate::error::{RenderError, RenderResult};
use crate::shader::ProgramKind;

use super::{
    BatchDraw, CoverDraw, FramebufferHandle, GpuBackend, ProgramHandle, ProgramSource, TaintSet,
    TextureHandle,
};

/// Counters kept by `SoftwareBackend`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftwareStats {
    pub draw_calls: usize,
    pub cover_draws: usize,
    pub cards_drawn: usize,
    pub textures_created: usize,
    pub textures_deleted: usize,
    pub framebuffers_created: usize,
    pub uploads: usize,
    pub clears: usize,
    pub programs_compiled: usize,
}

#[derive(Debug, Copy, Clone)]
struct ProgramInfo {
    kind: ProgramKind,
    premultiply: bool,
}

/// CPU implementation of `GpuBackend`.
///
/// Cards are rasterized as parallelograms with nearest sampling and the same blend
/// equation as the GPU pipeline, dividing premultiplied slots by alpha as the batch
/// shader does. Cover passes run the filter's CPU kernel, which takes and returns
/// premultiplied texels like the fragment body. Failure injection hooks let tests
/// exercise degradation and exhaustion paths.
#[derive(Debug)]
pub struct SoftwareBackend {
    surface: RgbaImage,
    textures: HashMap<TextureHandle, RgbaImage>,
    framebuffers: HashMap<FramebufferHandle, TextureHandle>,
    programs: HashMap<ProgramHandle, ProgramInfo>,
    bound: Option<FramebufferHandle>,
    viewport: Viewport,
    next_id: u64,

    texture_units: usize,
    max_texture_size: u32,
    texture_budget: Option<usize>,
    compile_limit: Option<usize>,
    compile_attempts: Vec<usize>,
    smooth_sampling: bool,

    taint: TaintSet,
    stats: SoftwareStats,
}

impl SoftwareBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            surface: RgbaImage::new(width.max(1), height.max(1)),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            bound: None,
            viewport: Viewport::new(width.max(1), height.max(1)),
            next_id: 1,
            texture_units: 16,
            max_texture_size: 4096,
            texture_budget: None,
            compile_limit: None,
            compile_attempts: Vec::new(),
            smooth_sampling: false,
            taint: TaintSet::default(),
            stats: SoftwareStats::default(),
        }
    }

    pub fn with_texture_units(mut self, units: usize) -> Self {
        self.texture_units = units.max(1);
        self
    }

    pub fn with_max_texture_size(mut self, size: u32) -> Self {
        self.max_texture_size = size;
        self
    }

    /// Caps the number of live textures. Creation beyond it fails with
    /// `ResourceExhaustion`.
    pub fn set_texture_budget(&mut self, budget: Option<usize>) {
        self.texture_budget = budget;
    }

    /// Makes card programs with more than `limit` slots fail to compile.
    pub fn fail_compile_above(&mut self, limit: Option<usize>) {
        self.compile_limit = limit;
    }

    /// Slot counts of every regular program compile requested so far.
    pub fn compile_attempts(&self) -> &[usize] {
        &self.compile_attempts
    }

    /// Last sampling mode requested. Rasterization always samples nearest.
    pub fn smooth_sampling(&self) -> bool {
        self.smooth_sampling
    }

    pub fn stats(&self) -> &SoftwareStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = SoftwareStats::default();
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    /// Texture contents in storage order.
    pub fn texture_image(&self, texture: TextureHandle) -> Option<&RgbaImage> {
        self.textures.get(&texture)
    }

    /// Visible surface as displayed (first row at the top).
    pub fn surface_image(&self) -> RgbaImage {
        image::imageops::flip_vertical(&self.surface)
    }

    pub fn resize_surface(&mut self, width: u32, height: u32) {
        self.surface = RgbaImage::new(width.max(1), height.max(1));
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_size(&self, width: u32, height: u32) -> RenderResult<()> {
        if width > self.max_texture_size || height > self.max_texture_size {
            return Err(RenderError::exhausted(format!(
                "texture {width}x{height} exceeds the {} limit",
                self.max_texture_size
            )));
        }
        Ok(())
    }

    fn bound_texture(&self) -> Option<TextureHandle> {
        self.bound.and_then(|fb| self.framebuffers.get(&fb).copied())
    }

    /// Moves the bound target out so sources can be read while it is written.
    fn take_target(&mut self) -> RgbaImage {
        match self.bound_texture() {
            Some(tex) => self
                .textures
                .get_mut(&tex)
                .map(std::mem::take)
                .unwrap_or_default(),
            None => std::mem::take(&mut self.surface),
        }
    }

    fn restore_target(&mut self, target: RgbaImage) {
        match self.bound_texture() {
            Some(tex) => {
                if let Some(slot) = self.textures.get_mut(&tex) {
                    *slot = target;
                }
            }
            None => self.surface = target,
        }
    }
}

impl GpuBackend for SoftwareBackend {
    fn max_texture_units(&self) -> usize {
        self.texture_units
    }

    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn surface_size(&self) -> Viewport {
        Viewport::new(self.surface.width(), self.surface.height())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> RenderResult<TextureHandle> {
        self.check_size(width, height)?;
        if let Some(budget) = self.texture_budget {
            if self.textures.len() >= budget {
                return Err(RenderError::exhausted(format!(
                    "texture budget of {budget} reached"
                )));
            }
        }
        let handle = TextureHandle(self.next_handle());
        self.textures
            .insert(handle, RgbaImage::new(width.max(1), height.max(1)));
        self.stats.textures_created += 1;
        Ok(handle)
    }

    fn resize_texture(&mut self, texture: TextureHandle, width: u32, height: u32) -> RenderResult<()> {
        self.check_size(width, height)?;
        let slot = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RenderError::backend(format!("unknown texture {texture:?}")))?;
        *slot = RgbaImage::new(width.max(1), height.max(1));
        Ok(())
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        image: &RgbaImage,
        restricted: bool,
    ) -> RenderResult<()> {
        self.check_size(image.width(), image.height())?;
        let slot = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| RenderError::backend(format!("unknown texture {texture:?}")))?;
        *slot = image.clone();
        self.taint.set(texture, restricted);
        self.stats.uploads += 1;
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if self.textures.remove(&texture).is_some() {
            self.stats.textures_deleted += 1;
        }
        self.taint.forget(texture);
    }

    fn create_framebuffer(&mut self, texture: TextureHandle) -> RenderResult<FramebufferHandle> {
        if !self.textures.contains_key(&texture) {
            return Err(RenderError::backend(format!(
                "framebuffer for unknown texture {texture:?}"
            )));
        }
        let handle = FramebufferHandle(self.next_handle());
        self.framebuffers.insert(handle, texture);
        self.stats.framebuffers_created += 1;
        Ok(handle)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer);
        if self.bound == Some(framebuffer) {
            self.bound = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.bound = framebuffer;
    }

    fn bound_framebuffer(&self) -> Option<FramebufferHandle> {
        self.bound
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn set_smooth_sampling(&mut self, smooth: bool) {
        self.smooth_sampling = smooth;
    }

    fn clear(&mut self, color: ColorRgba) -> RenderResult<()> {
        let px = Rgba(color.to_rgba8());
        let mut target = self.take_target();
        for p in target.pixels_mut() {
            *p = px;
        }
        self.restore_target(target);
        if let Some(tex) = self.bound_texture() {
            self.taint.forget(tex);
        }
        self.stats.clears += 1;
        Ok(())
    }

    fn compile_program(&mut self, source: &ProgramSource) -> RenderResult<ProgramHandle> {
        let card_program = matches!(
            source.kind,
            ProgramKind::Regular | ProgramKind::Particle | ProgramKind::Override
        );
        if source.kind == ProgramKind::Regular {
            self.compile_attempts.push(source.slot_count);
        }
        if card_program {
            if let Some(limit) = self.compile_limit {
                if source.slot_count > limit {
                    return Err(RenderError::shader(
                        source.slot_count,
                        format!("{}: too many samplers", source.label),
                    ));
                }
            }
        }

        let handle = ProgramHandle(self.next_handle());
        self.programs.insert(
            handle,
            ProgramInfo {
                kind: source.kind,
                premultiply: source.premultiply,
            },
        );
        self.stats.programs_compiled += 1;
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn draw_batch(&mut self, draw: &BatchDraw<'_>) -> RenderResult<()> {
        let info = *self
            .programs
            .get(&draw.program)
            .ok_or_else(|| RenderError::backend(format!("unknown program {:?}", draw.program)))?;
        if info.kind == ProgramKind::Cover {
            return Err(RenderError::backend("cover program used for a card batch"));
        }

        let viewport = self.viewport;
        let mut target = self.take_target();

        for card in 0..draw.card_count {
            let v = card * 6;
            let slot = draw.indices[v] as usize;
            let Some(texture) = draw
                .textures
                .get(slot)
                .and_then(|handle| self.textures.get(handle))
            else {
                continue;
            };

            let corner = |i: usize| {
                (
                    Vec2::new(draw.vertices[i * 2], draw.vertices[i * 2 + 1]),
                    Vec2::new(draw.uvs[i * 2], draw.uvs[i * 2 + 1]),
                )
            };
            let card = CardQuad {
                top_left: corner(v),
                bottom_left: corner(v + 1),
                top_right: corner(v + 2),
                alpha: draw.alphas[v],
            };
            rasterize_card(
                &mut target,
                viewport,
                draw.projection,
                &card,
                texture,
                info.premultiply || draw.premultiplied.get(slot).copied().unwrap_or(false),
            );
        }

        self.restore_target(target);
        let bound = self.bound_texture();
        self.taint.propagate(draw.textures, bound);
        self.stats.draw_calls += 1;
        self.stats.cards_drawn += draw.card_count;
        Ok(())
    }

    fn draw_cover(&mut self, draw: &CoverDraw<'_>) -> RenderResult<()> {
        if !self.programs.contains_key(&draw.program) {
            return Err(RenderError::backend(format!("unknown program {:?}", draw.program)));
        }
        let source = self
            .textures
            .get(&draw.source)
            .ok_or_else(|| RenderError::backend(format!("unknown texture {:?}", draw.source)))?;

        let mut pass = remap_cover(source, self.viewport, draw.flip_y);
        if let Some(filter) = draw.filter {
            if !filter.apply_pixels(&mut pass) {
                log::debug!("filter {} declined to run", filter.shader_key());
            }
        }

        let mut target = self.take_target();
        for (x, y, px) in pass.enumerate_pixels() {
            if x < target.width() && y < target.height() {
                target.put_pixel(x, y, *px);
            }
        }
        self.restore_target(target);

        let bound = self.bound_texture();
        self.taint.propagate(&[draw.source], bound);
        self.stats.cover_draws += 1;
        Ok(())
    }

    fn read_pixels(&mut self, texture: TextureHandle) -> RenderResult<RgbaImage> {
        if self.taint.contains(texture) {
            return Err(RenderError::restricted(format!(
                "texture {texture:?} holds restricted pixels"
            )));
        }
        self.textures
            .get(&texture)
            .cloned()
            .ok_or_else(|| RenderError::backend(format!("unknown texture {texture:?}")))
    }
}

/// Three corners of a card (position, uv) plus its alpha. The fourth corner is implied.
struct CardQuad {
    top_left: (Vec2, Vec2),
    bottom_left: (Vec2, Vec2),
    top_right: (Vec2, Vec2),
    alpha: f32,
}

fn rasterize_card(
    target: &mut RgbaImage,
    viewport: Viewport,
    projection: &Projection,
    card: &CardQuad,
    texture: &RgbaImage,
    premultiplied: bool,
) {
    // Clip space to storage coordinates; row 0 sits at clip y = -1.
    let to_storage = |p: Vec2| {
        let c = projection.to_clip(p);
        Vec2::new(
            (c.x + 1.0) * 0.5 * viewport.width as f32,
            (c.y + 1.0) * 0.5 * viewport.height as f32,
        )
    };
    let origin = to_storage(card.top_left.0);
    let e1 = to_storage(card.top_right.0) - origin;
    let e2 = to_storage(card.bottom_left.0) - origin;
    let det = e1.cross(e2);
    if det.abs() < f32::EPSILON {
        return;
    }

    let far = origin + e1 + e2;
    let xs = [origin.x, origin.x + e1.x, origin.x + e2.x, far.x];
    let ys = [origin.y, origin.y + e1.y, origin.y + e2.y, far.y];
    let limit_w = viewport.width.min(target.width()) as f32;
    let limit_h = viewport.height.min(target.height()) as f32;
    let x0 = xs.iter().copied().fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let x1 = xs.iter().copied().fold(f32::MIN, f32::max).ceil().min(limit_w) as u32;
    let y0 = ys.iter().copied().fold(f32::MAX, f32::min).floor().max(0.0) as u32;
    let y1 = ys.iter().copied().fold(f32::MIN, f32::max).ceil().min(limit_h) as u32;

    let uv0 = card.top_left.1;
    let du = card.top_right.1 - uv0;
    let dv = card.bottom_left.1 - uv0;
    let (tw, th) = texture.dimensions();

    for y in y0..y1 {
        for x in x0..x1 {
            let d = Vec2::new(x as f32 + 0.5, y as f32 + 0.5) - origin;
            let s = d.cross(e2) / det;
            let t = e1.cross(d) / det;
            if !(0.0..1.0).contains(&s) || !(0.0..1.0).contains(&t) {
                continue;
            }
            let uv = uv0 + du * s + dv * t;
            let tx = ((uv.x * tw as f32).floor().max(0.0) as u32).min(tw - 1);
            let ty = ((uv.y * th as f32).floor().max(0.0) as u32).min(th - 1);
            let texel = *texture.get_pixel(tx, ty);
            blend_over(target.get_pixel_mut(x, y), texel, card.alpha, premultiplied);
        }
    }
}

/// `SRC_ALPHA, ONE_MINUS_SRC_ALPHA` for color, `ONE, ONE_MINUS_SRC_ALPHA` for alpha.
fn blend_over(dst: &mut Rgba<u8>, texel: Rgba<u8>, alpha: f32, premultiplied: bool) {
    let f = |v: u8| f32::from(v) / 255.0;
    let ta = f(texel[3]);
    let mut rgb = [f(texel[0]), f(texel[1]), f(texel[2])];
    if premultiplied {
        let a = ta.max(0.00001);
        for c in &mut rgb {
            *c = (*c / a).min(1.0);
        }
    }
    let sa = ta * alpha;
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    for (c, src) in rgb.iter().enumerate() {
        dst[c] = q(src * sa + f(dst[c]) * (1.0 - sa));
    }
    dst[3] = q(sa + f(dst[3]) * (1.0 - sa));
}

/// Samples `source` across the whole viewport with the cover UV set.
fn remap_cover(source: &RgbaImage, viewport: Viewport, flip_y: bool) -> RgbaImage {
    let (sw, sh) = source.dimensions();
    let (vw, vh) = (viewport.width.max(1), viewport.height.max(1));
    RgbaImage::from_fn(vw, vh, |x, y| {
        let u = (x as f32 + 0.5) / vw as f32;
        let row = (y as f32 + 0.5) / vh as f32;
        let v = if flip_y { row } else { 1.0 - row };
        let sx = ((u * sw as f32) as u32).min(sw - 1);
        let sy = ((v * sh as f32) as u32).min(sh - 1);
        *source.get_pixel(sx, sy)
    })
}
