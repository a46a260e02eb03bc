//! Leaf-to-card conversion and the CPU-side batch arrays.

use crate::backend::GpuBackend;
use crate::coords::{Rect, Vec2};
use crate::error::{RenderError, RenderResult};
use crate::scene::{Drawable, Leaf};
use crate::schedule::{BatchReason, DrawScheduler};
use crate::texture::{TextureId, TextureRegistry};

/// Vertices per card: two triangles, TL BL TR / BL TR BR.
pub const VERTICES_PER_CARD: usize = 6;

/// Per-vertex attribute arrays of the pending batch.
#[derive(Debug, Default)]
pub struct BatchBuffers {
    vertices: Vec<f32>,
    uvs: Vec<f32>,
    indices: Vec<f32>,
    alphas: Vec<f32>,
    card_count: usize,
}

impl BatchBuffers {
    pub fn with_capacity(cards: usize) -> Self {
        let n = cards * VERTICES_PER_CARD;
        Self {
            vertices: Vec::with_capacity(n * 2),
            uvs: Vec::with_capacity(n * 2),
            indices: Vec::with_capacity(n),
            alphas: Vec::with_capacity(n),
            card_count: 0,
        }
    }

    #[inline]
    pub fn card_count(&self) -> usize {
        self.card_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.card_count == 0
    }

    pub fn vertices(&self) -> &[f32] {
        &self.vertices
    }

    pub fn uvs(&self) -> &[f32] {
        &self.uvs
    }

    pub fn indices(&self) -> &[f32] {
        &self.indices
    }

    pub fn alphas(&self) -> &[f32] {
        &self.alphas
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
        self.uvs.clear();
        self.indices.clear();
        self.alphas.clear();
        self.card_count = 0;
    }

    /// Appends one card. Corners and uvs are given as TL, TR, BL, BR.
    pub fn push_card(&mut self, corners: [Vec2; 4], uvs: [Vec2; 4], slot: usize, alpha: f32) {
        const ORDER: [usize; VERTICES_PER_CARD] = [0, 2, 1, 2, 1, 3];
        for i in ORDER {
            self.vertices.extend_from_slice(&[corners[i].x, corners[i].y]);
            self.uvs.extend_from_slice(&[uvs[i].x, uvs[i].y]);
            self.indices.push(slot as f32);
            self.alphas.push(alpha);
        }
        self.card_count += 1;
    }
}

/// Mutable renderer state a leaf append touches.
pub struct BatchCtx<'a, B: GpuBackend> {
    pub backend: &'a mut B,
    pub registry: &'a mut TextureRegistry,
    pub scheduler: &'a mut DrawScheduler,
}

impl<'a, B: GpuBackend> BatchCtx<'a, B> {
    #[inline]
    pub fn new(
        backend: &'a mut B,
        registry: &'a mut TextureRegistry,
        scheduler: &'a mut DrawScheduler,
    ) -> Self {
        Self {
            backend,
            registry,
            scheduler,
        }
    }
}

/// Converts leaves into cards, flushing whenever a batch limit is hit.
#[derive(Debug)]
pub struct BatchAssembler {
    buffers: BatchBuffers,
    max_cards: usize,
    warned_unready: bool,
}

impl BatchAssembler {
    pub fn new(max_cards: usize) -> Self {
        let max_cards = max_cards.max(1);
        Self {
            buffers: BatchBuffers::with_capacity(max_cards.min(1024)),
            max_cards,
            warned_unready: false,
        }
    }

    pub fn buffers(&self) -> &BatchBuffers {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut BatchBuffers {
        &mut self.buffers
    }

    pub fn flush<B: GpuBackend>(&mut self, ctx: &mut BatchCtx<'_, B>, reason: BatchReason) -> RenderResult<()> {
        ctx.scheduler
            .flush(ctx.backend, ctx.registry, &mut self.buffers, reason)
    }

    /// Appends every leaf in order.
    pub fn append_leaves<B: GpuBackend>(&mut self, ctx: &mut BatchCtx<'_, B>, leaves: &[Leaf]) -> RenderResult<()> {
        for leaf in leaves {
            self.append_leaf(ctx, leaf)?;
        }
        Ok(())
    }

    /// Appends one leaf as a card. Leaves without pixels yet are skipped.
    pub fn append_leaf<B: GpuBackend>(&mut self, ctx: &mut BatchCtx<'_, B>, leaf: &Leaf) -> RenderResult<()> {
        if leaf.alpha <= 0.0 {
            return Ok(());
        }

        let Some(texture) = self.resolve(ctx, &leaf.drawable)? else {
            return Ok(());
        };

        if self.buffers.card_count() >= self.max_cards {
            self.flush(ctx, BatchReason::VertexOverflow)?;
        }

        if ctx.registry.needs_upload(texture) {
            let resident = ctx.registry.get(texture).is_some_and(|t| {
                t.slot.is_some() && t.last_batch == Some(ctx.scheduler.batch_id())
            });
            if resident {
                self.flush(ctx, BatchReason::TextureUpdate)?;
            }
            ctx.registry.upload(ctx.backend, texture)?;
        }

        let slot = match ctx.registry.bind(texture, ctx.scheduler.batch_id()) {
            Some(slot) => slot,
            None => {
                self.flush(ctx, BatchReason::TextureOverflow)?;
                ctx.registry
                    .bind(texture, ctx.scheduler.batch_id())
                    .ok_or_else(|| RenderError::exhausted("every texture slot is protected"))?
            }
        };
        ctx.registry
            .mark_used(texture, ctx.scheduler.frame_id(), ctx.scheduler.batch_id());

        let Some(tex) = ctx.registry.get(texture) else {
            return Ok(());
        };
        let size = Vec2::new(tex.width.max(1) as f32, tex.height.max(1) as f32);
        let (local, uv) = card_rects(&leaf.drawable, size);

        let corners = [
            Vec2::new(local.min().x, local.min().y),
            Vec2::new(local.max().x, local.min().y),
            Vec2::new(local.min().x, local.max().y),
            Vec2::new(local.max().x, local.max().y),
        ]
        .map(|p| leaf.world.apply(p));
        let uvs = [
            Vec2::new(uv.min().x, uv.min().y),
            Vec2::new(uv.max().x, uv.min().y),
            Vec2::new(uv.min().x, uv.max().y),
            Vec2::new(uv.max().x, uv.max().y),
        ];

        self.buffers.push_card(corners, uvs, slot, leaf.alpha);
        Ok(())
    }

    /// Texture a drawable samples, registering its source on first sight.
    fn resolve<B: GpuBackend>(
        &mut self,
        ctx: &mut BatchCtx<'_, B>,
        drawable: &Drawable,
    ) -> RenderResult<Option<TextureId>> {
        match drawable {
            Drawable::CachedSubtree { texture, .. } => {
                if ctx.registry.get(*texture).is_none() {
                    log::debug!("skipping cached leaf with released texture {texture:?}");
                    return Ok(None);
                }
                Ok(Some(*texture))
            }
            Drawable::Bitmap { image, .. } | Drawable::AtlasFrame { image, .. } => {
                if !image.is_ready() {
                    if !self.warned_unready {
                        log::debug!("skipping leaf whose image {:?} is not loaded", image.id());
                        self.warned_unready = true;
                    }
                    return Ok(None);
                }
                let frame_id = ctx.scheduler.frame_id();
                ctx.registry.register(ctx.backend, image, frame_id).map(Some)
            }
        }
    }
}

/// Local-space card rectangle and its normalized uv rectangle.
fn card_rects(drawable: &Drawable, texture_size: Vec2) -> (Rect, Rect) {
    let normalize = |r: Rect| {
        Rect::new(
            r.origin.x / texture_size.x,
            r.origin.y / texture_size.y,
            r.size.x / texture_size.x,
            r.size.y / texture_size.y,
        )
    };

    match drawable {
        Drawable::Bitmap { source_rect, .. } => {
            let src = source_rect.unwrap_or(Rect::from_size(texture_size.x, texture_size.y));
            (Rect::from_size(src.size.x, src.size.y), normalize(src))
        }
        Drawable::AtlasFrame {
            rect, reg_x, reg_y, ..
        } => (
            Rect::new(-reg_x, -reg_y, rect.size.x, rect.size.y),
            normalize(*rect),
        ),
        Drawable::CachedSubtree { draw_rect, .. } => (*draw_rect, Rect::from_size(1.0, 1.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::coords::{Affine, Viewport};
    use crate::scene::ImageSource;
    use crate::shader::ShaderCompiler;
    use image::RgbaImage;

    struct Harness {
        backend: SoftwareBackend,
        registry: TextureRegistry,
        scheduler: DrawScheduler,
        assembler: BatchAssembler,
    }

    impl Harness {
        fn new(slots: usize, max_cards: usize) -> Self {
            let mut backend = SoftwareBackend::new(64, 64);
            let mut registry = TextureRegistry::new(slots, 16, false);
            registry.init_base(&mut backend).unwrap();
            let mut scheduler = DrawScheduler::new(Viewport::new(64, 64));
            let program = ShaderCompiler::new(slots, false, false)
                .regular_program(&mut backend)
                .unwrap();
            scheduler.set_program(program);
            Self {
                backend,
                registry,
                scheduler,
                assembler: BatchAssembler::new(max_cards),
            }
        }

        fn append(&mut self, leaf: &Leaf) {
            let mut ctx = BatchCtx::new(&mut self.backend, &mut self.registry, &mut self.scheduler);
            self.assembler.append_leaf(&mut ctx, leaf).unwrap();
        }
    }

    fn image(w: u32, h: u32) -> ImageSource {
        ImageSource::new(RgbaImage::new(w, h))
    }

    // ── geometry ──────────────────────────────────────────────────────────

    #[test]
    fn card_vertices_follow_world_transform() {
        let mut h = Harness::new(2, 10);
        let src = image(4, 2);
        h.append(&Leaf::bitmap(&src, Affine::translation(10.0, 20.0)));

        let v = h.assembler.buffers().vertices();
        // TL, BL, TR
        assert_eq!(&v[0..6], &[10.0, 20.0, 10.0, 22.0, 14.0, 20.0]);
        assert_eq!(h.assembler.buffers().alphas(), &[1.0; 6]);
    }

    #[test]
    fn atlas_frame_uses_registration_point_and_sub_uvs() {
        let mut h = Harness::new(2, 10);
        let sheet = image(8, 8);
        let rect = Rect::new(4.0, 0.0, 4.0, 2.0);
        h.append(&Leaf::atlas_frame(&sheet, rect, (2.0, 1.0), Affine::IDENTITY));

        let buffers = h.assembler.buffers();
        assert_eq!(&buffers.vertices()[0..2], &[-2.0, -1.0]);
        assert_eq!(&buffers.uvs()[0..2], &[0.5, 0.0]);
        // BR corner is the last vertex.
        assert_eq!(&buffers.uvs()[10..12], &[1.0, 0.25]);
    }

    #[test]
    fn bitmap_source_rect_sizes_the_card() {
        let mut h = Harness::new(2, 10);
        let src = image(10, 10);
        let leaf = Leaf::bitmap(&src, Affine::IDENTITY).with_source_rect(Rect::new(5.0, 5.0, 5.0, 5.0));
        h.append(&leaf);
        let buffers = h.assembler.buffers();
        assert_eq!(&buffers.vertices()[10..12], &[5.0, 5.0]);
        assert_eq!(&buffers.uvs()[0..2], &[0.5, 0.5]);
    }

    // ── batching ──────────────────────────────────────────────────────────

    #[test]
    fn full_batch_flushes_with_vertex_overflow() {
        let mut h = Harness::new(2, 3);
        let src = image(1, 1);
        for _ in 0..7 {
            h.append(&Leaf::bitmap(&src, Affine::IDENTITY));
        }
        assert_eq!(h.scheduler.stats().vertex_overflows, 2);
        assert_eq!(h.assembler.buffers().card_count(), 1);
    }

    #[test]
    fn texture_overflow_flushes_and_rebinds() {
        let mut h = Harness::new(2, 100);
        let sources: Vec<_> = (0..3).map(|_| image(1, 1)).collect();
        for src in &sources {
            h.append(&Leaf::bitmap(src, Affine::IDENTITY));
        }
        assert_eq!(h.scheduler.stats().texture_overflows, 1);
        assert_eq!(h.scheduler.batch_id(), 1);
        assert_eq!(h.assembler.buffers().indices()[0], 0.0);
    }

    #[test]
    fn unready_and_invisible_leaves_are_skipped() {
        let mut h = Harness::new(2, 10);
        h.append(&Leaf::bitmap(&ImageSource::pending(), Affine::IDENTITY));
        h.append(&Leaf::bitmap(&image(1, 1), Affine::IDENTITY).with_alpha(0.0));
        assert!(h.assembler.buffers().is_empty());
        assert!(h.registry.is_empty());
    }

    #[test]
    fn changed_source_flushes_before_reupload() {
        let mut h = Harness::new(2, 10);
        let src = image(2, 2);
        h.append(&Leaf::bitmap(&src, Affine::IDENTITY));
        src.set_image(RgbaImage::new(4, 4));
        h.append(&Leaf::bitmap(&src, Affine::IDENTITY));

        assert_eq!(h.backend.stats().draw_calls, 1);
        let id = h.registry.lookup(src.id()).unwrap();
        assert_eq!(h.registry.get(id).unwrap().width, 4);
    }
}
