//! Draw-call boundaries and frame/batch counters.

use crate::backend::{BatchDraw, GpuBackend, ProgramHandle};
use crate::batch::BatchBuffers;
use crate::coords::{Projection, Viewport};
use crate::error::{RenderError, RenderResult};
use crate::texture::TextureRegistry;

/// Why a batch was submitted.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BatchReason {
    /// End of a frame or cache pass.
    DrawFinish,
    /// No free texture slot for the next card.
    TextureOverflow,
    /// `max_cards_per_batch` reached.
    VertexOverflow,
    /// A resident texture is about to be re-uploaded.
    TextureUpdate,
    /// Pending cards drawn before a cache pass changes targets.
    CachePrep,
    /// Cards of a cached subtree.
    CacheDraw,
    /// Shader override switched.
    ProgramChange,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub draw_calls: usize,
    pub cover_draws: usize,
    pub cards: usize,
    pub texture_overflows: usize,
    pub vertex_overflows: usize,
}

/// Owns the frame and batch counters and submits filled batches.
#[derive(Debug)]
pub struct DrawScheduler {
    frame_id: u64,
    batch_id: u64,
    projection: Projection,
    program: Option<ProgramHandle>,
    stats: DrawStats,
}

impl DrawScheduler {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            frame_id: 0,
            batch_id: 0,
            projection: Projection::regular(viewport),
            program: None,
            stats: DrawStats::default(),
        }
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    #[inline]
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn stats(&self) -> &DrawStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = DrawStats::default();
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn set_projection(&mut self, projection: Projection) {
        self.projection = projection;
    }

    pub fn program(&self) -> Option<ProgramHandle> {
        self.program
    }

    pub fn set_program(&mut self, program: ProgramHandle) {
        self.program = Some(program);
    }

    pub fn record_cover(&mut self) {
        self.stats.cover_draws += 1;
    }

    pub fn begin_frame(&mut self, buffers: &mut BatchBuffers) {
        self.frame_id += 1;
        buffers.clear();
    }

    /// Draws the pending cards with the current program, projection and slot table.
    /// Does nothing when no cards are pending.
    pub fn flush<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        registry: &TextureRegistry,
        buffers: &mut BatchBuffers,
        reason: BatchReason,
    ) -> RenderResult<()> {
        let cards = buffers.card_count();
        if cards == 0 {
            return Ok(());
        }
        let Some(program) = self.program else {
            buffers.clear();
            return Err(RenderError::backend("batch flushed without a program"));
        };

        let textures = registry.slot_handles();
        let premultiplied = registry.premultiplied_slots();
        let result = backend.draw_batch(&BatchDraw {
            program,
            projection: &self.projection,
            vertices: buffers.vertices(),
            uvs: buffers.uvs(),
            indices: buffers.indices(),
            alphas: buffers.alphas(),
            card_count: cards,
            textures: &textures,
            premultiplied: &premultiplied,
        });

        log::trace!(
            "batch {} flushed: {cards} card(s), {reason:?}",
            self.batch_id
        );
        self.batch_id += 1;
        buffers.clear();
        result?;

        self.stats.draw_calls += 1;
        self.stats.cards += cards;
        match reason {
            BatchReason::TextureOverflow => self.stats.texture_overflows += 1,
            BatchReason::VertexOverflow => self.stats.vertex_overflows += 1,
            _ => {}
        }
        Ok(())
    }

    /// Submits whatever the frame left pending.
    pub fn end_frame<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        registry: &TextureRegistry,
        buffers: &mut BatchBuffers,
    ) -> RenderResult<()> {
        self.flush(backend, registry, buffers, BatchReason::DrawFinish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::coords::Vec2;
    use crate::shader::ShaderCompiler;

    fn card(buffers: &mut BatchBuffers) {
        let c = [
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(0.0, 1.0),
            Vec2::new(1.0, 1.0),
        ];
        buffers.push_card(c, c, 0, 1.0);
    }

    fn setup() -> (SoftwareBackend, TextureRegistry, DrawScheduler) {
        let mut backend = SoftwareBackend::new(4, 4);
        let mut registry = TextureRegistry::new(1, 16, false);
        registry.init_base(&mut backend).unwrap();
        let mut scheduler = DrawScheduler::new(Viewport::new(4, 4));
        let program = ShaderCompiler::new(1, false, false)
            .regular_program(&mut backend)
            .unwrap();
        scheduler.set_program(program);
        (backend, registry, scheduler)
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let (mut be, reg, mut sched) = setup();
        let mut buffers = BatchBuffers::with_capacity(4);
        sched.flush(&mut be, &reg, &mut buffers, BatchReason::DrawFinish).unwrap();
        assert_eq!(sched.batch_id(), 0);
        assert_eq!(be.stats().draw_calls, 0);
    }

    #[test]
    fn flush_draws_and_advances_batch() {
        let (mut be, reg, mut sched) = setup();
        let mut buffers = BatchBuffers::with_capacity(4);
        card(&mut buffers);
        card(&mut buffers);

        sched.flush(&mut be, &reg, &mut buffers, BatchReason::VertexOverflow).unwrap();
        assert_eq!(sched.batch_id(), 1);
        assert_eq!(buffers.card_count(), 0);
        assert_eq!(be.stats().cards_drawn, 2);
        assert_eq!(sched.stats().vertex_overflows, 1);
        assert_eq!(sched.stats().cards, 2);
    }

    #[test]
    fn begin_frame_advances_frame_and_drops_pending_cards() {
        let (_, _, mut sched) = setup();
        let mut buffers = BatchBuffers::with_capacity(4);
        card(&mut buffers);
        sched.begin_frame(&mut buffers);
        assert_eq!(sched.frame_id(), 1);
        assert_eq!(buffers.card_count(), 0);
    }
}
