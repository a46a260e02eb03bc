//! The batch renderer and its control surface.

use crate::backend::{CoverDraw, FramebufferHandle, GpuBackend, ProgramHandle};
use crate::batch::{BatchAssembler, BatchCtx};
use crate::cache::{CacheDescriptor, CacheOutput, CachePlan};
use crate::config::RendererConfig;
use crate::coords::{ColorRgba, Projection, Viewport};
use crate::error::{RenderError, RenderResult};
use crate::filter::{
    apply_cpu_filters, combined_bounds, ChainOutput, Filter, FilterCtx, FilterPipeline,
    FILTER_PARAM_COUNT,
};
use crate::scene::{ImageSource, Leaf, NodeId};
use crate::schedule::{BatchReason, DrawScheduler, DrawStats};
use crate::shader::{ShaderCompiler, ShaderOverride};
use crate::target::RenderTargetManager;
use crate::texture::{SlotTable, TextureId, TextureRegistry};

/// GPU state a cache pass replaces and must put back.
struct SavedState {
    framebuffer: Option<FramebufferHandle>,
    viewport: Viewport,
    projection: Projection,
    program: Option<ProgramHandle>,
    slots: SlotTable,
}

/// Batches leaves into as few draw calls as the texture slots allow.
///
/// One instance owns all of its GPU resources and state. Frames are either drawn in one
/// call with `draw_frame`, or streamed with `begin_frame` / `append_leaf` /
/// `end_frame`.
pub struct Renderer<B: GpuBackend> {
    backend: B,
    config: RendererConfig,
    registry: TextureRegistry,
    compiler: ShaderCompiler,
    assembler: BatchAssembler,
    scheduler: DrawScheduler,
    targets: RenderTargetManager,
    clear_color: ColorRgba,
    shader_override: Option<ShaderOverride>,
    in_frame: bool,
}

impl<B: GpuBackend> Renderer<B> {
    pub fn new(mut backend: B, config: RendererConfig) -> RenderResult<Self> {
        config.validate()?;
        backend.set_smooth_sampling(config.antialias);

        let viewport = backend.surface_size();
        let units = backend.max_texture_units().max(1);
        let mut compiler = ShaderCompiler::new(config.batch_texture_count, config.premultiply, config.verbose);
        let program = compiler.set_slot_count(&mut backend, config.batch_texture_count)?;

        let mut registry = TextureRegistry::new(compiler.slot_count(), units, config.premultiply);
        registry.init_base(&mut backend)?;

        let mut scheduler = DrawScheduler::new(viewport);
        scheduler.set_program(program);
        let mut targets = RenderTargetManager::new(viewport);
        targets.update_viewport(&mut backend, viewport);

        log::info!(
            "renderer ready: {}x{}, {} texture slot(s) of {units}",
            viewport.width,
            viewport.height,
            compiler.slot_count()
        );

        let clear_color = if config.transparent {
            ColorRgba::transparent()
        } else {
            ColorRgba::black()
        };

        Ok(Self {
            assembler: BatchAssembler::new(config.max_cards_per_batch),
            backend,
            config,
            registry,
            compiler,
            scheduler,
            targets,
            clear_color,
            shader_override: None,
            in_frame: false,
        })
    }

    // ── accessors ─────────────────────────────────────────────────────────

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn stats(&self) -> &DrawStats {
        self.scheduler.stats()
    }

    pub fn reset_stats(&mut self) {
        self.scheduler.reset_stats();
    }

    #[inline]
    pub fn frame_id(&self) -> u64 {
        self.scheduler.frame_id()
    }

    /// Simultaneous texture slots of the batch program.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.compiler.slot_count()
    }

    /// Live registry entries, source textures and render targets alike.
    pub fn texture_count(&self) -> usize {
        self.registry.len()
    }

    pub fn texture_for(&self, source: &ImageSource) -> Option<TextureId> {
        self.registry.lookup(source.id())
    }

    pub fn texture_slot(&self, texture: TextureId) -> Option<usize> {
        self.registry.get(texture).and_then(|t| t.slot)
    }

    pub fn texture_size(&self, texture: TextureId) -> Option<Viewport> {
        self.registry
            .get(texture)
            .map(|t| Viewport::new(t.width, t.height))
    }

    /// Render targets allocated for `node`.
    pub fn target_count(&self, node: NodeId) -> usize {
        self.targets.allocated(node)
    }

    pub fn viewport(&self) -> Viewport {
        self.targets.viewport()
    }

    pub fn clear_color(&self) -> ColorRgba {
        self.clear_color
    }

    fn batch_ctx(&mut self) -> (BatchCtx<'_, B>, &mut BatchAssembler) {
        (
            BatchCtx::new(&mut self.backend, &mut self.registry, &mut self.scheduler),
            &mut self.assembler,
        )
    }

    fn flush(&mut self, reason: BatchReason) -> RenderResult<()> {
        let (mut ctx, assembler) = self.batch_ctx();
        assembler.flush(&mut ctx, reason)
    }

    /// Program used for surface batches: the override if one is set.
    fn frame_program(&mut self) -> RenderResult<ProgramHandle> {
        let program = match &self.shader_override {
            Some(shader) => self.compiler.override_program(&mut self.backend, shader)?,
            None => self.compiler.regular_program(&mut self.backend)?,
        };
        self.registry.set_slot_count(self.compiler.slot_count());
        Ok(program)
    }

    // ── frames ────────────────────────────────────────────────────────────

    /// Draws `leaves` in order as one frame.
    pub fn draw_frame(&mut self, leaves: &[Leaf]) -> RenderResult<()> {
        self.begin_frame()?;
        if let Err(e) = leaves.iter().try_for_each(|leaf| self.append_leaf(leaf)) {
            self.abort_frame();
            return Err(e);
        }
        self.end_frame()
    }

    pub fn begin_frame(&mut self) -> RenderResult<()> {
        if self.in_frame {
            log::debug!("begin_frame while a frame is open; previous cards are dropped");
        }
        self.backend.begin_frame()?;
        self.scheduler.begin_frame(self.assembler.buffers_mut());

        let program = self.frame_program()?;
        self.scheduler.set_program(program);
        self.backend.bind_framebuffer(None);
        self.backend.set_viewport(self.targets.viewport());
        self.scheduler.set_projection(self.targets.projection());
        if !self.config.preserve_buffer {
            self.backend.clear(self.clear_color)?;
        }
        self.in_frame = true;
        Ok(())
    }

    pub fn append_leaf(&mut self, leaf: &Leaf) -> RenderResult<()> {
        if !self.in_frame {
            return Err(RenderError::config("append_leaf outside begin_frame/end_frame"));
        }
        let (mut ctx, assembler) = self.batch_ctx();
        assembler.append_leaf(&mut ctx, leaf)
    }

    pub fn end_frame(&mut self) -> RenderResult<()> {
        if !self.in_frame {
            return Ok(());
        }
        self.in_frame = false;
        self.flush(BatchReason::DrawFinish)?;
        self.backend.end_frame()?;

        if let Some((interval, modulus)) = self.config.auto_purge_cadence() {
            if self.frame_id() % modulus == 0 {
                self.purge_textures(interval);
            }
        }
        Ok(())
    }

    fn abort_frame(&mut self) {
        self.assembler.buffers_mut().clear();
        self.in_frame = false;
    }

    // ── control surface ───────────────────────────────────────────────────

    /// Resizes the surface viewport. Pending cards are drawn at the old size first.
    pub fn update_viewport(&mut self, width: u32, height: u32) -> RenderResult<()> {
        let viewport = Viewport::new(width, height);
        if !viewport.is_valid() {
            return Err(RenderError::config(format!("viewport {width}x{height} is empty")));
        }
        self.flush(BatchReason::DrawFinish)?;
        self.targets.update_viewport(&mut self.backend, viewport);
        self.scheduler.set_projection(self.targets.projection());
        Ok(())
    }

    pub fn set_clear_color(&mut self, color: ColorRgba) {
        self.clear_color = color.clamped();
    }

    /// `0xRRGGBBAA`.
    pub fn set_clear_color_u32(&mut self, rgba: u32) {
        self.clear_color = ColorRgba::from_u32(rgba);
    }

    /// Accepts `#RGB`, `#RRGGBB`, `#RRGGBBAA` or `rgba(r, g, b, a)`.
    pub fn set_clear_color_str(&mut self, text: &str) -> RenderResult<()> {
        let color = ColorRgba::parse(text)
            .ok_or_else(|| RenderError::config(format!("unrecognized color {text:?}")))?;
        self.clear_color = color;
        Ok(())
    }

    /// Locks (or unlocks) a texture slot so it is never reassigned.
    pub fn protect_texture_slot(&mut self, index: usize, lock: bool) -> RenderResult<()> {
        let units = self.backend.max_texture_units();
        if index >= units {
            return Err(RenderError::config(format!(
                "texture slot {index} is outside 0..{units}"
            )));
        }
        self.registry.protect(index, lock);
        Ok(())
    }

    /// Frees the texture uploaded for `source`. Pending cards are drawn first.
    pub fn release_texture(&mut self, source: &ImageSource) -> RenderResult<bool> {
        self.flush(BatchReason::DrawFinish)?;
        Ok(self.registry.release_source(&mut self.backend, source.id()))
    }

    /// Frees textures not drawn for more than `max_age_frames` frames. Returns how many.
    pub fn purge_textures(&mut self, max_age_frames: u32) -> usize {
        let frame_id = self.scheduler.frame_id();
        self.registry
            .purge(&mut self.backend, u64::from(max_age_frames), frame_id)
    }

    /// Uploads `source` ahead of its first draw.
    pub fn preload_texture(&mut self, source: &ImageSource) -> RenderResult<TextureId> {
        let frame_id = self.scheduler.frame_id();
        self.registry.register(&mut self.backend, source, frame_id)
    }

    /// Makes `alias` draw from the texture already uploaded for `existing`. The
    /// alias's previous texture may be freed, so pending cards are drawn first.
    pub fn share_texture(&mut self, existing: &ImageSource, alias: &ImageSource) -> RenderResult<TextureId> {
        self.flush(BatchReason::DrawFinish)?;
        let frame_id = self.scheduler.frame_id();
        self.registry
            .share(&mut self.backend, existing, alias, frame_id)
    }

    /// Compiled cover program for `filter`.
    pub fn get_filter_shader(&mut self, filter: &dyn Filter) -> RenderResult<ProgramHandle> {
        self.compiler.cover_program(&mut self.backend, Some(filter))
    }

    /// Single-texture batch program.
    pub fn particle_program(&mut self) -> RenderResult<ProgramHandle> {
        self.compiler.particle_program(&mut self.backend)
    }

    /// Requests a new simultaneous texture count. Returns the count in effect, which may
    /// be lower after clamping or compile failures.
    pub fn update_simultaneous_texture_count(&mut self, count: usize) -> RenderResult<usize> {
        self.flush(BatchReason::ProgramChange)?;
        let regular = self.compiler.set_slot_count(&mut self.backend, count)?;
        let program = match &self.shader_override {
            Some(_) => self.frame_program()?,
            None => regular,
        };
        self.registry.set_slot_count(self.compiler.slot_count());
        self.scheduler.set_program(program);
        Ok(self.compiler.slot_count())
    }

    /// Replaces the fragment body of surface batches. `None` restores the default.
    pub fn set_shader_override(&mut self, shader: Option<ShaderOverride>) -> RenderResult<()> {
        self.flush(BatchReason::ProgramChange)?;
        self.shader_override = shader;
        let program = self.frame_program()?;
        self.scheduler.set_program(program);
        Ok(())
    }

    // ── caching ───────────────────────────────────────────────────────────

    /// Renders `leaves` (in node-local space) into a snapshot of the node, running
    /// `filters` over it.
    ///
    /// On failure GPU state is restored, and a node cached for the first time keeps no
    /// targets. Other caches are unaffected.
    pub fn cache_draw(
        &mut self,
        node: NodeId,
        leaves: &[Leaf],
        filters: &[&dyn Filter],
        desc: &CacheDescriptor,
    ) -> RenderResult<CacheOutput> {
        let plan = CachePlan::new(desc, combined_bounds(filters))?;
        self.flush(BatchReason::CachePrep)?;

        let fresh = !self.targets.has_node(node);
        let saved = SavedState {
            framebuffer: self.backend.bound_framebuffer(),
            viewport: self.targets.viewport(),
            projection: self.scheduler.projection(),
            program: self.scheduler.program(),
            slots: self.registry.slots().clone(),
        };

        let result = self.cache_pass(node, leaves, filters, desc, &plan, saved.viewport);

        self.assembler.buffers_mut().clear();
        self.registry.restore_slots(saved.slots);
        self.backend.bind_framebuffer(saved.framebuffer);
        self.targets.update_viewport(&mut self.backend, saved.viewport);
        self.scheduler.set_projection(saved.projection);
        if let Some(program) = saved.program {
            self.scheduler.set_program(program);
        }

        if let Err(e) = &result {
            if fresh {
                self.targets
                    .release(&mut self.backend, &mut self.registry, node);
            }
            log::debug!("cache draw for {node:?} failed: {e}");
        }
        result
    }

    fn cache_pass(
        &mut self,
        node: NodeId,
        leaves: &[Leaf],
        filters: &[&dyn Filter],
        desc: &CacheDescriptor,
        plan: &CachePlan,
        surface: Viewport,
    ) -> RenderResult<CacheOutput> {
        let size = plan.draw_size;
        let gpu_chain = !filters.is_empty() && self.config.gpu_filters;

        let input = self
            .targets
            .get_target(&mut self.backend, &mut self.registry, node, size.width, size.height)?;
        let framebuffer = self
            .registry
            .get(input)
            .and_then(|t| t.framebuffer)
            .ok_or_else(|| RenderError::backend(format!("target {input:?} has no framebuffer")))?;

        let program = self.compiler.regular_program(&mut self.backend)?;
        self.registry.set_slot_count(self.compiler.slot_count());
        self.scheduler.set_program(program);

        self.backend.bind_framebuffer(Some(framebuffer));
        self.targets.update_viewport(&mut self.backend, size);
        // Filter input is drawn inverted; the chain turns it upright.
        self.scheduler.set_projection(if gpu_chain {
            self.targets.projection()
        } else {
            self.targets.flipped_projection()
        });
        self.backend.clear(ColorRgba::transparent())?;

        {
            let (mut ctx, assembler) = self.batch_ctx();
            for leaf in leaves {
                assembler.append_leaf(&mut ctx, &plan.place(leaf))?;
            }
            assembler.flush(&mut ctx, BatchReason::CacheDraw)?;
        }

        let surface_target = desc.self_managed.then_some(surface);
        let texture = if gpu_chain {
            let mut ctx = FilterCtx {
                backend: &mut self.backend,
                registry: &mut self.registry,
                targets: &mut self.targets,
                compiler: &mut self.compiler,
                scheduler: &mut self.scheduler,
            };
            match FilterPipeline::new(node, size).run(&mut ctx, input, filters, surface_target)? {
                ChainOutput::Texture(id) => Some(id),
                ChainOutput::Surface => None,
            }
        } else {
            let handle = self
                .registry
                .get(input)
                .map(|t| t.handle)
                .ok_or_else(|| RenderError::backend(format!("target {input:?} was released")))?;
            if !filters.is_empty() {
                apply_cpu_filters(&mut self.backend, handle, filters, self.config.strict_readback)?;
            }
            match surface_target {
                Some(viewport) => {
                    let blit = self.compiler.cover_program(&mut self.backend, None)?;
                    self.backend.bind_framebuffer(None);
                    self.targets.update_viewport(&mut self.backend, viewport);
                    self.backend.draw_cover(&CoverDraw {
                        program: blit,
                        source: handle,
                        flip_y: false,
                        params: [0.0; FILTER_PARAM_COUNT],
                        filter: None,
                    })?;
                    self.scheduler.record_cover();
                    None
                }
                None => Some(input),
            }
        };

        Ok(CacheOutput {
            texture,
            draw_rect: plan.draw_rect,
            size,
        })
    }

    /// Deletes the render targets of `node`.
    pub fn uncache(&mut self, node: NodeId) -> RenderResult<bool> {
        self.flush(BatchReason::DrawFinish)?;
        Ok(self
            .targets
            .release(&mut self.backend, &mut self.registry, node))
    }

    /// Frees every texture, target and program. The renderer stays usable; resources
    /// are recreated on demand.
    pub fn release_resources(&mut self) {
        self.assembler.buffers_mut().clear();
        self.targets
            .release_all(&mut self.backend, &mut self.registry);
        self.registry.release_all(&mut self.backend);
        self.compiler.release_all(&mut self.backend);
        if let Err(e) = self.registry.init_base(&mut self.backend) {
            log::warn!("could not recreate placeholder texture: {e}");
        }
    }
}

impl<B: GpuBackend> Drop for Renderer<B> {
    fn drop(&mut self) {
        self.targets
            .release_all(&mut self.backend, &mut self.registry);
        self.registry.release_all(&mut self.backend);
        self.compiler.release_all(&mut self.backend);
    }
}
