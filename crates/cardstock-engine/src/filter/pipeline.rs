//! Filter chain execution on render targets or on read-back pixels.

use crate::backend::{CoverDraw, GpuBackend, TextureHandle};
use crate::coords::{ColorRgba, Viewport};
use crate::error::{RenderError, RenderResult};
use crate::scene::NodeId;
use crate::schedule::DrawScheduler;
use crate::shader::ShaderCompiler;
use crate::target::RenderTargetManager;
use crate::texture::{TextureId, TextureRegistry};

use super::{expand_passes, Filter, FILTER_PARAM_COUNT};

/// Renderer state a filter chain touches.
pub(crate) struct FilterCtx<'a, B: GpuBackend> {
    pub backend: &'a mut B,
    pub registry: &'a mut TextureRegistry,
    pub targets: &'a mut RenderTargetManager,
    pub compiler: &'a mut ShaderCompiler,
    pub scheduler: &'a mut DrawScheduler,
}

/// Where the chain's result goes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ChainOutput {
    /// Left in a render target, upright.
    Texture(TextureId),
    /// Drawn onto the visible surface.
    Surface,
}

/// Runs GPU filter chains with ping-pong targets.
///
/// The input target holds content drawn with the regular projection, so its rows are
/// inverted. Each cover pass without `flip_y` inverts them again. `flip_y` toggles
/// between passes when the chain has more than one pass, and a corrective pass fixes
/// whatever orientation is left at the end.
#[derive(Debug, Copy, Clone)]
pub(crate) struct FilterPipeline {
    pub node: NodeId,
    pub size: Viewport,
}

impl FilterPipeline {
    pub fn new(node: NodeId, size: Viewport) -> Self {
        Self { node, size }
    }

    pub fn run<B: GpuBackend>(
        &self,
        ctx: &mut FilterCtx<'_, B>,
        input: TextureId,
        filters: &[&dyn Filter],
        surface: Option<Viewport>,
    ) -> RenderResult<ChainOutput> {
        let passes = expand_passes(filters);
        let toggle = passes.len() > 1;
        let mut flip_y = false;
        let mut upright = false;
        let mut current = input;

        for pass in passes {
            let program = ctx.compiler.cover_program(ctx.backend, Some(pass))?;
            let target = self.next_target(ctx)?;
            self.cover(ctx, target, current, |source| CoverDraw {
                program,
                source,
                flip_y,
                params: pass.params(),
                filter: Some(pass),
            })?;
            if !flip_y {
                upright = !upright;
            }
            current = target;
            if toggle {
                flip_y = !flip_y;
            }
        }

        let blit = ctx.compiler.cover_program(ctx.backend, None)?;
        let plain = |flip_y: bool| {
            move |source| CoverDraw {
                program: blit,
                source,
                flip_y,
                params: [0.0; FILTER_PARAM_COUNT],
                filter: None,
            }
        };

        if let Some(viewport) = surface {
            let source = self.handle(ctx, current)?;
            ctx.backend.bind_framebuffer(None);
            ctx.targets.update_viewport(ctx.backend, viewport);
            // The surface wants inverted rows, like the input target.
            ctx.backend.draw_cover(&plain(!upright)(source))?;
            ctx.scheduler.record_cover();
            return Ok(ChainOutput::Surface);
        }

        if !upright {
            let target = self.next_target(ctx)?;
            self.cover(ctx, target, current, plain(false))?;
            current = target;
        }
        Ok(ChainOutput::Texture(current))
    }

    fn next_target<B: GpuBackend>(&self, ctx: &mut FilterCtx<'_, B>) -> RenderResult<TextureId> {
        ctx.targets.get_target(
            ctx.backend,
            ctx.registry,
            self.node,
            self.size.width,
            self.size.height,
        )
    }

    fn handle<B: GpuBackend>(&self, ctx: &FilterCtx<'_, B>, id: TextureId) -> RenderResult<TextureHandle> {
        ctx.registry
            .get(id)
            .map(|t| t.handle)
            .ok_or_else(|| RenderError::backend(format!("filter source {id:?} was released")))
    }

    /// Clears `target` and draws `source` into it as one cover quad.
    fn cover<'f, B: GpuBackend>(
        &self,
        ctx: &mut FilterCtx<'_, B>,
        target: TextureId,
        source: TextureId,
        draw: impl FnOnce(TextureHandle) -> CoverDraw<'f>,
    ) -> RenderResult<()> {
        let source = self.handle(ctx, source)?;
        let framebuffer = ctx
            .registry
            .get(target)
            .and_then(|t| t.framebuffer)
            .ok_or_else(|| RenderError::backend(format!("target {target:?} has no framebuffer")))?;

        ctx.backend.bind_framebuffer(Some(framebuffer));
        ctx.backend.set_viewport(self.size);
        ctx.backend.clear(ColorRgba::transparent())?;
        ctx.backend.draw_cover(&draw(source))?;
        ctx.scheduler.record_cover();
        Ok(())
    }
}

/// Applies `filters` to the pixels of `texture` on the CPU and uploads the result.
///
/// Restricted pixels skip the chain with a warning unless `strict` is set, in which
/// case the `SecurityRestriction` is returned.
pub(crate) fn apply_cpu_filters<B: GpuBackend>(
    backend: &mut B,
    texture: TextureHandle,
    filters: &[&dyn Filter],
    strict: bool,
) -> RenderResult<()> {
    let mut pixels = match backend.read_pixels(texture) {
        Ok(pixels) => pixels,
        Err(RenderError::SecurityRestriction(reason)) if !strict => {
            log::warn!("skipping cache filters: {reason}");
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    for pass in expand_passes(filters) {
        if !pass.apply_pixels(&mut pixels) {
            log::warn!("filter {} could not run on read-back pixels", pass.shader_key());
        }
    }
    backend.upload_texture(texture, &pixels, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SoftwareBackend;
    use crate::filter::{BlurFilter, ColorFilter};
    use image::{Rgba, RgbaImage};

    struct Harness {
        backend: SoftwareBackend,
        registry: TextureRegistry,
        targets: RenderTargetManager,
        compiler: ShaderCompiler,
        scheduler: DrawScheduler,
    }

    impl Harness {
        fn new() -> Self {
            let viewport = Viewport::new(4, 4);
            Self {
                backend: SoftwareBackend::new(4, 4),
                registry: TextureRegistry::new(2, 16, false),
                targets: RenderTargetManager::new(viewport),
                compiler: ShaderCompiler::new(2, false, false),
                scheduler: DrawScheduler::new(viewport),
            }
        }

        fn ctx(&mut self) -> FilterCtx<'_, SoftwareBackend> {
            FilterCtx {
                backend: &mut self.backend,
                registry: &mut self.registry,
                targets: &mut self.targets,
                compiler: &mut self.compiler,
                scheduler: &mut self.scheduler,
            }
        }

        /// Input target whose storage row 0 is red and the rest blue, i.e. content with
        /// a red bottom row drawn with the regular projection.
        fn input(&mut self, node: NodeId) -> TextureId {
            let id = self
                .targets
                .get_target(&mut self.backend, &mut self.registry, node, 4, 4)
                .unwrap();
            let handle = self.registry.get(id).unwrap().handle;
            let img = RgbaImage::from_fn(4, 4, |_, y| {
                if y == 0 {
                    Rgba([255, 0, 0, 255])
                } else {
                    Rgba([0, 0, 255, 255])
                }
            });
            self.backend.upload_texture(handle, &img, false).unwrap();
            id
        }

        fn storage(&self, id: TextureId) -> RgbaImage {
            let handle = self.registry.get(id).unwrap().handle;
            self.backend.texture_image(handle).unwrap().clone()
        }
    }

    fn is_upright(img: &RgbaImage) -> bool {
        img.get_pixel(0, 3).0 == [255, 0, 0, 255] && img.get_pixel(0, 0).0 == [0, 0, 255, 255]
    }

    fn run(passes: usize) -> (Harness, ChainOutput) {
        let mut h = Harness::new();
        let node = NodeId(1);
        let input = h.input(node);
        let tints: Vec<ColorFilter> = (0..passes).map(|_| ColorFilter::fade(1.0)).collect();
        let filters: Vec<&dyn Filter> = tints.iter().map(|f| f as &dyn Filter).collect();
        let out = FilterPipeline::new(node, Viewport::new(4, 4))
            .run(&mut h.ctx(), input, &filters, None)
            .unwrap();
        (h, out)
    }

    #[test]
    fn every_chain_length_ends_upright() {
        for passes in 1..=5 {
            let (h, out) = run(passes);
            let ChainOutput::Texture(id) = out else {
                panic!("expected a texture");
            };
            assert!(is_upright(&h.storage(id)), "{passes} pass(es) left rows inverted");
            assert_eq!(h.targets.allocated(NodeId(1)), 2);
        }
    }

    #[test]
    fn corrective_pass_only_when_needed() {
        let (h, _) = run(2);
        assert_eq!(h.scheduler.stats().cover_draws, 2);
        let (h, _) = run(3);
        assert_eq!(h.scheduler.stats().cover_draws, 4);
    }

    #[test]
    fn blur_chain_uses_two_targets() {
        let mut h = Harness::new();
        let node = NodeId(9);
        let input = h.input(node);
        let blur = BlurFilter::new(1, 1);
        let out = FilterPipeline::new(node, Viewport::new(4, 4))
            .run(&mut h.ctx(), input, &[&blur], None)
            .unwrap();
        assert!(matches!(out, ChainOutput::Texture(_)));
        assert_eq!(h.targets.allocated(node), 2);
        assert_eq!(h.scheduler.stats().cover_draws, 2);
    }

    #[test]
    fn self_managed_chain_lands_upright_on_surface() {
        let mut h = Harness::new();
        let node = NodeId(2);
        let input = h.input(node);
        let tint = ColorFilter::fade(1.0);
        let out = FilterPipeline::new(node, Viewport::new(4, 4))
            .run(&mut h.ctx(), input, &[&tint], Some(Viewport::new(4, 4)))
            .unwrap();
        assert_eq!(out, ChainOutput::Surface);
        let shown = h.backend.surface_image();
        assert_eq!(shown.get_pixel(0, 3).0, [255, 0, 0, 255]);
        assert_eq!(shown.get_pixel(0, 0).0, [0, 0, 255, 255]);
    }

    // ── CPU fallback ──────────────────────────────────────────────────────

    #[test]
    fn cpu_filters_rewrite_texture() {
        let mut be = SoftwareBackend::new(2, 2);
        let tex = be.create_texture(2, 2).unwrap();
        be.upload_texture(tex, &RgbaImage::from_pixel(2, 2, Rgba([200, 100, 50, 255])), false)
            .unwrap();
        let half = ColorFilter::new([0.5, 0.5, 0.5, 1.0], [0.0; 4]);
        apply_cpu_filters(&mut be, tex, &[&half], false).unwrap();
        assert_eq!(be.texture_image(tex).unwrap().get_pixel(1, 1).0, [100, 50, 25, 255]);
    }

    #[test]
    fn restricted_pixels_skip_or_fail() {
        let mut be = SoftwareBackend::new(2, 2);
        let tex = be.create_texture(1, 1).unwrap();
        be.upload_texture(tex, &RgbaImage::from_pixel(1, 1, Rgba([10, 10, 10, 255])), true)
            .unwrap();
        let half = ColorFilter::new([0.5; 4], [0.0; 4]);

        apply_cpu_filters(&mut be, tex, &[&half], false).unwrap();
        assert_eq!(be.texture_image(tex).unwrap().get_pixel(0, 0).0, [10, 10, 10, 255]);

        let err = apply_cpu_filters(&mut be, tex, &[&half], true).unwrap_err();
        assert!(matches!(err, RenderError::SecurityRestriction(_)));
    }
}
