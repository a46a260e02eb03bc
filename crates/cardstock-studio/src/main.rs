//! Cardstock studio: a window full of spinning cards, plus a cached, filtered panel.
//!
//! Pass `--cpu-filters` to run the panel's filter chain on read-back pixels and
//! `--slots N` to request a different simultaneous texture count.

use anyhow::{Context, Result};
use image::{Rgba, RgbaImage};
use winit::dpi::LogicalSize;

use cardstock_engine::cache::CacheOutput;
use cardstock_engine::coords::{Affine, Rect};
use cardstock_engine::core::{App, AppControl, FrameCtx};
use cardstock_engine::device::GpuInit;
use cardstock_engine::filter::{BlurFilter, ColorMatrixFilter, Filter};
use cardstock_engine::logging::{init_logging, LoggingConfig};
use cardstock_engine::window::{Runtime, RuntimeConfig};
use cardstock_engine::{
    CacheDescriptor, ImageSource, Leaf, NodeId, RenderResult, Renderer, RendererConfig,
    WgpuBackend,
};

const PANEL: NodeId = NodeId(1);
const CARD_SIZE: u32 = 48;
const STATS_EVERY: u64 = 600;

struct Options {
    gpu_filters: bool,
    slots: usize,
}

impl Options {
    fn from_args() -> Result<Self> {
        let mut opts = Options {
            gpu_filters: true,
            slots: RendererConfig::default().batch_texture_count,
        };
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--cpu-filters" => opts.gpu_filters = false,
                "--slots" => {
                    let value = args.next().context("--slots needs a value")?;
                    opts.slots = value.parse().context("--slots must be a number")?;
                }
                other => anyhow::bail!("unknown argument {other:?}"),
            }
        }
        Ok(opts)
    }
}

/// Square card with a colored border and a diagonal stripe.
fn card_image(hue: [u8; 3]) -> RgbaImage {
    RgbaImage::from_fn(CARD_SIZE, CARD_SIZE, |x, y| {
        let edge = x < 3 || y < 3 || x >= CARD_SIZE - 3 || y >= CARD_SIZE - 3;
        let stripe = (x + y) % 16 < 4;
        match (edge, stripe) {
            (true, _) => Rgba([240, 240, 240, 255]),
            (false, true) => Rgba([hue[0] / 2, hue[1] / 2, hue[2] / 2, 255]),
            (false, false) => Rgba([hue[0], hue[1], hue[2], 255]),
        }
    })
}

/// 4x1 sheet of solid frames for atlas leaves.
fn pip_sheet() -> RgbaImage {
    const COLORS: [[u8; 4]; 4] = [
        [230, 80, 80, 255],
        [80, 200, 120, 255],
        [90, 140, 240, 255],
        [240, 200, 70, 255],
    ];
    RgbaImage::from_fn(64, 16, |x, y| {
        let dx = (x % 16) as i32 - 8;
        let dy = y as i32 - 8;
        if dx * dx + dy * dy <= 49 {
            Rgba(COLORS[(x / 16) as usize])
        } else {
            Rgba([0, 0, 0, 0])
        }
    })
}

struct Studio {
    options: Options,
    renderer: Option<Renderer<WgpuBackend>>,
    cards: Vec<ImageSource>,
    pips: ImageSource,
    panel: Option<CacheOutput>,
    blur: BlurFilter,
    gray: ColorMatrixFilter,
}

impl Studio {
    fn new(options: Options) -> Self {
        let hues = [
            [200, 60, 60],
            [60, 160, 90],
            [60, 100, 200],
            [210, 170, 40],
            [150, 70, 190],
            [40, 170, 180],
        ];
        Self {
            options,
            renderer: None,
            cards: hues.iter().map(|&h| ImageSource::new(card_image(h))).collect(),
            pips: ImageSource::new(pip_sheet()),
            panel: None,
            blur: BlurFilter::new(6, 6),
            gray: ColorMatrixFilter::grayscale(),
        }
    }

    fn ensure_renderer(&mut self, ctx: &FrameCtx<'_, '_>) -> Option<&mut Renderer<WgpuBackend>> {
        if self.renderer.is_none() {
            let config = RendererConfig {
                antialias: true,
                gpu_filters: self.options.gpu_filters,
                batch_texture_count: self.options.slots,
                ..Default::default()
            };
            let backend = ctx.create_backend();
            match Renderer::new(backend, config) {
                Ok(mut renderer) => {
                    renderer.set_clear_color_u32(0x1a1c22ff);
                    self.renderer = Some(renderer);
                }
                Err(e) => {
                    log::error!("renderer setup failed: {e}");
                    return None;
                }
            }
        }
        self.renderer.as_mut()
    }

    fn card_leaves(&self, frame: u64, width: f32, height: f32) -> Vec<Leaf> {
        let t = frame as f32 / 60.0;
        let half = CARD_SIZE as f32 / 2.0;
        let cols = ((width / 72.0) as usize).max(1);
        let rows = ((height / 72.0) as usize).max(1);

        let mut leaves = Vec::with_capacity(cols * rows + 8);
        for row in 0..rows {
            for col in 0..cols {
                let i = row * cols + col;
                let src = &self.cards[i % self.cards.len()];
                let spin = Affine::translation(-half, -half)
                    .then(Affine::rotation(t + i as f32 * 0.3))
                    .then(Affine::translation(36.0 + col as f32 * 72.0, 36.0 + row as f32 * 72.0));
                let alpha = 0.6 + 0.4 * (t * 2.0 + i as f32).sin().abs();
                leaves.push(Leaf::bitmap(src, spin).with_alpha(alpha));
            }
        }

        for k in 0..8u32 {
            let frame_rect = Rect::new((k % 4) as f32 * 16.0, 0.0, 16.0, 16.0);
            let x = 20.0 + k as f32 * 24.0 + (t * 3.0 + k as f32).sin() * 4.0;
            leaves.push(Leaf::atlas_frame(
                &self.pips,
                frame_rect,
                (8.0, 8.0),
                Affine::translation(x, height - 20.0),
            ));
        }
        leaves
    }

    fn draw(&mut self, renderer: &mut Renderer<WgpuBackend>, frame: u64) -> RenderResult<()> {
        if self.panel.is_none() {
            let content: Vec<Leaf> = self
                .cards
                .iter()
                .enumerate()
                .map(|(i, src)| {
                    let x = (i % 3) as f32 * 52.0;
                    let y = (i / 3) as f32 * 52.0;
                    Leaf::bitmap(src, Affine::translation(x, y))
                })
                .collect();
            let filters: [&dyn Filter; 2] = [&self.gray, &self.blur];
            let panel = renderer.cache_draw(
                PANEL,
                &content,
                &filters,
                &CacheDescriptor::new(0.0, 0.0, 156.0, 104.0),
            )?;
            log::info!(
                "panel cached at {}x{}",
                panel.size.width,
                panel.size.height
            );
            self.panel = Some(panel);
        }

        let viewport = renderer.viewport();
        let (w, h) = (viewport.width as f32, viewport.height as f32);
        let mut leaves = self.card_leaves(frame, w, h);
        if let Some(panel) = &self.panel {
            let bob = (frame as f32 / 45.0).sin() * 6.0;
            let world = Affine::translation(w - 190.0, h - 150.0 + bob);
            leaves.extend(panel.leaf(world));
        }

        renderer.draw_frame(&leaves)?;

        if frame % STATS_EVERY == 0 {
            let stats = renderer.stats();
            log::info!(
                "frame {frame}: {} draw call(s), {} card(s), {} texture overflow(s), {} slot(s)",
                stats.draw_calls,
                stats.cards,
                stats.texture_overflows,
                renderer.slot_count()
            );
            renderer.reset_stats();
        }
        Ok(())
    }
}

impl App for Studio {
    fn on_frame(&mut self, ctx: &mut FrameCtx<'_, '_>) -> AppControl {
        let frame = ctx.frame_index;
        if self.ensure_renderer(ctx).is_none() {
            return AppControl::Exit;
        }
        let Some(mut renderer) = self.renderer.take() else {
            return AppControl::Exit;
        };
        let control = ctx.render(&mut renderer, |r| self.draw(r, frame));
        self.renderer = Some(renderer);
        control
    }
}

fn main() -> Result<()> {
    init_logging(LoggingConfig::default());
    let options = Options::from_args()?;

    let config = RuntimeConfig {
        title: "cardstock studio".to_string(),
        initial_size: LogicalSize::new(960.0, 640.0),
    };
    Runtime::run(config, GpuInit::default(), Studio::new(options))
}
