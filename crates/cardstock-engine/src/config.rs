use crate::error::{RenderError, RenderResult};

/// Cards per batch before a forced flush.
pub const DEFAULT_MAX_CARDS_PER_BATCH: usize = 10_000;

/// Texture slots requested for the batch program before any degradation.
pub const DEFAULT_BATCH_TEXTURE_COUNT: usize = 8;

/// Frames between automatic texture purges.
pub const DEFAULT_AUTO_PURGE_INTERVAL: u32 = 1200;

/// Construction-time renderer options.
///
/// Fixed for the lifetime of a `Renderer`. Use `validate` (called by `Renderer::new`)
/// to reject unusable combinations up front.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Skip clearing the visible surface at the start of a frame.
    pub preserve_buffer: bool,

    /// Sample textures with linear filtering instead of nearest.
    pub antialias: bool,

    /// Default clear color is fully transparent instead of opaque black.
    pub transparent: bool,

    /// Upload premultiplied texel data and unpremultiply in the batch program.
    pub premultiply: bool,

    /// Purge textures unused for this many frames. `None` disables auto purge.
    pub auto_purge_interval_frames: Option<u32>,

    pub max_cards_per_batch: usize,

    /// Requested simultaneous texture slots. Clamped to the device limit and lowered on
    /// compile failure.
    pub batch_texture_count: usize,

    /// Run filter chains on the GPU. When false, filters run on read-back pixels.
    pub gpu_filters: bool,

    /// Treat blocked pixel readback as fatal instead of skipping the filter.
    pub strict_readback: bool,

    /// Log recoverable degradations at warn level.
    pub verbose: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            preserve_buffer: false,
            antialias: false,
            transparent: false,
            premultiply: false,
            auto_purge_interval_frames: Some(DEFAULT_AUTO_PURGE_INTERVAL),
            max_cards_per_batch: DEFAULT_MAX_CARDS_PER_BATCH,
            batch_texture_count: DEFAULT_BATCH_TEXTURE_COUNT,
            gpu_filters: true,
            strict_readback: false,
            verbose: false,
        }
    }
}

impl RendererConfig {
    pub fn validate(&self) -> RenderResult<()> {
        if self.max_cards_per_batch == 0 {
            return Err(RenderError::config("max_cards_per_batch must be at least 1"));
        }
        if self.batch_texture_count == 0 {
            return Err(RenderError::config("batch_texture_count must be at least 1"));
        }
        if self.auto_purge_interval_frames == Some(0) {
            return Err(RenderError::config(
                "auto_purge_interval_frames must be positive; use None to disable",
            ));
        }
        Ok(())
    }

    /// Frame modulus for the periodic purge check.
    pub(crate) fn auto_purge_cadence(&self) -> Option<(u32, u64)> {
        self.auto_purge_interval_frames
            .map(|interval| (interval, u64::from((interval / 2).max(1))))
    }
}
