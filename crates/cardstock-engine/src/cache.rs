//! Cache descriptors and the geometry of a cache pass.

use crate::coords::{Affine, Rect, Viewport};
use crate::error::{RenderError, RenderResult};
use crate::scene::Leaf;
use crate::texture::TextureId;

/// Region of a node to snapshot, in the node's local space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheDescriptor {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Pixels per local unit in the cache texture.
    pub scale: f32,
    /// Draw the result onto this renderer's surface instead of keeping a texture.
    pub self_managed: bool,
}

impl CacheDescriptor {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale: 1.0,
            self_managed: false,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn self_managed(mut self) -> Self {
        self.self_managed = true;
        self
    }

    pub fn validate(&self) -> RenderResult<()> {
        let finite = [self.x, self.y, self.width, self.height, self.scale]
            .iter()
            .all(|v| v.is_finite());
        if !finite {
            return Err(RenderError::config("cache descriptor has non-finite values"));
        }
        if self.width <= 0.0 || self.height <= 0.0 {
            return Err(RenderError::config(format!(
                "cache size {}x{} must be positive",
                self.width, self.height
            )));
        }
        if self.scale <= 0.0 {
            return Err(RenderError::config(format!(
                "cache scale {} must be positive",
                self.scale
            )));
        }
        Ok(())
    }
}

/// Resolved sizes and transforms of one cache pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct CachePlan {
    /// Render target size including filter bleed.
    pub draw_size: Viewport,
    /// Maps node-local leaves into target pixels.
    pub leaf_transform: Affine,
    /// Where the cache texture lands in node-local space.
    pub draw_rect: Rect,
}

impl CachePlan {
    pub fn new(desc: &CacheDescriptor, bleed: Option<Rect>) -> RenderResult<Self> {
        desc.validate()?;
        let bleed = bleed.unwrap_or_default();
        let scale = desc.scale;

        let width = (desc.width * scale).ceil() + bleed.size.x.ceil();
        let height = (desc.height * scale).ceil() + bleed.size.y.ceil();
        if width > u32::MAX as f32 || height > u32::MAX as f32 {
            return Err(RenderError::exhausted(format!(
                "cache target {width}x{height} is too large"
            )));
        }

        let off_x = desc.x * scale + bleed.origin.x;
        let off_y = desc.y * scale + bleed.origin.y;

        Ok(Self {
            draw_size: Viewport::new(width as u32, height as u32),
            leaf_transform: Affine::new(scale, 0.0, 0.0, scale, -off_x, -off_y),
            draw_rect: Rect::new(off_x / scale, off_y / scale, width / scale, height / scale),
        })
    }

    /// `leaf` moved into target pixel space.
    pub fn place(&self, leaf: &Leaf) -> Leaf {
        Leaf {
            world: leaf.world.then(self.leaf_transform),
            alpha: leaf.alpha,
            drawable: leaf.drawable.clone(),
        }
    }
}

/// Result of `Renderer::cache_draw`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheOutput {
    /// Upright snapshot, or `None` when the pass drew to the surface.
    pub texture: Option<TextureId>,
    /// Node-local rectangle the texture covers.
    pub draw_rect: Rect,
    /// Target size in pixels.
    pub size: Viewport,
}

impl CacheOutput {
    /// Leaf drawing the snapshot with the node's world transform.
    pub fn leaf(&self, world: Affine) -> Option<Leaf> {
        self.texture
            .map(|texture| Leaf::cached(texture, self.draw_rect, world))
    }
}
