use crate::coords::{Affine, Rect};
use crate::texture::TextureId;

use super::ImageSource;

/// Identity of a scene node owning a cache. Assigned by the scene collaborator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(pub u64);

/// What a leaf draws. Dispatched once per leaf by the batcher.
#[derive(Debug, Clone)]
pub enum Drawable {
    /// A whole image, or the `source_rect` portion of it, drawn at the local origin.
    Bitmap {
        image: ImageSource,
        source_rect: Option<Rect>,
    },

    /// A sub-rectangle of a shared sheet, offset by its registration point.
    AtlasFrame {
        image: ImageSource,
        rect: Rect,
        reg_x: f32,
        reg_y: f32,
    },

    /// A cached snapshot produced by `Renderer::cache_draw`.
    CachedSubtree { texture: TextureId, draw_rect: Rect },
}

impl Drawable {
    /// CPU-side pixel source, if this drawable has one.
    pub fn source(&self) -> Option<&ImageSource> {
        match self {
            Drawable::Bitmap { image, .. } | Drawable::AtlasFrame { image, .. } => Some(image),
            Drawable::CachedSubtree { .. } => None,
        }
    }
}

/// One visible leaf, flattened by the scene collaborator.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub world: Affine,
    pub alpha: f32,
    pub drawable: Drawable,
}

impl Leaf {
    pub fn bitmap(image: &ImageSource, world: Affine) -> Self {
        Self {
            world,
            alpha: 1.0,
            drawable: Drawable::Bitmap {
                image: image.clone(),
                source_rect: None,
            },
        }
    }

    pub fn atlas_frame(image: &ImageSource, rect: Rect, reg: (f32, f32), world: Affine) -> Self {
        Self {
            world,
            alpha: 1.0,
            drawable: Drawable::AtlasFrame {
                image: image.clone(),
                rect,
                reg_x: reg.0,
                reg_y: reg.1,
            },
        }
    }

    pub fn cached(texture: TextureId, draw_rect: Rect, world: Affine) -> Self {
        Self {
            world,
            alpha: 1.0,
            drawable: Drawable::CachedSubtree { texture, draw_rect },
        }
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_source_rect(mut self, rect: Rect) -> Self {
        if let Drawable::Bitmap { source_rect, .. } = &mut self.drawable {
            *source_rect = Some(rect);
        }
        self
    }
}
