//! Geometry shared by the batcher, render targets and filters.
//!
//! CPU space is pixels with a top-left origin, +X right, +Y down. Projections map
//! it to clip space.

mod affine;
mod color;
mod projection;
mod rect;
mod vec2;
mod viewport;

pub use affine::Affine;
pub use color::ColorRgba;
pub use projection::Projection;
pub use rect::Rect;
pub use vec2::Vec2;
pub use viewport::Viewport;
