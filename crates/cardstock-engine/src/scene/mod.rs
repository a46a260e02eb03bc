//! Input contract from the scene collaborator.
//!
//! The renderer never walks a tree. It receives leaves that already carry their world
//! transform and alpha, plus the pixel source to draw.

mod leaf;
mod source;

pub use leaf::{Drawable, Leaf, NodeId};
pub use source::{ImageSource, SourceId};
