//! Cardstock engine crate.
//!
//! A batched 2D card renderer: textured quads are packed into as few draw calls as the
//! device's texture units allow. Subtrees can be cached into render targets and run
//! through filter chains. `Renderer` is generic over `backend::GpuBackend`;
//! `WgpuBackend` drives a real device and `SoftwareBackend` rasterizes on the CPU.

pub mod backend;
pub mod batch;
pub mod cache;
pub mod config;
pub mod coords;
pub mod core;
pub mod device;
pub mod error;
pub mod filter;
pub mod logging;
pub mod renderer;
pub mod scene;
pub mod schedule;
pub mod shader;
pub mod target;
pub mod texture;
pub mod window;

pub use backend::{GpuBackend, SoftwareBackend, WgpuBackend};
pub use cache::{CacheDescriptor, CacheOutput};
pub use config::RendererConfig;
pub use error::{RenderError, RenderResult};
pub use renderer::Renderer;
pub use scene::{ImageSource, Leaf, NodeId};
