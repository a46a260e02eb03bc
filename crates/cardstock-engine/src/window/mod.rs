//! Window and event loop.
//!
//! Owns the `winit` event loop and windows, and gives each window its own `Gpu`.

mod runtime;

pub use runtime::{Runtime, RuntimeConfig, RuntimeCtx};
