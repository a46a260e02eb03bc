//! wgpu device and surface management.
//!
//! `Gpu` owns a window surface for the studio binary. `request_device` is shared with
//! `WgpuBackend::headless`, which renders without any window.

mod adapter;
mod context;
mod error;
mod frame;
mod init;
mod surface;

pub(crate) use adapter::instance;
pub use adapter::request_device;
pub use context::Gpu;
pub use error::SurfaceErrorAction;
pub use frame::GpuFrame;
pub use init::GpuInit;
