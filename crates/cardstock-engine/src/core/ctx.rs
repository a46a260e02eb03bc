use winit::window::{Window, WindowId};

use crate::backend::WgpuBackend;
use crate::coords::Viewport;
use crate::device::{Gpu, SurfaceErrorAction};
use crate::error::RenderResult;
use crate::renderer::Renderer;
use crate::window::RuntimeCtx;

use super::app::AppControl;

pub struct WindowCtx<'a> {
    pub id: WindowId,
    pub window: &'a Window,
}

impl WindowCtx<'_> {
    /// Physical size in pixels.
    pub fn size(&self) -> Viewport {
        let size = self.window.inner_size();
        Viewport::new(size.width, size.height)
    }
}

/// Per-frame context passed to `core::App::on_frame`.
///
/// `'a` spans the callback; `'w` is the window borrow held by `Gpu<'w>`.
pub struct FrameCtx<'a, 'w> {
    pub window: WindowCtx<'a>,
    pub gpu: &'a mut Gpu<'w>,
    /// Redraws of this window so far.
    pub frame_index: u64,
    pub runtime: &'a mut RuntimeCtx,
}

impl FrameCtx<'_, '_> {
    /// Backend on this window's device, sized to the current surface.
    pub fn create_backend(&self) -> WgpuBackend {
        let size = self.gpu.size();
        WgpuBackend::new(
            self.gpu.device().clone(),
            self.gpu.queue().clone(),
            Viewport::new(size.width.max(1), size.height.max(1)),
        )
    }

    /// Acquires the swapchain image, lets `draw` render into it through `renderer`,
    /// then presents.
    ///
    /// Render errors are logged and the frame is still presented.
    pub fn render<F>(&mut self, renderer: &mut Renderer<WgpuBackend>, draw: F) -> AppControl
    where
        F: FnOnce(&mut Renderer<WgpuBackend>) -> RenderResult<()>,
    {
        let frame = match self.gpu.begin_frame() {
            Ok(f) => f,
            Err(err) => {
                return match self.gpu.handle_surface_error(err) {
                    SurfaceErrorAction::Fatal => AppControl::Exit,
                    _ => AppControl::Continue,
                };
            }
        };

        let size = self.gpu.size();
        renderer.backend_mut().attach_surface(
            frame.view.clone(),
            size.width,
            size.height,
            self.gpu.surface_format(),
        );

        let result = (|| {
            if renderer.viewport() != Viewport::new(size.width, size.height) {
                renderer.update_viewport(size.width, size.height)?;
            }
            draw(renderer)
        })();

        renderer.backend_mut().detach_surface();
        if let Err(e) = result {
            log::error!("frame {} failed: {e}", self.frame_index);
        }

        self.window.window.pre_present_notify();
        frame.present();
        AppControl::Continue
    }
}
