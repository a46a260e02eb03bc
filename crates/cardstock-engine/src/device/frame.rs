/// Swapchain image acquired for one frame.
///
/// Holding it blocks acquisition of the next one; call `present` once the renderer
/// has finished drawing into `view`.
pub struct GpuFrame {
    pub surface_texture: wgpu::SurfaceTexture,
    pub view: wgpu::TextureView,
}

impl GpuFrame {
    pub fn present(self) {
        drop(self.view);
        self.surface_texture.present();
    }
}
