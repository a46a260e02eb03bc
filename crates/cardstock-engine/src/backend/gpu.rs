use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use wgpu::util::DeviceExt;

use crate::coords::{ColorRgba, Viewport};
use crate::error::{RenderError, RenderResult};
use crate::filter::FILTER_PARAM_COUNT;
use crate::shader::ProgramKind;

use super::{
    BatchDraw, CoverDraw, FramebufferHandle, GpuBackend, ProgramHandle, ProgramSource, TaintSet,
    TextureHandle,
};

/// Format of every texture the renderer allocates.
const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

const COVER_VERT: [f32; 12] = [
    -1.0, 1.0, 1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0, -1.0, -1.0, -1.0,
];
const COVER_UV: [f32; 12] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0];
const COVER_UV_FLIP: [f32; 12] = [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0];

// ── uniforms ──────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct BatchGlobals {
    projection: [[f32; 4]; 4],
    orientation: [f32; 4],
    /// Bit `i` set: slot `i` holds premultiplied texels.
    premultiplied: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
struct CoverUniforms {
    texel: [f32; 2],
    y_sign: f32,
    _pad: f32,
    params: [f32; FILTER_PARAM_COUNT],
}

// ── resources ─────────────────────────────────────────────────────────────

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

struct GpuProgram {
    kind: ProgramKind,
    slot_count: usize,
    module: wgpu::ShaderModule,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl GpuProgram {
    fn is_cover(&self) -> bool {
        self.kind == ProgramKind::Cover
    }
}

/// Externally owned view the "no framebuffer" binding draws into.
struct SurfaceTarget {
    view: wgpu::TextureView,
    size: Viewport,
    format: wgpu::TextureFormat,
}

/// Resolved destination of one draw.
struct DrawTarget {
    view: wgpu::TextureView,
    size: Viewport,
    format: wgpu::TextureFormat,
    /// Offscreen targets flip clip-space y so storage row 0 sits at clip `y = -1`.
    y_sign: f32,
    texture: Option<TextureHandle>,
}

/// Per-vertex attribute streams, grown on demand.
#[derive(Default)]
struct VertexStreams {
    positions: Option<wgpu::Buffer>,
    uvs: Option<wgpu::Buffer>,
    indices: Option<wgpu::Buffer>,
    alphas: Option<wgpu::Buffer>,
    capacity: usize,
}

/// `GpuBackend` on wgpu.
///
/// Each draw records and submits its own command buffer, so calls take effect in
/// order. Programs keep one pipeline per target format. Without an attached surface,
/// a private texture stands in for it (headless use).
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    max_texture_units: usize,
    max_texture_size: u32,

    textures: HashMap<TextureHandle, GpuTexture>,
    framebuffers: HashMap<FramebufferHandle, TextureHandle>,
    programs: HashMap<ProgramHandle, GpuProgram>,
    next_id: u64,

    surface: Option<SurfaceTarget>,
    fallback_surface: GpuTexture,
    /// Bound in place of a slot texture that is also the draw target.
    blank: GpuTexture,
    bound: Option<FramebufferHandle>,
    viewport: Viewport,

    card_sampler: wgpu::Sampler,
    cover_sampler: wgpu::Sampler,
    batch_ubo: wgpu::Buffer,
    cover_ubo: wgpu::Buffer,
    cover_positions: wgpu::Buffer,
    cover_uvs: wgpu::Buffer,
    cover_uvs_flipped: wgpu::Buffer,
    streams: VertexStreams,

    taint: TaintSet,
}

impl WgpuBackend {
    /// Wraps an existing device. Cards sample nearest until `set_smooth_sampling`.
    pub fn new(device: wgpu::Device, queue: wgpu::Queue, surface_size: Viewport) -> Self {
        let limits = device.limits();
        let card_sampler = create_card_sampler(&device, false);
        let cover_sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("cardstock cover sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Nearest,
            min_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform = |label, size: usize| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: size as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        };
        let batch_ubo = uniform("cardstock batch ubo", std::mem::size_of::<BatchGlobals>());
        let cover_ubo = uniform("cardstock cover ubo", std::mem::size_of::<CoverUniforms>());

        let vertex = |label, data: &[f32]| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::VERTEX,
            })
        };
        let cover_positions = vertex("cardstock cover positions", &COVER_VERT);
        let cover_uvs = vertex("cardstock cover uvs", &COVER_UV);
        let cover_uvs_flipped = vertex("cardstock cover uvs flipped", &COVER_UV_FLIP);

        let fallback_surface = create_gpu_texture(&device, surface_size.width, surface_size.height);
        let blank = create_gpu_texture(&device, 1, 1);

        Self {
            max_texture_units: limits.max_sampled_textures_per_shader_stage.max(1) as usize,
            max_texture_size: limits.max_texture_dimension_2d,
            device,
            queue,
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            programs: HashMap::new(),
            next_id: 1,
            surface: None,
            fallback_surface,
            blank,
            bound: None,
            viewport: surface_size,
            card_sampler,
            cover_sampler,
            batch_ubo,
            cover_ubo,
            cover_positions,
            cover_uvs,
            cover_uvs_flipped,
            streams: VertexStreams::default(),
            taint: TaintSet::default(),
        }
    }

    /// Device without a window; the surface is a private texture.
    pub fn headless(width: u32, height: u32) -> anyhow::Result<Self> {
        let instance = crate::device::instance();
        let (_adapter, device, queue) = pollster::block_on(crate::device::request_device(
            &instance,
            &crate::device::GpuInit::default(),
            None,
        ))?;
        Ok(Self::new(device, queue, Viewport::new(width, height)))
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Routes surface draws into `view` until `detach_surface`.
    pub fn attach_surface(
        &mut self,
        view: wgpu::TextureView,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) {
        self.surface = Some(SurfaceTarget {
            view,
            size: Viewport::new(width.max(1), height.max(1)),
            format,
        });
    }

    pub fn detach_surface(&mut self) {
        self.surface = None;
    }

    /// Resizes the private surface used while no surface is attached.
    pub fn resize_fallback_surface(&mut self, width: u32, height: u32) {
        self.fallback_surface = create_gpu_texture(&self.device, width, height);
    }

    /// Reads back the private surface in display order.
    pub fn read_fallback_surface(&mut self) -> RenderResult<RgbaImage> {
        let (width, height) = (self.fallback_surface.width, self.fallback_surface.height);
        read_texture(&self.device, &self.queue, &self.fallback_surface.texture, width, height)
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_size(&self, width: u32, height: u32) -> RenderResult<()> {
        if width == 0 || height == 0 || width > self.max_texture_size || height > self.max_texture_size {
            return Err(RenderError::exhausted(format!(
                "texture {width}x{height} outside 1..={}",
                self.max_texture_size
            )));
        }
        Ok(())
    }

    /// Runs `f` inside a validation error scope.
    fn validated<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        let scope = self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = f(&self.device);
        let err = pollster::block_on(scope.pop());
        (out, err)
    }

    fn target(&self) -> RenderResult<DrawTarget> {
        match self.bound {
            Some(fb) => {
                let handle = *self
                    .framebuffers
                    .get(&fb)
                    .ok_or_else(|| RenderError::backend(format!("unknown framebuffer {fb:?}")))?;
                let tex = self
                    .textures
                    .get(&handle)
                    .ok_or_else(|| RenderError::backend(format!("framebuffer {fb:?} lost its texture")))?;
                Ok(DrawTarget {
                    view: tex.view.clone(),
                    size: Viewport::new(tex.width, tex.height),
                    format: OFFSCREEN_FORMAT,
                    y_sign: -1.0,
                    texture: Some(handle),
                })
            }
            None => Ok(match &self.surface {
                Some(surface) => DrawTarget {
                    view: surface.view.clone(),
                    size: surface.size,
                    format: surface.format,
                    y_sign: 1.0,
                    texture: None,
                },
                None => DrawTarget {
                    view: self.fallback_surface.view.clone(),
                    size: Viewport::new(self.fallback_surface.width, self.fallback_surface.height),
                    format: OFFSCREEN_FORMAT,
                    y_sign: 1.0,
                    texture: None,
                },
            }),
        }
    }

    fn pipeline(&mut self, program: ProgramHandle, format: wgpu::TextureFormat) -> RenderResult<wgpu::RenderPipeline> {
        let device = &self.device;
        let prog = self
            .programs
            .get_mut(&program)
            .ok_or_else(|| RenderError::backend(format!("unknown program {program:?}")))?;
        if let Some(pipeline) = prog.pipelines.get(&format) {
            return Ok(pipeline.clone());
        }
        let pipeline = build_pipeline(device, prog, format);
        prog.pipelines.insert(format, pipeline.clone());
        Ok(pipeline)
    }

    fn texture_view(&self, handle: TextureHandle) -> RenderResult<&GpuTexture> {
        self.textures
            .get(&handle)
            .ok_or_else(|| RenderError::backend(format!("unknown texture {handle:?}")))
    }

    fn ensure_stream_capacity(&mut self, vertices: usize) {
        if vertices <= self.streams.capacity && self.streams.positions.is_some() {
            return;
        }
        let cap = vertices.next_power_of_two().max(6 * 64);
        let buffer = |label, floats_per_vertex: usize| {
            Some(self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(label),
                size: (cap * floats_per_vertex * std::mem::size_of::<f32>()) as u64,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }))
        };
        self.streams = VertexStreams {
            positions: buffer("cardstock positions", 2),
            uvs: buffer("cardstock uvs", 2),
            indices: buffer("cardstock indices", 1),
            alphas: buffer("cardstock alphas", 1),
            capacity: cap,
        };
    }

    /// Encodes one render pass into `target` and submits it.
    fn submit_pass(
        &self,
        target: &DrawTarget,
        load: wgpu::LoadOp<wgpu::Color>,
        record: impl FnOnce(&mut wgpu::RenderPass<'_>),
    ) {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("cardstock draw encoder"),
            });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("cardstock pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                    depth_slice: None,
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
                multiview_mask: None,
            });

            let w = self.viewport.width.min(target.size.width).max(1);
            let h = self.viewport.height.min(target.size.height).max(1);
            // Viewports anchor at storage row 0: the top for offscreen targets, the
            // bottom on the surface.
            let y = if target.y_sign < 0.0 { 0 } else { target.size.height - h };
            rpass.set_viewport(0.0, y as f32, w as f32, h as f32, 0.0, 1.0);
            record(&mut rpass);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl GpuBackend for WgpuBackend {
    fn max_texture_units(&self) -> usize {
        self.max_texture_units
    }

    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn surface_size(&self) -> Viewport {
        match &self.surface {
            Some(surface) => surface.size,
            None => Viewport::new(self.fallback_surface.width, self.fallback_surface.height),
        }
    }

    fn end_frame(&mut self) -> RenderResult<()> {
        self.device
            .poll(wgpu::PollType::Poll)
            .map_err(|e| RenderError::backend(format!("wgpu poll failed: {e:?}")))?;
        Ok(())
    }

    fn create_texture(&mut self, width: u32, height: u32) -> RenderResult<TextureHandle> {
        self.check_size(width, height)?;
        let (texture, err) = self.validated(|device| create_gpu_texture(device, width, height));
        if let Some(err) = err {
            return Err(RenderError::exhausted(err.to_string()));
        }
        let handle = TextureHandle(self.next_handle());
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn resize_texture(&mut self, texture: TextureHandle, width: u32, height: u32) -> RenderResult<()> {
        self.check_size(width, height)?;
        if !self.textures.contains_key(&texture) {
            return Err(RenderError::backend(format!("unknown texture {texture:?}")));
        }
        let (replacement, err) = self.validated(|device| create_gpu_texture(device, width, height));
        if let Some(err) = err {
            return Err(RenderError::exhausted(err.to_string()));
        }
        if let Some(old) = self.textures.insert(texture, replacement) {
            old.texture.destroy();
        }
        Ok(())
    }

    fn upload_texture(
        &mut self,
        texture: TextureHandle,
        image: &RgbaImage,
        restricted: bool,
    ) -> RenderResult<()> {
        let (width, height) = image.dimensions();
        let current = self.texture_view(texture)?;
        if (current.width, current.height) != (width, height) {
            self.resize_texture(texture, width, height)?;
        }

        let tex = self.texture_view(texture)?;
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &tex.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            image.as_raw(),
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.taint.set(texture, restricted);
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureHandle) {
        if let Some(tex) = self.textures.remove(&texture) {
            tex.texture.destroy();
        }
        self.taint.forget(texture);
    }

    fn create_framebuffer(&mut self, texture: TextureHandle) -> RenderResult<FramebufferHandle> {
        self.texture_view(texture)?;
        let handle = FramebufferHandle(self.next_handle());
        self.framebuffers.insert(handle, texture);
        Ok(handle)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer);
        if self.bound == Some(framebuffer) {
            self.bound = None;
        }
    }

    fn bind_framebuffer(&mut self, framebuffer: Option<FramebufferHandle>) {
        self.bound = framebuffer;
    }

    fn bound_framebuffer(&self) -> Option<FramebufferHandle> {
        self.bound
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn set_smooth_sampling(&mut self, smooth: bool) {
        self.card_sampler = create_card_sampler(&self.device, smooth);
    }

    fn clear(&mut self, color: ColorRgba) -> RenderResult<()> {
        let target = self.target()?;
        let clear = wgpu::Color {
            r: f64::from(color.r),
            g: f64::from(color.g),
            b: f64::from(color.b),
            a: f64::from(color.a),
        };
        self.submit_pass(&target, wgpu::LoadOp::Clear(clear), |_| {});
        if let Some(tex) = target.texture {
            self.taint.forget(tex);
        }
        Ok(())
    }

    fn compile_program(&mut self, source: &ProgramSource) -> RenderResult<ProgramHandle> {
        let cover = source.kind == ProgramKind::Cover;
        if !cover && source.slot_count > self.max_texture_units {
            return Err(RenderError::shader(
                source.slot_count,
                format!("{} texture slots exceed the device limit", source.slot_count),
            ));
        }

        let (program, err) = self.validated(|device| {
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&source.label),
                source: wgpu::ShaderSource::Wgsl(source.wgsl.as_str().into()),
            });
            let bind_group_layout = create_bind_group_layout(device, &source.label, cover, source.slot_count);
            let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(&source.label),
                bind_group_layouts: &[&bind_group_layout],
                immediate_size: 0,
            });
            let mut program = GpuProgram {
                kind: source.kind,
                slot_count: if cover { 1 } else { source.slot_count },
                module,
                bind_group_layout,
                pipeline_layout,
                pipelines: HashMap::new(),
            };
            let pipeline = build_pipeline(device, &program, OFFSCREEN_FORMAT);
            program.pipelines.insert(OFFSCREEN_FORMAT, pipeline);
            program
        });

        if let Some(err) = err {
            return Err(RenderError::shader(source.slot_count, err.to_string()));
        }
        let handle = ProgramHandle(self.next_handle());
        self.programs.insert(handle, program);
        Ok(handle)
    }

    fn delete_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program);
    }

    fn draw_batch(&mut self, draw: &BatchDraw<'_>) -> RenderResult<()> {
        let vertices = draw.card_count * 6;
        if vertices == 0 {
            return Ok(());
        }
        let target = self.target()?;
        let pipeline = self.pipeline(draw.program, target.format)?;
        let (slot_count, layout) = {
            let prog = &self.programs[&draw.program];
            if prog.is_cover() {
                return Err(RenderError::backend("cover program used for a card batch"));
            }
            (prog.slot_count, prog.bind_group_layout.clone())
        };

        self.ensure_stream_capacity(vertices);
        let streams = [
            (&self.streams.positions, &draw.vertices[..vertices * 2]),
            (&self.streams.uvs, &draw.uvs[..vertices * 2]),
            (&self.streams.indices, &draw.indices[..vertices]),
            (&self.streams.alphas, &draw.alphas[..vertices]),
        ];
        for (buffer, data) in streams {
            if let Some(buffer) = buffer {
                self.queue.write_buffer(buffer, 0, bytemuck::cast_slice(data));
            }
        }

        let globals = BatchGlobals {
            projection: draw.projection.columns(),
            orientation: [target.y_sign, 0.0, 0.0, 0.0],
            premultiplied: slot_mask(draw.premultiplied),
        };
        self.queue.write_buffer(&self.batch_ubo, 0, bytemuck::bytes_of(&globals));

        let mut views = Vec::with_capacity(slot_count);
        for i in 0..slot_count {
            let handle = draw
                .textures
                .get(i)
                .or_else(|| draw.textures.first())
                .ok_or_else(|| RenderError::backend("batch without textures"))?;
            if Some(*handle) == target.texture {
                views.push(self.blank.view.clone());
            } else {
                views.push(self.texture_view(*handle)?.view.clone());
            }
        }
        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: self.batch_ubo.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Sampler(&self.card_sampler),
            },
        ];
        entries.extend(views.iter().enumerate().map(|(i, view)| wgpu::BindGroupEntry {
            binding: 2 + i as u32,
            resource: wgpu::BindingResource::TextureView(view),
        }));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("cardstock batch bind group"),
            layout: &layout,
            entries: &entries,
        });

        let streams = &self.streams;
        self.submit_pass(&target, wgpu::LoadOp::Load, |rpass| {
            rpass.set_pipeline(&pipeline);
            rpass.set_bind_group(0, &bind_group, &[]);
            for (slot, buffer) in [&streams.positions, &streams.uvs, &streams.indices, &streams.alphas]
                .into_iter()
                .enumerate()
            {
                if let Some(buffer) = buffer {
                    rpass.set_vertex_buffer(slot as u32, buffer.slice(..));
                }
            }
            rpass.draw(0..vertices as u32, 0..1);
        });

        self.taint.propagate(draw.textures, target.texture);
        Ok(())
    }

    fn draw_cover(&mut self, draw: &CoverDraw<'_>) -> RenderResult<()> {
        let target = self.target()?;
        let pipeline = self.pipeline(draw.program, target.format)?;
        let layout = self.programs[&draw.program].bind_group_layout.clone();

        let source = self.texture_view(draw.source)?;
        let uniforms = CoverUniforms {
            texel: [1.0 / source.width.max(1) as f32, 1.0 / source.height.max(1) as f32],
            y_sign: target.y_sign,
            _pad: 0.0,
            params: draw.params,
        };
        self.queue.write_buffer(&self.cover_ubo, 0, bytemuck::bytes_of(&uniforms));

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("cardstock cover bind group"),
            layout: &layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.cover_ubo.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.cover_sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(&source.view),
                },
            ],
        });

        let uvs = if draw.flip_y {
            &self.cover_uvs_flipped
        } else {
            &self.cover_uvs
        };
        self.submit_pass(&target, wgpu::LoadOp::Load, |rpass| {
            rpass.set_pipeline(&pipeline);
            rpass.set_bind_group(0, &bind_group, &[]);
            rpass.set_vertex_buffer(0, self.cover_positions.slice(..));
            rpass.set_vertex_buffer(1, uvs.slice(..));
            rpass.draw(0..6, 0..1);
        });

        self.taint.propagate(&[draw.source], target.texture);
        Ok(())
    }

    fn read_pixels(&mut self, texture: TextureHandle) -> RenderResult<RgbaImage> {
        if self.taint.contains(texture) {
            return Err(RenderError::restricted(format!(
                "texture {texture:?} holds restricted pixels"
            )));
        }
        let tex = self.texture_view(texture)?;
        read_texture(&self.device, &self.queue, &tex.texture, tex.width, tex.height)
    }
}

// ── helpers ───────────────────────────────────────────────────────────────

fn create_gpu_texture(device: &wgpu::Device, width: u32, height: u32) -> GpuTexture {
    let (width, height) = (width.max(1), height.max(1));
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("cardstock texture"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: OFFSCREEN_FORMAT,
        usage: wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_DST
            | wgpu::TextureUsages::COPY_SRC
            | wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    GpuTexture {
        texture,
        view,
        width,
        height,
    }
}

fn create_card_sampler(device: &wgpu::Device, smooth: bool) -> wgpu::Sampler {
    let filter = if smooth {
        wgpu::FilterMode::Linear
    } else {
        wgpu::FilterMode::Nearest
    };
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("cardstock card sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: filter,
        min_filter: filter,
        ..Default::default()
    })
}

fn create_bind_group_layout(
    device: &wgpu::Device,
    label: &str,
    cover: bool,
    slot_count: usize,
) -> wgpu::BindGroupLayout {
    let textures = if cover { 1 } else { slot_count.max(1) };
    let mut entries = vec![
        wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        },
        wgpu::BindGroupLayoutEntry {
            binding: 1,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
            count: None,
        },
    ];
    entries.extend((0..textures).map(|i| wgpu::BindGroupLayoutEntry {
        binding: 2 + i as u32,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        count: None,
    }));
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &entries,
    })
}

fn build_pipeline(
    device: &wgpu::Device,
    program: &GpuProgram,
    format: wgpu::TextureFormat,
) -> wgpu::RenderPipeline {
    const POSITION: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x2];
    const UV: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Float32x2];
    const INDEX: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![2 => Float32];
    const ALPHA: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![3 => Float32];

    let stream = |floats: usize, attributes: &'static [wgpu::VertexAttribute]| wgpu::VertexBufferLayout {
        array_stride: (floats * std::mem::size_of::<f32>()) as u64,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes,
    };
    let card_layout = [stream(2, &POSITION), stream(2, &UV), stream(1, &INDEX), stream(1, &ALPHA)];
    let cover_layout = [stream(2, &POSITION), stream(2, &UV)];
    let (buffers, blend): (&[wgpu::VertexBufferLayout], _) = if program.is_cover() {
        (&cover_layout, None)
    } else {
        (&card_layout, Some(straight_alpha_blend()))
    };

    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some("cardstock pipeline"),
        layout: Some(&program.pipeline_layout),
        vertex: wgpu::VertexState {
            module: &program.module,
            entry_point: Some("vs_main"),
            compilation_options: Default::default(),
            buffers,
        },
        fragment: Some(wgpu::FragmentState {
            module: &program.module,
            entry_point: Some("fs_main"),
            compilation_options: Default::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            polygon_mode: wgpu::PolygonMode::Fill,
            unclipped_depth: false,
            conservative: false,
        },
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview_mask: None,
        cache: None,
    })
}

/// Source-over for straight-alpha color, with the alpha channel accumulated.
fn straight_alpha_blend() -> wgpu::BlendState {
    wgpu::BlendState {
        color: wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::SrcAlpha,
            dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
            operation: wgpu::BlendOperation::Add,
        },
        alpha: wgpu::BlendComponent {
            src_factor: wgpu::BlendFactor::One,
            dst_factor: wgpu::BlendFactor::OneMinusSrcAlpha,
            operation: wgpu::BlendOperation::Add,
        },
    }
}

fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    width: u32,
    height: u32,
) -> RenderResult<RgbaImage> {
    let row_bytes = width * 4;
    let padded_row_bytes = align_to(row_bytes, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    let readback = device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("cardstock readback"),
        size: u64::from(padded_row_bytes) * u64::from(height),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("cardstock readback encoder"),
    });
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer: &readback,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_row_bytes),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(Some(encoder.finish()));

    let slice = readback.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device
        .poll(wgpu::PollType::wait_indefinitely())
        .map_err(|e| RenderError::backend(format!("wgpu poll failed: {e:?}")))?;
    rx.recv()
        .map_err(|_| RenderError::backend("readback channel closed"))?
        .map_err(|e| RenderError::backend(format!("readback map failed: {e:?}")))?;

    let mapped = slice.get_mapped_range();
    let mut pixels = Vec::with_capacity((row_bytes * height) as usize);
    for row in 0..height as usize {
        let start = row * padded_row_bytes as usize;
        pixels.extend_from_slice(&mapped[start..start + row_bytes as usize]);
    }
    drop(mapped);
    readback.unmap();

    RgbaImage::from_raw(width, height, pixels)
        .ok_or_else(|| RenderError::backend("readback size mismatch"))
}

/// Packs per-slot flags into the `vec4<u32>` bit set read by the batch shader.
fn slot_mask(flags: &[bool]) -> [u32; 4] {
    let mut mask = [0u32; 4];
    for (i, &set) in flags.iter().enumerate().take(128) {
        if set {
            mask[i / 32] |= 1 << (i % 32);
        }
    }
    mask
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_layouts_match_wgsl() {
        assert_eq!(std::mem::size_of::<BatchGlobals>(), 96);
        assert_eq!(std::mem::size_of::<CoverUniforms>(), 96);
    }

    #[test]
    fn readback_rows_align_to_256() {
        assert_eq!(align_to(4, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT), 256);
        assert_eq!(align_to(256, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT), 256);
        assert_eq!(align_to(840, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT), 1024);
    }

    #[test]
    fn slot_mask_spans_words() {
        let mut flags = vec![false; 40];
        flags[0] = true;
        flags[33] = true;
        assert_eq!(slot_mask(&flags), [1, 2, 0, 0]);
        assert_eq!(slot_mask(&[false; 8]), [0; 4]);
    }

    #[test]
    fn cover_uv_sets_mirror_vertically() {
        for i in 0..6 {
            assert_eq!(COVER_UV[i * 2], COVER_UV_FLIP[i * 2]);
            assert_eq!(COVER_UV[i * 2 + 1], 1.0 - COVER_UV_FLIP[i * 2 + 1]);
        }
    }
}
