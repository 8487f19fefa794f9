//! `RenderBackend` implementation over wgpu 23.
//!
//! Program linking compiles each stage's WGSL with a validation error scope
//! — compile and pipeline errors come back as `BackendError::Link` instead
//! of panics — and builds two pipeline variants per program: depth-tested
//! and depth-disabled (the skybox pass).  Reflection runs the same WGSL
//! front end wgpu embeds (`naga`) to recover the name → binding map.
//!
//! Frame recording keeps at most one render pass open at a time; a `clear`
//! request ends the current pass and becomes the load ops of the next one,
//! so color/depth clears cost nothing extra.
//!
//! The material group binds one texture + sampler pair (the lowest occupied
//! unit of the draw); unset slots fall back to a neutral 1×1 white texture
//! of the program's mode.

use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;
use winit::window::Window;

use kiln_core::Color;
use kiln_engine::backend::{
    BackendError, BackendLimits, BufferId, ClearMode, DefaultProgram, DepthMode, DrawCall,
    GlobalUniforms, LinkedProgram, ProgramId, ProgramMode, ProgramSources, RenderBackend,
    TextureId, VertexStream,
};

use crate::context::GpuContext;

/// Entry-point names every stage source must export.
pub const ENTRY_VERTEX: &str = "vs_main";
pub const ENTRY_FRAGMENT: &str = "fs_main";

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// CPU mirror of the WGSL `Globals` uniform block.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct GlobalsRaw {
    projection: [[f32; 4]; 4],
    view: [[f32; 4]; 4],
    window_size: [f32; 2],
    _pad: [f32; 2],
}

struct Layouts {
    globals: wgpu::BindGroupLayout,
    model: wgpu::BindGroupLayout,
    material_flat: wgpu::BindGroupLayout,
    material_cube: wgpu::BindGroupLayout,
}

struct ProgramEntry {
    mode: ProgramMode,
    standard: wgpu::RenderPipeline,
    no_depth: wgpu::RenderPipeline,
}

struct TextureEntry {
    view: wgpu::TextureView,
    mode: ProgramMode,
}

struct FrameCtx {
    surface_texture: Option<wgpu::SurfaceTexture>,
    view: wgpu::TextureView,
    encoder: wgpu::CommandEncoder,
    pass: Option<wgpu::RenderPass<'static>>,
    pending_clear: Option<(ClearMode, Color)>,
}

enum Target {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        // Kept alive for the surface's sake.
        _window: Arc<Window>,
    },
    Offscreen {
        texture: wgpu::Texture,
    },
}

pub struct WgpuBackend {
    context: GpuContext,
    target: Target,
    format: wgpu::TextureFormat,
    depth_view: wgpu::TextureView,
    limits: BackendLimits,
    layouts: Layouts,
    sampler: wgpu::Sampler,
    globals_buf: wgpu::Buffer,
    globals_bind: wgpu::BindGroup,
    dummy_skeleton: wgpu::Buffer,
    dummy_weights: wgpu::Buffer,
    white_flat: wgpu::TextureView,
    white_cube: wgpu::TextureView,
    next_handle: u64,
    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, TextureEntry>,
    programs: HashMap<u64, ProgramEntry>,
    frame: Option<FrameCtx>,
}

impl WgpuBackend {
    /// Window-backed backend.  Must be called on the render thread; the
    /// embedding application owns the window and its event loop.
    pub fn new(window: Arc<Window>) -> Result<Self, BackendError> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| BackendError::Surface(e.to_string()))?;
        let context = GpuContext::new(instance, Some(&surface))
            .map_err(|e| BackendError::Device(e.to_string()))?;

        let caps = surface.get_capabilities(&context.adapter);
        let format = caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .unwrap_or(caps.formats[0]);
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&context.device, &config);

        Self::finish_init(
            context,
            Target::Window {
                surface,
                config,
                _window: window,
            },
            format,
            size.width.max(1),
            size.height.max(1),
        )
    }

    /// Render-to-texture backend with no window, for servers and tests on
    /// machines that do have a GPU.
    pub fn offscreen(width: u32, height: u32) -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let context =
            GpuContext::new(instance, None).map_err(|e| BackendError::Device(e.to_string()))?;
        let format = wgpu::TextureFormat::Rgba8UnormSrgb;
        let texture = create_color_target(&context.device, width, height, format);
        Self::finish_init(context, Target::Offscreen { texture }, format, width, height)
    }

    fn finish_init(
        context: GpuContext,
        target: Target,
        format: wgpu::TextureFormat,
        width: u32,
        height: u32,
    ) -> Result<Self, BackendError> {
        let device = &context.device;
        let device_limits = device.limits();
        let limits = BackendLimits {
            max_combined_texture_units: device_limits.max_sampled_textures_per_shader_stage,
            max_texture_size: device_limits.max_texture_dimension_2d,
        };

        let layouts = Layouts::new(device);
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("Kiln Sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let globals_buf = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kiln Globals"),
            contents: bytemuck::bytes_of(&GlobalsRaw {
                projection: glam::Mat4::IDENTITY.to_cols_array_2d(),
                view: glam::Mat4::IDENTITY.to_cols_array_2d(),
                window_size: [width as f32, height as f32],
                _pad: [0.0; 2],
            }),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let globals_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Kiln Globals BindGroup"),
            layout: &layouts.globals,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: globals_buf.as_entire_binding(),
            }],
        });

        // Placeholder skinning buffers for unskinned draws: one identity
        // bone, one zero weight.
        let dummy_skeleton = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kiln Dummy Skeleton"),
            contents: bytemuck::cast_slice(&glam::Mat4::IDENTITY.to_cols_array()),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let dummy_weights = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kiln Dummy Weights"),
            contents: bytemuck::cast_slice(&[0.0f32]),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let white_flat = create_white_texture(&context, false);
        let white_cube = create_white_texture(&context, true);
        let depth_view = create_depth_view(device, width, height);

        Ok(Self {
            context,
            target,
            format,
            depth_view,
            limits,
            layouts,
            sampler,
            globals_buf,
            globals_bind,
            dummy_skeleton,
            dummy_weights,
            white_flat,
            white_cube,
            next_handle: 1,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            frame: None,
        })
    }

    fn issue(&mut self) -> u64 {
        let h = self.next_handle;
        self.next_handle += 1;
        h
    }

    fn store_buffer(&mut self, buffer: wgpu::Buffer) -> BufferId {
        let h = self.issue();
        self.buffers.insert(h, buffer);
        BufferId(h)
    }


    /// Compiles one WGSL stage inside a validation error scope.
    fn compile(&self, source: &str, label: &str) -> Result<wgpu::ShaderModule, BackendError> {
        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        match pollster::block_on(device.pop_error_scope()) {
            Some(err) => Err(BackendError::Link(err.to_string())),
            None => Ok(module),
        }
    }

    fn build_pipeline(
        &self,
        vs: &wgpu::ShaderModule,
        fs: &wgpu::ShaderModule,
        layout: &wgpu::PipelineLayout,
        depth: DepthMode,
    ) -> Result<wgpu::RenderPipeline, BackendError> {
        let device = &self.context.device;
        let (depth_state, cull_mode) = match depth {
            DepthMode::Standard => (
                wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::Less,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                },
                Some(wgpu::Face::Back),
            ),
            // The background pass must never occlude scene geometry.
            DepthMode::Disabled => (
                wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: false,
                    depth_compare: wgpu::CompareFunction::Always,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                },
                None,
            ),
        };

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("Kiln Program Pipeline"),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: vs,
                entry_point: Some(ENTRY_VERTEX),
                buffers: &vertex_layouts(),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: fs,
                entry_point: Some(ENTRY_FRAGMENT),
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.format,
                    blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode,
                ..Default::default()
            },
            depth_stencil: Some(depth_state),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        match pollster::block_on(device.pop_error_scope()) {
            Some(err) => Err(BackendError::Link(err.to_string())),
            None => Ok(pipeline),
        }
    }
}

impl RenderBackend for WgpuBackend {
    fn limits(&self) -> BackendLimits {
        self.limits
    }

    fn default_program_sources(&self, which: DefaultProgram) -> ProgramSources {
        let (vertex, fragment) = match which {
            DefaultProgram::Flat => (
                include_str!("shaders/flat.vert"),
                include_str!("shaders/flat.frag"),
            ),
            DefaultProgram::Cubemap => (
                include_str!("shaders/flat.vert"),
                include_str!("shaders/cubemap.frag"),
            ),
            DefaultProgram::Ui => (
                include_str!("shaders/ui.vert"),
                include_str!("shaders/ui.frag"),
            ),
            DefaultProgram::Skybox => (
                include_str!("shaders/skybox.vert"),
                include_str!("shaders/skybox.frag"),
            ),
        };
        ProgramSources {
            vertex: vertex.to_owned(),
            geometry: None,
            fragment: fragment.to_owned(),
        }
    }

    fn create_vertex_buffer(
        &mut self,
        stream: VertexStream,
        data: &[u8],
    ) -> Result<BufferId, BackendError> {
        let label = match stream {
            VertexStream::Positions => "Kiln Positions",
            VertexStream::Uvs => "Kiln Uvs",
            VertexStream::Normals => "Kiln Normals",
        };
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: data,
                usage: wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
            });
        Ok(self.store_buffer(buffer))
    }

    fn create_index_buffer(&mut self, data: &[u8]) -> Result<BufferId, BackendError> {
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Kiln Indices"),
                contents: data,
                usage: wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
            });
        Ok(self.store_buffer(buffer))
    }

    fn create_storage_buffer(&mut self, data: &[u8]) -> Result<BufferId, BackendError> {
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Kiln Storage"),
                contents: data,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
            });
        Ok(self.store_buffer(buffer))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferId,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let buffer = lookup(&self.buffers, buffer)?;
        if offset + data.len() as u64 > buffer.size() {
            return Err(BackendError::Device(format!(
                "write of {} bytes at {offset} overruns {}-byte buffer",
                data.len(),
                buffer.size()
            )));
        }
        self.context.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(&buffer.0);
    }

    fn create_texture_2d(
        &mut self,
        width: u32,
        height: u32,
        rgba: &[u8],
    ) -> Result<TextureId, BackendError> {
        if rgba.len() != (width * height * 4) as usize {
            return Err(BackendError::Device("texture payload size mismatch".into()));
        }
        let device = &self.context.device;
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Kiln Texture2d"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.context.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::ImageDataLayout {
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
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let h = self.issue();
        self.textures.insert(
            h,
            TextureEntry {
                view,
                mode: ProgramMode::Flat,
            },
        );
        Ok(TextureId(h))
    }

    fn create_texture_cubemap(
        &mut self,
        size: u32,
        faces: &[Vec<u8>; 6],
    ) -> Result<TextureId, BackendError> {
        let face_bytes = (size * size * 4) as usize;
        if faces.iter().any(|f| f.len() != face_bytes) {
            return Err(BackendError::Device("cubemap face size mismatch".into()));
        }
        let device = &self.context.device;
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Kiln Cubemap"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 6,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        for (layer, face) in faces.iter().enumerate() {
            self.context.queue.write_texture(
                wgpu::ImageCopyTexture {
                    texture: &texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d {
                        x: 0,
                        y: 0,
                        z: layer as u32,
                    },
                    aspect: wgpu::TextureAspect::All,
                },
                face,
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(size * 4),
                    rows_per_image: Some(size),
                },
                wgpu::Extent3d {
                    width: size,
                    height: size,
                    depth_or_array_layers: 1,
                },
            );
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::Cube),
            ..Default::default()
        });
        let h = self.issue();
        self.textures.insert(
            h,
            TextureEntry {
                view,
                mode: ProgramMode::Cubemap,
            },
        );
        Ok(TextureId(h))
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture.0);
    }

    fn link_program(
        &mut self,
        sources: &ProgramSources,
        mode: ProgramMode,
    ) -> Result<LinkedProgram, BackendError> {
        if sources.geometry.is_some() {
            return Err(BackendError::Link(
                "geometry stages are not supported by the wgpu backend".into(),
            ));
        }
        let vs = self.compile(&sources.vertex, "Kiln Vertex Stage")?;
        let fs = self.compile(&sources.fragment, "Kiln Fragment Stage")?;

        let material = match mode {
            ProgramMode::Flat => &self.layouts.material_flat,
            ProgramMode::Cubemap => &self.layouts.material_cube,
        };
        let layout = self
            .context
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("Kiln Program Layout"),
                bind_group_layouts: &[&self.layouts.globals, &self.layouts.model, material],
                push_constant_ranges: &[],
            });

        let standard = self.build_pipeline(&vs, &fs, &layout, DepthMode::Standard)?;
        let no_depth = self.build_pipeline(&vs, &fs, &layout, DepthMode::Disabled)?;

        let mut resources = reflect_bindings(&sources.vertex);
        resources.extend(reflect_bindings(&sources.fragment));

        let h = self.issue();
        self.programs.insert(
            h,
            ProgramEntry {
                mode,
                standard,
                no_depth,
            },
        );
        Ok(LinkedProgram {
            id: ProgramId(h),
            resources,
        })
    }

    fn validate_program(&mut self, program: ProgramId) -> Result<(), BackendError> {
        // Pipeline validation already ran inside the link's error scopes;
        // here we only confirm the handle is live.
        if self.programs.contains_key(&program.0) {
            Ok(())
        } else {
            Err(BackendError::UnknownHandle("program"))
        }
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program.0);
    }

    fn begin_frame(&mut self) -> Result<(), BackendError> {
        let device = &self.context.device;
        let (surface_texture, view) = match &self.target {
            Target::Window {
                surface, config, ..
            } => match surface.get_current_texture() {
                Ok(t) => {
                    let view = t.texture.create_view(&wgpu::TextureViewDescriptor::default());
                    (Some(t), view)
                }
                Err(wgpu::SurfaceError::Lost) | Err(wgpu::SurfaceError::Outdated) => {
                    surface.configure(device, config);
                    return Err(BackendError::Surface("surface lost; reconfigured".into()));
                }
                Err(e) => return Err(BackendError::Surface(e.to_string())),
            },
            Target::Offscreen { texture } => (
                None,
                texture.create_view(&wgpu::TextureViewDescriptor::default()),
            ),
        };
        let encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Kiln Frame Encoder"),
        });
        self.frame = Some(FrameCtx {
            surface_texture,
            view,
            encoder,
            pass: None,
            pending_clear: None,
        });
        Ok(())
    }

    fn set_globals(&mut self, globals: &GlobalUniforms) -> Result<(), BackendError> {
        let raw = GlobalsRaw {
            projection: globals.projection.to_cols_array_2d(),
            view: globals.view.to_cols_array_2d(),
            window_size: globals.window_size,
            _pad: [0.0; 2],
        };
        self.context
            .queue
            .write_buffer(&self.globals_buf, 0, bytemuck::bytes_of(&raw));
        Ok(())
    }

    fn clear(&mut self, mode: ClearMode, color: Color) {
        if let Some(frame) = self.frame.as_mut() {
            // End the open pass; the clear becomes the next pass's load ops.
            frame.pass = None;
            frame.pending_clear = Some((mode, color));
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), BackendError> {
        // Open the pass first so the later field borrows stay disjoint.
        {
            let frame = self
                .frame
                .as_mut()
                .ok_or_else(|| BackendError::Device("draw outside of a frame".into()))?;
            if frame.pass.is_none() || frame.pending_clear.is_some() {
                open_pass(frame, &self.depth_view);
            }
        }

        let device = &self.context.device;
        let program = self
            .programs
            .get(&call.program.0)
            .ok_or(BackendError::UnknownHandle("program"))?;
        let pipeline = match call.depth {
            DepthMode::Standard => &program.standard,
            DepthMode::Disabled => &program.no_depth,
        };

        let positions = lookup(&self.buffers, call.positions)?;
        let uvs = lookup(&self.buffers, call.uvs)?;
        let normals = lookup(&self.buffers, call.normals)?;
        let indices = lookup(&self.buffers, call.indices)?;
        let instances = lookup(&self.buffers, call.instances)?;

        let (skeleton, weights, bone_count) = match call.skin {
            Some(skin) => (
                lookup(&self.buffers, skin.skeleton)?,
                lookup(&self.buffers, skin.weights)?,
                skin.bone_count,
            ),
            None => (&self.dummy_skeleton, &self.dummy_weights, 0),
        };
        let skin_meta = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Kiln Skin Meta"),
            contents: bytemuck::cast_slice(&[bone_count, 0u32, 0u32, 0u32]),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let model_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Kiln Model BindGroup"),
            layout: &self.layouts.model,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: instances.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: skeleton.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: weights.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: skin_meta.as_entire_binding(),
                },
            ],
        });

        let texture_view = call
            .textures
            .iter()
            .min_by_key(|(unit, _)| *unit)
            .and_then(|(_, id)| self.textures.get(&id.0))
            .filter(|entry| entry.mode == program.mode)
            .map(|entry| &entry.view)
            .unwrap_or(match program.mode {
                ProgramMode::Flat => &self.white_flat,
                ProgramMode::Cubemap => &self.white_cube,
            });
        let material_layout = match program.mode {
            ProgramMode::Flat => &self.layouts.material_flat,
            ProgramMode::Cubemap => &self.layouts.material_cube,
        };
        let material_bind = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Kiln Material BindGroup"),
            layout: material_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(texture_view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        });

        let frame = self
            .frame
            .as_mut()
            .ok_or_else(|| BackendError::Device("draw outside of a frame".into()))?;
        let pass = frame
            .pass
            .as_mut()
            .ok_or_else(|| BackendError::Device("render pass not open".into()))?;
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &self.globals_bind, &[]);
        pass.set_bind_group(1, &model_bind, &[]);
        pass.set_bind_group(2, &material_bind, &[]);
        pass.set_vertex_buffer(0, positions.slice(..));
        pass.set_vertex_buffer(1, uvs.slice(..));
        pass.set_vertex_buffer(2, normals.slice(..));
        pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed(0..call.index_count, 0, 0..call.instance_count.max(1));
        Ok(())
    }

    fn end_frame(&mut self) {
        let Some(mut frame) = self.frame.take() else {
            return;
        };
        // A trailing clear with no draw after it still has to land.
        if frame.pending_clear.is_some() {
            open_pass(&mut frame, &self.depth_view);
        }
        frame.pass = None;
        self.context.queue.submit(Some(frame.encoder.finish()));
        if let Some(t) = frame.surface_texture {
            t.present();
        }
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let device = &self.context.device;
        match &mut self.target {
            Target::Window {
                surface, config, ..
            } => {
                config.width = width;
                config.height = height;
                surface.configure(device, config);
            }
            Target::Offscreen { texture } => {
                *texture = create_color_target(device, width, height, self.format);
            }
        }
        self.depth_view = create_depth_view(device, width, height);
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

impl Layouts {
    fn new(device: &wgpu::Device) -> Self {
        let storage_entry = |binding: u32| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::VERTEX,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only: true },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let material = |device: &wgpu::Device, dimension, label| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &[
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: dimension,
                            multisampled: false,
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::FRAGMENT,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ],
            })
        };

        let globals = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Kiln Layout: Globals"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let model = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Kiln Layout: Model"),
            entries: &[
                storage_entry(0),
                storage_entry(1),
                storage_entry(2),
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });
        Self {
            globals,
            model,
            material_flat: material(device, wgpu::TextureViewDimension::D2, "Kiln Layout: Material 2d"),
            material_cube: material(
                device,
                wgpu::TextureViewDimension::Cube,
                "Kiln Layout: Material Cube",
            ),
        }
    }
}

/// Vertex layouts for the three attribute streams, locations fixed by
/// `kiln_engine::shader_abi`.
fn vertex_layouts() -> [wgpu::VertexBufferLayout<'static>; 3] {
    const POSITION: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![0 => Float32x3];
    const UV: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![1 => Float32x2];
    const NORMAL: [wgpu::VertexAttribute; 1] = wgpu::vertex_attr_array![2 => Float32x3];
    [
        wgpu::VertexBufferLayout {
            array_stride: 12,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &POSITION,
        },
        wgpu::VertexBufferLayout {
            array_stride: 8,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &UV,
        },
        wgpu::VertexBufferLayout {
            array_stride: 12,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &NORMAL,
        },
    ]
}

fn lookup<'a>(
    buffers: &'a HashMap<u64, wgpu::Buffer>,
    id: BufferId,
) -> Result<&'a wgpu::Buffer, BackendError> {
    buffers.get(&id.0).ok_or(BackendError::UnknownHandle("buffer"))
}

fn open_pass(frame: &mut FrameCtx, depth_view: &wgpu::TextureView) {
    let (color_load, depth_load) = match frame.pending_clear.take() {
        Some((ClearMode::ColorAndDepth, c)) => (
            wgpu::LoadOp::Clear(wgpu::Color {
                r: c.r as f64,
                g: c.g as f64,
                b: c.b as f64,
                a: c.a as f64,
            }),
            wgpu::LoadOp::Clear(1.0),
        ),
        Some((ClearMode::DepthOnly, _)) => (wgpu::LoadOp::Load, wgpu::LoadOp::Clear(1.0)),
        None => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
    };
    let pass = frame
        .encoder
        .begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Kiln Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &frame.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            occlusion_query_set: None,
            timestamp_writes: None,
        })
        .forget_lifetime();
    frame.pass = Some(pass);
}

fn create_depth_view(device: &wgpu::Device, width: u32, height: u32) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Kiln Depth"),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn create_color_target(
    device: &wgpu::Device,
    width: u32,
    height: u32,
    format: wgpu::TextureFormat,
) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Kiln Offscreen Target"),
        size: wgpu::Extent3d {
            width: width.max(1),
            height: height.max(1),
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn create_white_texture(context: &GpuContext, cube: bool) -> wgpu::TextureView {
    let layers = if cube { 6 } else { 1 };
    let texture = context.device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Kiln Neutral Texture"),
        size: wgpu::Extent3d {
            width: 1,
            height: 1,
            depth_or_array_layers: layers,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: wgpu::TextureFormat::Rgba8UnormSrgb,
        usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        view_formats: &[],
    });
    for layer in 0..layers {
        context.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d {
                    x: 0,
                    y: 0,
                    z: layer,
                },
                aspect: wgpu::TextureAspect::All,
            },
            &[255u8; 4],
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
    }
    texture.create_view(&wgpu::TextureViewDescriptor {
        dimension: Some(if cube {
            wgpu::TextureViewDimension::Cube
        } else {
            wgpu::TextureViewDimension::D2
        }),
        ..Default::default()
    })
}

/// name → binding map recovered from a WGSL module's globals.
fn reflect_bindings(source: &str) -> HashMap<String, u32> {
    let mut map = HashMap::new();
    match naga::front::wgsl::parse_str(source) {
        Ok(module) => {
            for (_, var) in module.global_variables.iter() {
                if let (Some(name), Some(binding)) = (&var.name, &var.binding) {
                    map.insert(name.clone(), binding.binding);
                }
            }
        }
        Err(e) => log::debug!("reflection parse failed: {e}"),
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflection_maps_names_to_bindings() {
        let map = reflect_bindings(include_str!("shaders/flat.vert"));
        assert_eq!(map.get("globals"), Some(&0));
        assert_eq!(map.get("instances"), Some(&0));
        assert_eq!(map.get("skeleton"), Some(&1));
        assert_eq!(map.get("weights"), Some(&2));
        assert_eq!(map.get("skin"), Some(&3));
    }

    #[test]
    fn default_sources_parse_as_wgsl()  {
        for source in [
            include_str!("shaders/flat.vert"),
            include_str!("shaders/flat.frag"),
            include_str!("shaders/cubemap.frag"),
            include_str!("shaders/ui.vert"),
            include_str!("shaders/ui.frag"),
            include_str!("shaders/skybox.vert"),
            include_str!("shaders/skybox.frag"),
        ] {
            assert!(naga::front::wgsl::parse_str(source).is_ok());
        }
    }
}
