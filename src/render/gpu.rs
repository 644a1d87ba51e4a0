//! wgpu compute executor for the grid programs.
//!
//! Every surface is a storage buffer of `vec4<f32>` texels and every program is one compute
//! entry point in `shaders/fluid.wgsl`. Passes are submitted one at a time, in call order.

use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use log::{debug, info};
use wgpu::util::DeviceExt;

use super::{
    BackendError, ChannelLayout, Geometry, Pass, Precision, Program, RenderBackend, RenderCapabilities,
    SurfaceDesc, SurfaceFormat, SurfaceId, UniformReader, VertexBufferId,
};

const WORKGROUP_SIZE: u32 = 16;
const TEXEL_BYTES: u64 = std::mem::size_of::<[f32; 4]>() as u64;

const PROGRAMS: [Program; 11] = [
    Program::Copy,
    Program::Clear,
    Program::Splat,
    Program::Curl,
    Program::Vorticity,
    Program::Divergence,
    Program::Pressure,
    Program::GradientSubtract,
    Program::Advection,
    Program::ConstructSolid,
    Program::PaintPolygon,
];

fn entry_point(program: Program) -> &'static str {
    match program {
        Program::Copy => "copy",
        Program::Clear => "clear",
        Program::Splat => "splat",
        Program::Curl => "curl",
        Program::Vorticity => "vorticity",
        Program::Divergence => "divergence",
        Program::Pressure => "pressure",
        Program::GradientSubtract => "gradient_subtract",
        Program::Advection => "advection",
        Program::ConstructSolid => "construct_solid",
        Program::PaintPolygon => "paint_polygon",
    }
}

/// Mirrors `Params` in `shaders/fluid.wgsl`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
struct Params {
    dst_size: [u32; 2],
    a_size: [u32; 2],
    b_size: [u32; 2],
    c_size: [u32; 2],
    texel_size: [f32; 2],
    dye_texel_size: [f32; 2],
    point: [f32; 2],
    aspect_ratio: f32,
    radius: f32,
    color: [f32; 4],
    dt: f32,
    dissipation: f32,
    curl: f32,
    value: f32,
    force: f32,
    solid_mask: u32,
    vertex_count: u32,
    manual_filtering: u32,
}

/// Reads exactly the uniforms each program consumes, so a missing one fails the same way on
/// every backend.
fn params_for(reader: &UniformReader<'_>) -> Result<Params, BackendError> {
    let mut params = Params::default();
    match reader.program {
        Program::Copy | Program::ConstructSolid => {}
        Program::Clear => params.value = reader.float("value")?,
        Program::Splat => {
            params.point = reader.vec2("point")?;
            params.aspect_ratio = reader.float("aspectRatio")?;
            params.radius = reader.float("radius")?;
            params.force = reader.float("force")?;
            params.color = reader.color("color")?;
        }
        Program::Curl | Program::Divergence | Program::Pressure | Program::GradientSubtract => {
            params.texel_size = reader.vec2("texelSize")?;
        }
        Program::Vorticity => {
            params.texel_size = reader.vec2("texelSize")?;
            params.curl = reader.float("curl")?;
            params.dt = reader.float("dt")?;
        }
        Program::Advection => {
            params.texel_size = reader.vec2("texelSize")?;
            params.dt = reader.float("dt")?;
            params.dissipation = reader.float("dissipation")?;
            let manual = reader.flag("manualFiltering")?;
            params.manual_filtering = u32::from(manual);
            params.solid_mask = u32::from(reader.flag("solidMask")?);
            if manual {
                params.dye_texel_size = reader.vec2("dyeTexelSize")?;
            }
        }
        Program::PaintPolygon => params.color = reader.color("color")?,
    }
    Ok(params)
}

struct GpuSurface {
    desc: SurfaceDesc,
    buffer: wgpu::Buffer,
}

struct GpuVertices {
    buffer: wgpu::Buffer,
    count: u32,
}

pub struct GpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    caps: RenderCapabilities,
    bind_group_layout: wgpu::BindGroupLayout,
    pipelines: HashMap<Program, wgpu::ComputePipeline>,
    params_buffer: wgpu::Buffer,
    // Bound to input slots a program does not use.
    placeholder_texels: wgpu::Buffer,
    placeholder_vertices: wgpu::Buffer,
    surfaces: HashMap<SurfaceId, GpuSurface>,
    vertex_buffers: HashMap<VertexBufferId, GpuVertices>,
    next_id: u32,
}

impl GpuBackend {
    /// Creates a device without a window. Fails when no adapter is available.
    pub fn new_headless() -> Result<Self, BackendError> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| BackendError::Device("no compatible GPU adapter".into()))?;
        info!("using adapter {:?}", adapter.get_info().name);

        let (device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Fluid Device"),
                required_features: wgpu::Features::empty(),
                required_limits: wgpu::Limits::default(),
                memory_hints: Default::default(),
            },
            None,
        ))
        .map_err(|err| BackendError::Device(err.to_string()))?;

        Ok(Self::from_device(device, queue))
    }

    pub fn from_device(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Fluid Programs"),
            source: wgpu::ShaderSource::Wgsl(include_str!("../../shaders/fluid.wgsl").into()),
        });

        let storage = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Fluid Bind Group Layout"),
            entries: &[
                storage(0, true),
                storage(1, true),
                storage(2, true),
                storage(3, false),
                wgpu::BindGroupLayoutEntry {
                    binding: 4,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage(5, true),
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Fluid Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipelines = PROGRAMS
            .iter()
            .map(|&program| {
                let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry_point(program)),
                    layout: Some(&pipeline_layout),
                    module: &shader,
                    entry_point: entry_point(program),
                    compilation_options: Default::default(),
                    cache: None,
                });
                (program, pipeline)
            })
            .collect();

        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Fluid Params"),
            contents: bytemuck::bytes_of(&Params::default()),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let placeholder_texels = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Placeholder Texels"),
            contents: bytemuck::cast_slice(&[[0.0f32; 4]]),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let placeholder_vertices = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Placeholder Vertices"),
            contents: bytemuck::cast_slice(&[[0.0f32; 2]; 2]),
            usage: wgpu::BufferUsages::STORAGE,
        });

        // Storage buffers of vec4<f32> only; filtering is done in the shader when asked for.
        let caps = RenderCapabilities {
            formats: vec![SurfaceFormat::new(ChannelLayout::Rgba, Precision::Full)],
            linear_filtering: false,
        };

        Self {
            device,
            queue,
            caps,
            bind_group_layout,
            pipelines,
            params_buffer,
            placeholder_texels,
            placeholder_vertices,
            surfaces: HashMap::new(),
            vertex_buffers: HashMap::new(),
            next_id: 1,
        }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn surface(&self, id: SurfaceId) -> Result<&GpuSurface, BackendError> {
        self.surfaces.get(&id).ok_or(BackendError::UnknownSurface(id))
    }

    fn vertices(&self, pass: &Pass<'_>) -> Result<Option<&GpuVertices>, BackendError> {
        match pass.geometry {
            Geometry::FullScreen if pass.program.needs_polygon() => Err(BackendError::GeometryRequired(pass.program)),
            Geometry::FullScreen => Ok(None),
            Geometry::Polygon(id) => self
                .vertex_buffers
                .get(&id)
                .map(Some)
                .ok_or(BackendError::UnknownVertexBuffer(id)),
        }
    }
}

impl RenderBackend for GpuBackend {
    fn capabilities(&self) -> &RenderCapabilities {
        &self.caps
    }

    fn create_surface(&mut self, desc: SurfaceDesc) -> Result<SurfaceId, BackendError> {
        if !self.caps.supports(desc.format) {
            return Err(BackendError::UnsupportedFormat(desc.format.layout));
        }
        let size = desc.width as u64 * desc.height as u64 * TEXEL_BYTES;
        let limits = self.device.limits();
        if size > limits.max_buffer_size || size > limits.max_storage_buffer_binding_size as u64 {
            return Err(BackendError::OutOfMemory { width: desc.width, height: desc.height });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Grid Surface"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        if pollster::block_on(self.device.pop_error_scope()).is_some() {
            buffer.destroy();
            return Err(BackendError::OutOfMemory { width: desc.width, height: desc.height });
        }

        let id = SurfaceId(self.next_id());
        debug!("gpu surface {id:?}: {}x{} ({size} bytes)", desc.width, desc.height);
        self.surfaces.insert(id, GpuSurface { desc, buffer });
        Ok(id)
    }

    fn destroy_surface(&mut self, id: SurfaceId) {
        if let Some(surface) = self.surfaces.remove(&id) {
            surface.buffer.destroy();
        }
    }

    fn create_vertex_buffer(&mut self, vertices: &[[f32; 2]]) -> Result<VertexBufferId, BackendError> {
        // A zero-sized storage binding is invalid; an empty outline still gets one slot.
        let contents: Vec<[f32; 2]> = if vertices.is_empty() { vec![[0.0; 2]] } else { vertices.to_vec() };
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Polygon Vertices"),
            contents: bytemuck::cast_slice(&contents),
            usage: wgpu::BufferUsages::STORAGE,
        });
        let id = VertexBufferId(self.next_id());
        self.vertex_buffers.insert(id, GpuVertices { buffer, count: vertices.len() as u32 });
        Ok(id)
    }

    fn destroy_vertex_buffer(&mut self, id: VertexBufferId) {
        if let Some(vertices) = self.vertex_buffers.remove(&id) {
            vertices.buffer.destroy();
        }
    }

    fn run(&mut self, pass: &Pass<'_>) -> Result<(), BackendError> {
        let reader = pass.reader();
        let inputs = reader
            .inputs(pass.target)?
            .into_iter()
            .map(|id| self.surface(id))
            .collect::<Result<Vec<_>, _>>()?;
        let vertices = self.vertices(pass)?;
        let target = self.surface(pass.target)?;

        let mut params = params_for(&reader)?;
        params.dst_size = [target.desc.width, target.desc.height];
        let sizes = [&mut params.a_size, &mut params.b_size, &mut params.c_size];
        for (slot, input) in sizes.into_iter().zip(&inputs) {
            *slot = [input.desc.width, input.desc.height];
        }
        params.vertex_count = vertices.map_or(0, |v| v.count);
        self.queue.write_buffer(&self.params_buffer, 0, bytemuck::bytes_of(&params));

        let input_binding = |i: usize| {
            inputs
                .get(i)
                .map_or(&self.placeholder_texels, |s| &s.buffer)
                .as_entire_binding()
        };
        let vertex_binding = vertices
            .map_or(&self.placeholder_vertices, |v| &v.buffer)
            .as_entire_binding();
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Fluid Pass Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry { binding: 0, resource: input_binding(0) },
                wgpu::BindGroupEntry { binding: 1, resource: input_binding(1) },
                wgpu::BindGroupEntry { binding: 2, resource: input_binding(2) },
                wgpu::BindGroupEntry { binding: 3, resource: target.buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 4, resource: self.params_buffer.as_entire_binding() },
                wgpu::BindGroupEntry { binding: 5, resource: vertex_binding },
            ],
        });

        let pipeline = self
            .pipelines
            .get(&pass.program)
            .ok_or_else(|| BackendError::Device(format!("no pipeline for {:?}", pass.program)))?;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(entry_point(pass.program)),
        });
        {
            let mut compute = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(entry_point(pass.program)),
                timestamp_writes: None,
            });
            compute.set_pipeline(pipeline);
            compute.set_bind_group(0, &bind_group, &[]);
            compute.dispatch_workgroups(
                target.desc.width.div_ceil(WORKGROUP_SIZE),
                target.desc.height.div_ceil(WORKGROUP_SIZE),
                1,
            );
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn clear(&mut self, surface: SurfaceId) -> Result<(), BackendError> {
        let target = self.surface(surface)?;
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Clear Surface"),
        });
        encoder.clear_buffer(&target.buffer, 0, None);
        self.queue.submit(std::iter::once(encoder.finish()));
        Ok(())
    }

    fn read_pixels(&mut self, surface: SurfaceId) -> Result<Vec<[f32; 4]>, BackendError> {
        let source = self.surface(surface)?;
        let size = source.buffer.size();
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Read"),
        });
        encoder.copy_buffer_to_buffer(&source.buffer, 0, &staging_buffer, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(receiver.receive())
            .ok_or_else(|| BackendError::Device("readback channel closed".into()))?
            .map_err(|err| BackendError::Device(err.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let result: Vec<[f32; 4]> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::FluidGrids;
    use crate::render::cpu::CpuBackend;
    use crate::render::Uniforms;
    use crate::settings::SimulationSettings;
    use crate::solver::FluidSolver;
    use crate::splat;

    fn gpu() -> Option<GpuBackend> {
        match GpuBackend::new_headless() {
            Ok(backend) => Some(backend),
            Err(err) => {
                eprintln!("skipping GPU test: {err}");
                None
            }
        }
    }

    #[test]
    fn test_params_match_shader_layout() {
        assert_eq!(std::mem::size_of::<Params>(), 112);
        assert_eq!(std::mem::size_of::<Params>() % 16, 0);
    }

    #[test]
    fn test_params_require_program_uniforms() {
        let uniforms = Uniforms::new().surface("uVelocity", SurfaceId(1));
        let pass = Pass::full_screen(Program::Curl, &uniforms, SurfaceId(2));
        assert!(matches!(
            params_for(&pass.reader()),
            Err(BackendError::MissingUniform { name: "texelSize", .. })
        ));
    }

    #[test]
    fn test_gpu_matches_cpu_backend() {
        let Some(mut gpu) = gpu() else {
            return;
        };
        // Same capabilities on both sides so both take the manual filtering path.
        let mut cpu = CpuBackend::with_capabilities(gpu.capabilities().clone());
        let settings = SimulationSettings {
            sim_resolution: 32,
            dye_resolution: 32,
            bloom: false,
            sunrays: false,
            ..Default::default()
        };

        let run = |backend: &mut dyn RenderBackend| -> Vec<[f32; 4]> {
            let mut grids = FluidGrids::init(backend, &settings, (48, 32)).unwrap();
            let solver = FluidSolver::new(backend.capabilities());
            splat::splat(backend, &mut grids, 1.5, [0.4, 0.5], [300.0, 80.0], [1.0, 0.5, 0.2], 0.005, 1.0).unwrap();
            for _ in 0..5 {
                solver.step(backend, &mut grids, &settings, 1.0 / 60.0).unwrap();
            }
            backend.read_pixels(grids.velocity.read().surface).unwrap()
        };
        let from_gpu = run(&mut gpu);
        let from_cpu = run(&mut cpu);

        assert_eq!(from_gpu.len(), from_cpu.len());
        let peak = from_cpu.iter().map(|p| p[0].abs().max(p[1].abs())).fold(0.0_f32, f32::max);
        assert!(peak > 1.0);
        for (g, c) in from_gpu.iter().zip(&from_cpu) {
            assert!((g[0] - c[0]).abs() <= 1e-3 * peak, "{g:?} vs {c:?}");
            assert!((g[1] - c[1]).abs() <= 1e-3 * peak, "{g:?} vs {c:?}");
        }
    }

    #[test]
    fn test_gpu_construct_solid_and_readback() {
        let Some(mut gpu) = gpu() else {
            return;
        };
        let solids = crate::grid::allocate(&mut gpu, 16, 16, ChannelLayout::R, crate::render::FilterMode::Nearest)
            .unwrap();
        gpu.clear(solids.surface).unwrap();
        let left_half = gpu
            .create_vertex_buffer(&[[-1.0, -1.0], [0.0, -1.0], [0.0, 1.0], [-1.0, 1.0]])
            .unwrap();
        let uniforms = Uniforms::new();
        gpu.run(&Pass::polygon(Program::ConstructSolid, &uniforms, solids.surface, left_half))
            .unwrap();

        let pixels = gpu.read_pixels(solids.surface).unwrap();
        assert_eq!(pixels.len(), 256);
        for y in 0..16 {
            for x in 0..16 {
                let expected = if x < 8 { 1.0 } else { 0.0 };
                assert_eq!(pixels[y * 16 + x][0], expected, "texel ({x}, {y})");
            }
        }
    }
}
