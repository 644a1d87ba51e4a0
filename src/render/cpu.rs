//! Software executor for the grid programs.
//!
//! Texel (x, y) sits at uv ((x + 0.5) / w, (y + 0.5) / h). Sampling clamps to the edge, and a
//! surface samples bilinearly only when it was created with [`FilterMode::Linear`].

use std::collections::HashMap;

use glam::{Vec2, Vec3, Vec4, Vec4Swizzles};

use super::{
    polygon_contains, BackendError, ChannelLayout, FilterMode, Geometry, Pass, Precision, Program,
    RenderBackend, RenderCapabilities, SurfaceDesc, SurfaceFormat, SurfaceId, UniformReader,
    VertexBufferId,
};

const VELOCITY_LIMIT: f32 = 1000.0;

struct CpuSurface {
    desc: SurfaceDesc,
    texels: Vec<Vec4>,
}

impl CpuSurface {
    fn texel(&self, x: i32, y: i32) -> Vec4 {
        let w = self.desc.width as i32;
        let h = self.desc.height as i32;
        let x = x.clamp(0, w - 1);
        let y = y.clamp(0, h - 1);
        self.texels[(y * w + x) as usize]
    }

    fn sample(&self, uv: Vec2) -> Vec4 {
        let size = Vec2::new(self.desc.width as f32, self.desc.height as f32);
        match self.desc.filter {
            FilterMode::Nearest => {
                let p = (uv * size).floor();
                self.texel(p.x as i32, p.y as i32)
            }
            FilterMode::Linear => {
                let st = uv * size - 0.5;
                let i = st.floor();
                let f = st - i;
                let (x, y) = (i.x as i32, i.y as i32);
                let bottom = self.texel(x, y).lerp(self.texel(x + 1, y), f.x);
                let top = self.texel(x, y + 1).lerp(self.texel(x + 1, y + 1), f.x);
                bottom.lerp(top, f.y)
            }
        }
    }

    /// Explicit bilinear sample built from four texel-centre lookups.
    fn bilerp(&self, uv: Vec2, texel_size: Vec2) -> Vec4 {
        let st = uv / texel_size - 0.5;
        let iuv = st.floor();
        let fuv = st - iuv;
        let a = self.sample((iuv + Vec2::new(0.5, 0.5)) * texel_size);
        let b = self.sample((iuv + Vec2::new(1.5, 0.5)) * texel_size);
        let c = self.sample((iuv + Vec2::new(0.5, 1.5)) * texel_size);
        let d = self.sample((iuv + Vec2::new(1.5, 1.5)) * texel_size);
        a.lerp(b, fuv.x).lerp(c.lerp(d, fuv.x), fuv.y)
    }
}

/// Runs every program on the host. Mirrors `shaders/fluid.wgsl` texel for texel.
pub struct CpuBackend {
    caps: RenderCapabilities,
    surfaces: HashMap<SurfaceId, CpuSurface>,
    vertex_buffers: HashMap<VertexBufferId, Vec<[f32; 2]>>,
    next_id: u32,
    memory_limit: Option<u64>,
    allocated: u64,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        let mut formats = Vec::new();
        for layout in [ChannelLayout::R, ChannelLayout::Rg, ChannelLayout::Rgba] {
            for precision in [Precision::Full, Precision::Half] {
                formats.push(SurfaceFormat::new(layout, precision));
            }
        }
        Self::with_capabilities(RenderCapabilities { formats, linear_filtering: true })
    }

    pub fn with_capabilities(caps: RenderCapabilities) -> Self {
        Self {
            caps,
            surfaces: HashMap::new(),
            vertex_buffers: HashMap::new(),
            next_id: 1,
            memory_limit: None,
            allocated: 0,
        }
    }

    /// Caps total surface memory; allocations beyond it fail with `OutOfMemory`.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn surface(&self, id: SurfaceId) -> Result<&CpuSurface, BackendError> {
        self.surfaces.get(&id).ok_or(BackendError::UnknownSurface(id))
    }

    fn polygon(&self, pass: &Pass<'_>) -> Result<Option<&[[f32; 2]]>, BackendError> {
        match pass.geometry {
            Geometry::FullScreen if pass.program.needs_polygon() => {
                Err(BackendError::GeometryRequired(pass.program))
            }
            Geometry::FullScreen => Ok(None),
            Geometry::Polygon(id) => self
                .vertex_buffers
                .get(&id)
                .map(|v| Some(v.as_slice()))
                .ok_or(BackendError::UnknownVertexBuffer(id)),
        }
    }
}

fn surface_bytes(desc: &SurfaceDesc) -> u64 {
    desc.width as u64 * desc.height as u64 * desc.format.bytes_per_texel()
}

impl RenderBackend for CpuBackend {
    fn capabilities(&self) -> &RenderCapabilities {
        &self.caps
    }

    fn create_surface(&mut self, desc: SurfaceDesc) -> Result<SurfaceId, BackendError> {
        if !self.caps.supports(desc.format) {
            return Err(BackendError::UnsupportedFormat(desc.format.layout));
        }
        let bytes = surface_bytes(&desc);
        if let Some(limit) = self.memory_limit {
            if self.allocated + bytes > limit {
                return Err(BackendError::OutOfMemory { width: desc.width, height: desc.height });
            }
        }
        let texels = vec![Vec4::ZERO; (desc.width * desc.height) as usize];
        let id = SurfaceId(self.next_id());
        self.allocated += bytes;
        self.surfaces.insert(id, CpuSurface { desc, texels });
        Ok(id)
    }

    fn destroy_surface(&mut self, id: SurfaceId) {
        if let Some(surface) = self.surfaces.remove(&id) {
            self.allocated -= surface_bytes(&surface.desc);
        }
    }

    fn create_vertex_buffer(&mut self, vertices: &[[f32; 2]]) -> Result<VertexBufferId, BackendError> {
        let id = VertexBufferId(self.next_id());
        self.vertex_buffers.insert(id, vertices.to_vec());
        Ok(id)
    }

    fn destroy_vertex_buffer(&mut self, id: VertexBufferId) {
        self.vertex_buffers.remove(&id);
    }

    fn run(&mut self, pass: &Pass<'_>) -> Result<(), BackendError> {
        let reader = pass.reader();
        let inputs = reader
            .inputs(pass.target)?
            .into_iter()
            .map(|id| self.surface(id))
            .collect::<Result<Vec<_>, _>>()?;
        let polygon = self.polygon(pass)?;
        let target = self.surface(pass.target)?;
        let texels = execute(&reader, &inputs, target, polygon)?;

        if let Some(target) = self.surfaces.get_mut(&pass.target) {
            target.texels = texels;
        }
        Ok(())
    }

    fn clear(&mut self, surface: SurfaceId) -> Result<(), BackendError> {
        let target = self
            .surfaces
            .get_mut(&surface)
            .ok_or(BackendError::UnknownSurface(surface))?;
        target.texels.fill(Vec4::ZERO);
        Ok(())
    }

    fn read_pixels(&mut self, surface: SurfaceId) -> Result<Vec<[f32; 4]>, BackendError> {
        Ok(self.surface(surface)?.texels.iter().map(|t| t.to_array()).collect())
    }
}

// ============================================================================
// KERNELS
// ============================================================================

fn execute(
    reader: &UniformReader<'_>,
    inputs: &[&CpuSurface],
    target: &CpuSurface,
    polygon: Option<&[[f32; 2]]>,
) -> Result<Vec<Vec4>, BackendError> {
    let (w, h) = (target.desc.width, target.desc.height);
    let kernel = build_kernel(reader, inputs, polygon)?;

    let mut out = Vec::with_capacity((w * h) as usize);
    for y in 0..h {
        for x in 0..w {
            let uv = Vec2::new((x as f32 + 0.5) / w as f32, (y as f32 + 0.5) / h as f32);
            let current = target.texels[(y * w + x) as usize];
            out.push(kernel(uv, current));
        }
    }
    Ok(out)
}

type Kernel<'a> = Box<dyn Fn(Vec2, Vec4) -> Vec4 + 'a>;

fn build_kernel<'a>(
    reader: &UniformReader<'_>,
    inputs: &[&'a CpuSurface],
    polygon: Option<&'a [[f32; 2]]>,
) -> Result<Kernel<'a>, BackendError> {
    let inside = move |uv: Vec2| -> f32 {
        let clip = uv * 2.0 - 1.0;
        match polygon {
            Some(vertices) if polygon_contains(vertices, clip.to_array()) => 1.0,
            _ => 0.0,
        }
    };

    let kernel: Kernel<'a> = match reader.program {
        Program::Copy => {
            let tex = inputs[0];
            Box::new(move |uv: Vec2, _: Vec4| tex.sample(uv))
        }
        Program::Clear => {
            let tex = inputs[0];
            let value = reader.float("value")?;
            Box::new(move |uv: Vec2, _: Vec4| tex.sample(uv) * value)
        }
        Program::Splat => {
            let base = inputs[0];
            let point = Vec2::from(reader.vec2("point")?);
            let aspect = reader.float("aspectRatio")?;
            let radius = reader.float("radius")?;
            let force = reader.float("force")?;
            let color = Vec4::from(reader.color("color")?).xyz();
            Box::new(move |uv: Vec2, _: Vec4| {
                let mut p = uv - point;
                p.x *= aspect;
                let splat = (-p.dot(p) / radius).exp() * color * force;
                (base.sample(uv).xyz() + splat).extend(1.0)
            })
        }
        Program::Curl => {
            let vel = inputs[0];
            let ts = Vec2::from(reader.vec2("texelSize")?);
            Box::new(move |uv: Vec2, _: Vec4| {
                let l = vel.sample(uv - Vec2::new(ts.x, 0.0)).y;
                let r = vel.sample(uv + Vec2::new(ts.x, 0.0)).y;
                let t = vel.sample(uv + Vec2::new(0.0, ts.y)).x;
                let b = vel.sample(uv - Vec2::new(0.0, ts.y)).x;
                Vec4::new(0.5 * (r - l - t + b), 0.0, 0.0, 1.0)
            })
        }
        Program::Vorticity => {
            let (vel, curl_grid) = (inputs[0], inputs[1]);
            let ts = Vec2::from(reader.vec2("texelSize")?);
            let curl = reader.float("curl")?;
            let dt = reader.float("dt")?;
            Box::new(move |uv: Vec2, _: Vec4| {
                let l = curl_grid.sample(uv - Vec2::new(ts.x, 0.0)).x;
                let r = curl_grid.sample(uv + Vec2::new(ts.x, 0.0)).x;
                let t = curl_grid.sample(uv + Vec2::new(0.0, ts.y)).x;
                let b = curl_grid.sample(uv - Vec2::new(0.0, ts.y)).x;
                let c = curl_grid.sample(uv).x;

                let mut force = 0.5 * Vec2::new(t.abs() - b.abs(), r.abs() - l.abs());
                force /= force.length() + 0.0001;
                force *= curl * c;
                force.y = -force.y;

                let v = vel.sample(uv).xy() + force * dt;
                v.clamp(Vec2::splat(-VELOCITY_LIMIT), Vec2::splat(VELOCITY_LIMIT))
                    .extend(0.0)
                    .extend(1.0)
            })
        }
        Program::Divergence => {
            let (vel, solids) = (inputs[0], inputs[1]);
            let ts = Vec2::from(reader.vec2("texelSize")?);
            Box::new(move |uv: Vec2, _: Vec4| {
                let (ul, ur) = (uv - Vec2::new(ts.x, 0.0), uv + Vec2::new(ts.x, 0.0));
                let (ut, ub) = (uv + Vec2::new(0.0, ts.y), uv - Vec2::new(0.0, ts.y));
                let c = vel.sample(uv).xy();

                let mut l = vel.sample(ul).x * (1.0 - solids.sample(ul).x);
                let mut r = vel.sample(ur).x * (1.0 - solids.sample(ur).x);
                let mut t = vel.sample(ut).y * (1.0 - solids.sample(ut).x);
                let mut b = vel.sample(ub).y * (1.0 - solids.sample(ub).x);
                if ul.x < 0.0 {
                    l = -c.x;
                }
                if ur.x > 1.0 {
                    r = -c.x;
                }
                if ut.y > 1.0 {
                    t = -c.y;
                }
                if ub.y < 0.0 {
                    b = -c.y;
                }
                Vec4::new(0.5 * (r - l + t - b), 0.0, 0.0, 1.0)
            })
        }
        Program::Pressure => {
            let (pressure, divergence, solids) = (inputs[0], inputs[1], inputs[2]);
            let ts = Vec2::from(reader.vec2("texelSize")?);
            Box::new(move |uv: Vec2, _: Vec4| {
                let c = pressure.sample(uv).x;
                let neighbour = |p: Vec2| {
                    let s = solids.sample(p).x;
                    pressure.sample(p).x * (1.0 - s) + c * s
                };
                let l = neighbour(uv - Vec2::new(ts.x, 0.0));
                let r = neighbour(uv + Vec2::new(ts.x, 0.0));
                let t = neighbour(uv + Vec2::new(0.0, ts.y));
                let b = neighbour(uv - Vec2::new(0.0, ts.y));
                let div = divergence.sample(uv).x;
                Vec4::new((l + r + b + t - div) * 0.25, 0.0, 0.0, 1.0)
            })
        }
        Program::GradientSubtract => {
            let (pressure, vel, solids) = (inputs[0], inputs[1], inputs[2]);
            let ts = Vec2::from(reader.vec2("texelSize")?);
            Box::new(move |uv: Vec2, _: Vec4| {
                let c = pressure.sample(uv).x;
                let neighbour = |p: Vec2| {
                    let s = solids.sample(p).x;
                    pressure.sample(p).x * (1.0 - s) + c * s
                };
                let l = neighbour(uv - Vec2::new(ts.x, 0.0));
                let r = neighbour(uv + Vec2::new(ts.x, 0.0));
                let t = neighbour(uv + Vec2::new(0.0, ts.y));
                let b = neighbour(uv - Vec2::new(0.0, ts.y));
                let v = (vel.sample(uv).xy() - 0.5 * Vec2::new(r - l, t - b)) * (1.0 - solids.sample(uv).x);
                v.extend(0.0).extend(1.0)
            })
        }
        Program::Advection => {
            let (vel, source, solids) = (inputs[0], inputs[1], inputs[2]);
            let ts = Vec2::from(reader.vec2("texelSize")?);
            let dt = reader.float("dt")?;
            let dissipation = reader.float("dissipation")?;
            let manual = reader.flag("manualFiltering")?;
            let masked = reader.flag("solidMask")?;
            let dye_ts = if manual { Vec2::from(reader.vec2("dyeTexelSize")?) } else { Vec2::ZERO };
            Box::new(move |uv: Vec2, _: Vec4| {
                let result = if manual {
                    let coord = uv - dt * vel.bilerp(uv, ts).xy() * ts;
                    source.bilerp(coord, dye_ts)
                } else {
                    let coord = uv - dt * vel.sample(uv).xy() * ts;
                    source.sample(coord)
                };
                let mask = if masked { 1.0 - solids.sample(uv).x } else { 1.0 };
                (dissipation * mask * result).xyz().extend(1.0)
            })
        }
        Program::ConstructSolid => Box::new(move |uv: Vec2, current: Vec4| {
            if inside(uv) > 0.0 {
                Vec4::new(1.0, 0.0, 0.0, 1.0)
            } else {
                current
            }
        }),
        Program::PaintPolygon => {
            let source = inputs[0];
            let color = Vec4::from(reader.color("color")?);
            let paint: Vec3 = color.xyz() * color.w;
            Box::new(move |uv: Vec2, _: Vec4| {
                let base = source.sample(uv);
                (base.xyz() + inside(uv) * paint).extend(base.w)
            })
        }
    };
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{Pass, Uniforms};

    fn desc(width: u32, height: u32, filter: FilterMode) -> SurfaceDesc {
        SurfaceDesc {
            width,
            height,
            format: SurfaceFormat::new(ChannelLayout::Rgba, Precision::Full),
            filter,
        }
    }

    #[test]
    fn test_memory_limit_rejects_allocation() {
        let mut backend = CpuBackend::new().with_memory_limit(4 * 4 * 16);
        backend.create_surface(desc(4, 4, FilterMode::Nearest)).unwrap();
        let err = backend.create_surface(desc(4, 4, FilterMode::Nearest)).unwrap_err();
        assert!(matches!(err, BackendError::OutOfMemory { width: 4, height: 4 }));
    }

    #[test]
    fn test_destroy_returns_memory() {
        let mut backend = CpuBackend::new();
        let id = backend.create_surface(desc(8, 8, FilterMode::Nearest)).unwrap();
        assert_eq!(backend.allocated_bytes(), 8 * 8 * 16);
        backend.destroy_surface(id);
        backend.destroy_surface(id);
        assert_eq!(backend.allocated_bytes(), 0);
    }

    #[test]
    fn test_copy_upsamples_with_linear_filter() {
        let mut backend = CpuBackend::new();
        let src = backend.create_surface(desc(2, 1, FilterMode::Linear)).unwrap();
        let dst = backend.create_surface(desc(4, 1, FilterMode::Linear)).unwrap();
        backend.surfaces.get_mut(&src).unwrap().texels = vec![Vec4::ZERO, Vec4::splat(1.0)];

        let uniforms = Uniforms::new().surface("uTexture", src);
        backend.run(&Pass::full_screen(Program::Copy, &uniforms, dst)).unwrap();
        let out = backend.read_pixels(dst).unwrap();
        assert_eq!(out[0][0], 0.0);
        assert!((out[1][0] - 0.25).abs() < 1e-6, "got {}", out[1][0]);
        assert!((out[2][0] - 0.75).abs() < 1e-6, "got {}", out[2][0]);
        assert_eq!(out[3][0], 1.0);
    }

    #[test]
    fn test_missing_uniform_is_reported() {
        let mut backend = CpuBackend::new();
        let src = backend.create_surface(desc(2, 2, FilterMode::Nearest)).unwrap();
        let dst = backend.create_surface(desc(2, 2, FilterMode::Nearest)).unwrap();
        let uniforms = Uniforms::new().surface("uTexture", src);
        let err = backend.run(&Pass::full_screen(Program::Clear, &uniforms, dst)).unwrap_err();
        assert!(matches!(err, BackendError::MissingUniform { name: "value", .. }));
    }

    #[test]
    fn test_construct_solid_fills_polygon_only() {
        let mut backend = CpuBackend::new();
        let solids = backend.create_surface(desc(4, 4, FilterMode::Nearest)).unwrap();
        // Left half of clip space.
        let quad = backend
            .create_vertex_buffer(&[[-1.0, -1.0], [0.0, -1.0], [0.0, 1.0], [-1.0, 1.0]])
            .unwrap();
        let uniforms = Uniforms::new();
        backend
            .run(&Pass::polygon(Program::ConstructSolid, &uniforms, solids, quad))
            .unwrap();
        let out = backend.read_pixels(solids).unwrap();
        for y in 0..4 {
            for x in 0..4 {
                let expected = if x < 2 { 1.0 } else { 0.0 };
                assert_eq!(out[y * 4 + x][0], expected, "texel ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_polygon_program_rejects_full_screen() {
        let mut backend = CpuBackend::new();
        let solids = backend.create_surface(desc(2, 2, FilterMode::Nearest)).unwrap();
        let uniforms = Uniforms::new();
        let err = backend
            .run(&Pass::full_screen(Program::ConstructSolid, &uniforms, solids))
            .unwrap_err();
        assert!(matches!(err, BackendError::GeometryRequired(Program::ConstructSolid)));
    }
}
