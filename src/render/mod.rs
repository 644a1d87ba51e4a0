//! Boundary between the simulation and whatever executes its grid programs.
//!
//! The simulation never touches pixels directly. It names a [`Program`], hands over a set of
//! named [`Uniforms`] and a target surface, and the backend runs the pass over every texel of
//! the target. Two backends exist: [`gpu::GpuBackend`] (wgpu compute) and [`cpu::CpuBackend`]
//! (software, used headless and in tests).

pub mod cpu;
pub mod gpu;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexBufferId(pub(crate) u32);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("program {program:?} is missing uniform `{name}`")]
    MissingUniform { program: Program, name: &'static str },
    #[error("uniform `{name}` has the wrong type for program {program:?}")]
    UniformType { program: Program, name: &'static str },
    #[error("unknown surface {0:?}")]
    UnknownSurface(SurfaceId),
    #[error("unknown vertex buffer {0:?}")]
    UnknownVertexBuffer(VertexBufferId),
    #[error("program {program:?} samples its own target {surface:?}")]
    ReadWriteHazard { program: Program, surface: SurfaceId },
    #[error("out of accelerator memory allocating {width}x{height} surface")]
    OutOfMemory { width: u32, height: u32 },
    #[error("no renderable format can hold {0:?}")]
    UnsupportedFormat(ChannelLayout),
    #[error("program {0:?} requires polygon geometry")]
    GeometryRequired(Program),
    #[error("device error: {0}")]
    Device(String),
}

// ============================================================================
// FORMATS & CAPABILITIES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelLayout {
    R,
    Rg,
    Rgba,
}

impl ChannelLayout {
    pub fn channels(self) -> u32 {
        match self {
            ChannelLayout::R => 1,
            ChannelLayout::Rg => 2,
            ChannelLayout::Rgba => 4,
        }
    }

    fn wider(self) -> Option<ChannelLayout> {
        match self {
            ChannelLayout::R => Some(ChannelLayout::Rg),
            ChannelLayout::Rg => Some(ChannelLayout::Rgba),
            ChannelLayout::Rgba => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    Half,
    Full,
}

impl Precision {
    pub fn bytes(self) -> u32 {
        match self {
            Precision::Half => 2,
            Precision::Full => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    pub layout: ChannelLayout,
    pub precision: Precision,
}

impl SurfaceFormat {
    pub const fn new(layout: ChannelLayout, precision: Precision) -> Self {
        Self { layout, precision }
    }

    pub fn bytes_per_texel(self) -> u64 {
        (self.layout.channels() * self.precision.bytes()) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// What the active backend can render into, computed once when the backend is created.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderCapabilities {
    /// Renderable floating-point formats.
    pub formats: Vec<SurfaceFormat>,
    /// Whether surfaces can be sampled with hardware bilinear filtering.
    pub linear_filtering: bool,
}

impl RenderCapabilities {
    pub fn supports(&self, format: SurfaceFormat) -> bool {
        self.formats.contains(&format)
    }

    /// Picks the format used for a grid of the requested channel layout.
    ///
    /// The requested layout is tried at full then half precision; if neither renders, the
    /// layout widens (R to RG to RGBA) and the search repeats.
    pub fn negotiate(&self, requested: ChannelLayout) -> Result<SurfaceFormat, BackendError> {
        let mut layout = Some(requested);
        while let Some(candidate) = layout {
            for precision in [Precision::Full, Precision::Half] {
                let format = SurfaceFormat::new(candidate, precision);
                if self.supports(format) {
                    return Ok(format);
                }
            }
            layout = candidate.wider();
        }
        Err(BackendError::UnsupportedFormat(requested))
    }

    /// Filter mode grids should be allocated with; falls back to nearest without linear support.
    pub fn filter(&self, wanted: FilterMode) -> FilterMode {
        match wanted {
            FilterMode::Linear if self.linear_filtering => FilterMode::Linear,
            _ => FilterMode::Nearest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceDesc {
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
    pub filter: FilterMode,
}

// ============================================================================
// PROGRAMS & UNIFORMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Program {
    Copy,
    Clear,
    Splat,
    Curl,
    Vorticity,
    Divergence,
    Pressure,
    GradientSubtract,
    Advection,
    ConstructSolid,
    PaintPolygon,
}

impl Program {
    /// Surfaces a program samples, in binding order. Both backends bind inputs in this order.
    pub fn inputs(self) -> &'static [&'static str] {
        match self {
            Program::Copy | Program::Clear => &["uTexture"],
            Program::Splat => &["uTarget"],
            Program::Curl => &["uVelocity"],
            Program::Vorticity => &["uVelocity", "uCurl"],
            Program::Divergence => &["uVelocity", "uSolids"],
            Program::Pressure => &["uPressure", "uDivergence", "uSolids"],
            Program::GradientSubtract => &["uPressure", "uVelocity", "uSolids"],
            Program::Advection => &["uVelocity", "uSource", "uSolids"],
            Program::ConstructSolid => &[],
            Program::PaintPolygon => &["uSource"],
        }
    }

    pub fn needs_polygon(self) -> bool {
        matches!(self, Program::ConstructSolid | Program::PaintPolygon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Flag(bool),
    Surface(SurfaceId),
}

/// Named uniform values for one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Uniforms {
    values: Vec<(&'static str, UniformValue)>,
}

impl Uniforms {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: &'static str, value: UniformValue) -> Self {
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
        self
    }

    pub fn float(self, name: &'static str, v: f32) -> Self {
        self.set(name, UniformValue::Float(v))
    }

    pub fn vec2(self, name: &'static str, v: [f32; 2]) -> Self {
        self.set(name, UniformValue::Vec2(v))
    }

    pub fn vec3(self, name: &'static str, v: [f32; 3]) -> Self {
        self.set(name, UniformValue::Vec3(v))
    }

    pub fn vec4(self, name: &'static str, v: [f32; 4]) -> Self {
        self.set(name, UniformValue::Vec4(v))
    }

    pub fn flag(self, name: &'static str, v: bool) -> Self {
        self.set(name, UniformValue::Flag(v))
    }

    pub fn surface(self, name: &'static str, id: SurfaceId) -> Self {
        self.set(name, UniformValue::Surface(id))
    }

    pub fn get(&self, name: &str) -> Option<UniformValue> {
        self.values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(&'static str, UniformValue)> {
        self.values.iter()
    }
}

/// Typed uniform lookups that report which program asked.
pub(crate) struct UniformReader<'a> {
    pub program: Program,
    pub uniforms: &'a Uniforms,
}

impl<'a> UniformReader<'a> {
    fn missing(&self, name: &'static str) -> BackendError {
        BackendError::MissingUniform { program: self.program, name }
    }

    fn wrong(&self, name: &'static str) -> BackendError {
        BackendError::UniformType { program: self.program, name }
    }

    pub fn float(&self, name: &'static str) -> Result<f32, BackendError> {
        match self.uniforms.get(name) {
            Some(UniformValue::Float(v)) => Ok(v),
            Some(_) => Err(self.wrong(name)),
            None => Err(self.missing(name)),
        }
    }

    pub fn vec2(&self, name: &'static str) -> Result<[f32; 2], BackendError> {
        match self.uniforms.get(name) {
            Some(UniformValue::Vec2(v)) => Ok(v),
            Some(_) => Err(self.wrong(name)),
            None => Err(self.missing(name)),
        }
    }

    /// Accepts vec3 or vec4 colours; a vec3 gets alpha 1.
    pub fn color(&self, name: &'static str) -> Result<[f32; 4], BackendError> {
        match self.uniforms.get(name) {
            Some(UniformValue::Vec3([r, g, b])) => Ok([r, g, b, 1.0]),
            Some(UniformValue::Vec4(v)) => Ok(v),
            Some(_) => Err(self.wrong(name)),
            None => Err(self.missing(name)),
        }
    }

    /// Optional flags default to false.
    pub fn flag(&self, name: &'static str) -> Result<bool, BackendError> {
        match self.uniforms.get(name) {
            Some(UniformValue::Flag(v)) => Ok(v),
            Some(_) => Err(self.wrong(name)),
            None => Ok(false),
        }
    }

    pub fn surface(&self, name: &'static str) -> Result<SurfaceId, BackendError> {
        match self.uniforms.get(name) {
            Some(UniformValue::Surface(id)) => Ok(id),
            Some(_) => Err(self.wrong(name)),
            None => Err(self.missing(name)),
        }
    }

    /// Resolves every sampled input of the program, rejecting any that alias the target.
    pub fn inputs(&self, target: SurfaceId) -> Result<Vec<SurfaceId>, BackendError> {
        self.program
            .inputs()
            .iter()
            .map(|name| {
                let id = self.surface(name)?;
                if id == target {
                    return Err(BackendError::ReadWriteHazard { program: self.program, surface: id });
                }
                Ok(id)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Geometry {
    FullScreen,
    /// Closed polygon outline in clip space ([-1, 1] on both axes).
    Polygon(VertexBufferId),
}

#[derive(Debug, Clone, Copy)]
pub struct Pass<'a> {
    pub program: Program,
    pub uniforms: &'a Uniforms,
    pub target: SurfaceId,
    pub geometry: Geometry,
}

impl<'a> Pass<'a> {
    pub fn full_screen(program: Program, uniforms: &'a Uniforms, target: SurfaceId) -> Self {
        Self { program, uniforms, target, geometry: Geometry::FullScreen }
    }

    pub fn polygon(program: Program, uniforms: &'a Uniforms, target: SurfaceId, vertices: VertexBufferId) -> Self {
        Self { program, uniforms, target, geometry: Geometry::Polygon(vertices) }
    }

    pub(crate) fn reader(&self) -> UniformReader<'a> {
        UniformReader { program: self.program, uniforms: self.uniforms }
    }
}

pub trait RenderBackend {
    fn capabilities(&self) -> &RenderCapabilities;

    fn create_surface(&mut self, desc: SurfaceDesc) -> Result<SurfaceId, BackendError>;

    /// Releasing an unknown surface is a no-op.
    fn destroy_surface(&mut self, id: SurfaceId);

    fn create_vertex_buffer(&mut self, vertices: &[[f32; 2]]) -> Result<VertexBufferId, BackendError>;

    fn destroy_vertex_buffer(&mut self, id: VertexBufferId);

    /// Runs one program over every texel of the pass target.
    fn run(&mut self, pass: &Pass<'_>) -> Result<(), BackendError>;

    /// Zeroes a surface.
    fn clear(&mut self, surface: SurfaceId) -> Result<(), BackendError>;

    /// Copies a surface back to the host, row-major with row 0 at the bottom.
    fn read_pixels(&mut self, surface: SurfaceId) -> Result<Vec<[f32; 4]>, BackendError>;
}

/// Even-odd point-in-polygon test.
pub(crate) fn polygon_contains(vertices: &[[f32; 2]], p: [f32; 2]) -> bool {
    let mut inside = false;
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (vertices[i], vertices[j]);
        if (a[1] > p[1]) != (b[1] > p[1]) {
            let t = (p[1] - a[1]) / (b[1] - a[1]);
            if p[0] < a[0] + t * (b[0] - a[0]) {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(formats: &[SurfaceFormat]) -> RenderCapabilities {
        RenderCapabilities { formats: formats.to_vec(), linear_filtering: false }
    }

    #[test]
    fn test_negotiate_prefers_exact_layout() {
        let caps = caps(&[
            SurfaceFormat::new(ChannelLayout::R, Precision::Half),
            SurfaceFormat::new(ChannelLayout::Rgba, Precision::Full),
        ]);
        let format = caps.negotiate(ChannelLayout::R).unwrap();
        assert_eq!(format, SurfaceFormat::new(ChannelLayout::R, Precision::Half));
    }

    #[test]
    fn test_negotiate_widens_when_layout_missing() {
        let caps = caps(&[SurfaceFormat::new(ChannelLayout::Rgba, Precision::Half)]);
        assert_eq!(caps.negotiate(ChannelLayout::R).unwrap().layout, ChannelLayout::Rgba);
        assert_eq!(caps.negotiate(ChannelLayout::Rg).unwrap().layout, ChannelLayout::Rgba);
    }

    #[test]
    fn test_negotiate_fails_without_any_format() {
        let caps = caps(&[]);
        assert!(matches!(
            caps.negotiate(ChannelLayout::Rg),
            Err(BackendError::UnsupportedFormat(ChannelLayout::Rg))
        ));
    }

    #[test]
    fn test_filter_falls_back_to_nearest() {
        let caps = caps(&[]);
        assert_eq!(caps.filter(FilterMode::Linear), FilterMode::Nearest);
    }

    #[test]
    fn test_hazard_detected_when_input_is_target() {
        let uniforms = Uniforms::new().surface("uVelocity", SurfaceId(3));
        let pass = Pass::full_screen(Program::Curl, &uniforms, SurfaceId(3));
        assert!(matches!(
            pass.reader().inputs(pass.target),
            Err(BackendError::ReadWriteHazard { .. })
        ));
    }

    #[test]
    fn test_polygon_contains_square() {
        let square = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        assert!(polygon_contains(&square, [0.5, 0.5]));
        assert!(!polygon_contains(&square, [1.5, 0.5]));
    }
}
