//! Simulation grids and their lifetime.
//!
//! Every grid surface is created, resized and released through this module so allocation
//! always goes through format negotiation against the backend's capabilities.

use log::debug;

use crate::render::{
    BackendError, ChannelLayout, FilterMode, Pass, Program, RenderBackend, SurfaceDesc, SurfaceFormat,
    SurfaceId, Uniforms,
};
use crate::settings::SimulationSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub surface: SurfaceId,
    pub width: u32,
    pub height: u32,
    pub format: SurfaceFormat,
    pub filter: FilterMode,
}

impl Grid {
    pub fn texel_size(&self) -> [f32; 2] {
        [1.0 / self.width as f32, 1.0 / self.height as f32]
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// A read/write pair of equally sized grids. Passes read `read`, write `write`, then swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleGrid {
    read: Grid,
    write: Grid,
}

impl DoubleGrid {
    pub fn read(&self) -> &Grid {
        &self.read
    }

    pub fn write(&self) -> &Grid {
        &self.write
    }

    pub fn swap(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
    }

    pub fn width(&self) -> u32 {
        self.read.width
    }

    pub fn height(&self) -> u32 {
        self.read.height
    }

    pub fn texel_size(&self) -> [f32; 2] {
        self.read.texel_size()
    }
}

// ============================================================================
// ALLOCATION
// ============================================================================

pub fn allocate<B: RenderBackend + ?Sized>(
    backend: &mut B,
    width: u32,
    height: u32,
    layout: ChannelLayout,
    filter: FilterMode,
) -> Result<Grid, BackendError> {
    let caps = backend.capabilities();
    let format = caps.negotiate(layout)?;
    let filter = caps.filter(filter);
    let width = width.max(1);
    let height = height.max(1);
    let surface = backend.create_surface(SurfaceDesc { width, height, format, filter })?;
    debug!("allocated {width}x{height} {format:?} grid {surface:?}");
    Ok(Grid { surface, width, height, format, filter })
}

pub fn allocate_double<B: RenderBackend + ?Sized>(
    backend: &mut B,
    width: u32,
    height: u32,
    layout: ChannelLayout,
    filter: FilterMode,
) -> Result<DoubleGrid, BackendError> {
    let read = allocate(backend, width, height, layout, filter)?;
    let write = match allocate(backend, width, height, layout, filter) {
        Ok(grid) => grid,
        Err(err) => {
            backend.destroy_surface(read.surface);
            return Err(err);
        }
    };
    Ok(DoubleGrid { read, write })
}

fn reallocate<B: RenderBackend + ?Sized>(backend: &mut B, like: &Grid, width: u32, height: u32) -> Result<Grid, BackendError> {
    let surface = backend.create_surface(SurfaceDesc {
        width,
        height,
        format: like.format,
        filter: like.filter,
    })?;
    Ok(Grid { surface, width, height, format: like.format, filter: like.filter })
}

/// Resamples `grid` into a fresh surface of the new size and releases the old one.
///
/// `grid` is consumed either way: on error every surface it touched has been released.
pub fn resize<B: RenderBackend + ?Sized>(
    backend: &mut B,
    grid: Grid,
    width: u32,
    height: u32,
) -> Result<Grid, BackendError> {
    let (width, height) = (width.max(1), height.max(1));
    let resized = match reallocate(backend, &grid, width, height) {
        Ok(resized) => resized,
        Err(err) => {
            backend.destroy_surface(grid.surface);
            return Err(err);
        }
    };
    let uniforms = Uniforms::new().surface("uTexture", grid.surface);
    let copied = backend.run(&Pass::full_screen(Program::Copy, &uniforms, resized.surface));
    backend.destroy_surface(grid.surface);
    if let Err(err) = copied {
        backend.destroy_surface(resized.surface);
        return Err(err);
    }
    debug!("resized grid {:?} {}x{} -> {}x{}", resized.surface, grid.width, grid.height, width, height);
    Ok(resized)
}

/// Resizes the readable side (content preserved) and replaces the writable side. Consumes `grid`
/// on error as [`resize`] does.
pub fn resize_double<B: RenderBackend + ?Sized>(
    backend: &mut B,
    grid: DoubleGrid,
    width: u32,
    height: u32,
) -> Result<DoubleGrid, BackendError> {
    let (width, height) = (width.max(1), height.max(1));
    if grid.width() == width && grid.height() == height {
        return Ok(grid);
    }
    let read = match resize(backend, grid.read, width, height) {
        Ok(read) => read,
        Err(err) => {
            backend.destroy_surface(grid.write.surface);
            return Err(err);
        }
    };
    let write = reallocate(backend, &grid.write, width, height);
    backend.destroy_surface(grid.write.surface);
    match write {
        Ok(write) => Ok(DoubleGrid { read, write }),
        Err(err) => {
            backend.destroy_surface(read.surface);
            Err(err)
        }
    }
}

pub fn release<B: RenderBackend + ?Sized>(backend: &mut B, grid: Grid) {
    backend.destroy_surface(grid.surface);
}

pub fn release_double<B: RenderBackend + ?Sized>(backend: &mut B, grid: DoubleGrid) {
    backend.destroy_surface(grid.read.surface);
    backend.destroy_surface(grid.write.surface);
}

/// Grid dimensions for a viewport: the shorter axis gets `resolution` cells and the longer axis
/// is stretched by the viewport aspect ratio.
pub fn get_resolution(resolution: u32, viewport: (u32, u32)) -> (u32, u32) {
    let (w, h) = (viewport.0.max(1) as f32, viewport.1.max(1) as f32);
    let mut aspect = w / h;
    if aspect < 1.0 {
        aspect = 1.0 / aspect;
    }
    let min = resolution.max(1);
    let max = (resolution as f32 * aspect).round().max(1.0) as u32;
    if w > h {
        (max, min)
    } else {
        (min, max)
    }
}

// ============================================================================
// FLUID GRID SET
// ============================================================================

/// Display post-processing targets. Allocated and kept sized with the viewport; the solver never
/// reads them.
#[derive(Debug, Clone)]
pub struct BloomChain {
    pub target: Grid,
    /// Successively halved blur levels.
    pub levels: Vec<Grid>,
}

/// Display post-processing targets, like [`BloomChain`].
#[derive(Debug, Clone, Copy)]
pub struct SunraysGrids {
    pub rays: Grid,
    pub temp: Grid,
}

/// All grids one simulation instance works on.
#[derive(Debug, Clone)]
pub struct FluidGrids {
    pub velocity: DoubleGrid,
    pub dye: DoubleGrid,
    pub divergence: Grid,
    pub curl: Grid,
    pub pressure: DoubleGrid,
    pub solids: Grid,
    /// Present only with linear filtering and the setting enabled. Not part of the solver state.
    pub bloom: Option<BloomChain>,
    pub sunrays: Option<SunraysGrids>,
}

impl FluidGrids {
    pub fn init<B: RenderBackend + ?Sized>(
        backend: &mut B,
        settings: &SimulationSettings,
        viewport: (u32, u32),
    ) -> Result<Self, BackendError> {
        let (sim_w, sim_h) = get_resolution(settings.sim_resolution, viewport);
        let (dye_w, dye_h) = get_resolution(settings.dye_resolution, viewport);

        let velocity = allocate_double(backend, sim_w, sim_h, ChannelLayout::Rg, FilterMode::Linear)?;
        let dye = allocate_double(backend, dye_w, dye_h, ChannelLayout::Rgba, FilterMode::Linear)?;
        let mut grids = Self::with_scalars(backend, settings, viewport, velocity, dye)?;
        grids.clear_all(backend)?;
        Ok(grids)
    }

    fn with_scalars<B: RenderBackend + ?Sized>(
        backend: &mut B,
        settings: &SimulationSettings,
        viewport: (u32, u32),
        velocity: DoubleGrid,
        dye: DoubleGrid,
    ) -> Result<Self, BackendError> {
        let (w, h) = (velocity.width(), velocity.height());
        let divergence = allocate(backend, w, h, ChannelLayout::R, FilterMode::Nearest)?;
        let curl = allocate(backend, w, h, ChannelLayout::R, FilterMode::Nearest)?;
        let pressure = allocate_double(backend, w, h, ChannelLayout::R, FilterMode::Nearest)?;
        let solids = allocate(backend, w, h, ChannelLayout::R, FilterMode::Nearest)?;

        let linear = backend.capabilities().linear_filtering;
        let bloom = if settings.bloom && linear {
            Some(allocate_bloom(backend, settings, viewport)?)
        } else {
            None
        };
        let sunrays = if settings.sunrays && linear {
            let (sw, sh) = get_resolution(settings.sunrays_resolution, viewport);
            Some(SunraysGrids {
                rays: allocate(backend, sw, sh, ChannelLayout::R, FilterMode::Linear)?,
                temp: allocate(backend, sw, sh, ChannelLayout::R, FilterMode::Linear)?,
            })
        } else {
            None
        };

        Ok(Self { velocity, dye, divergence, curl, pressure, solids, bloom, sunrays })
    }

    /// Rebuilds the set for a new viewport or resolution.
    ///
    /// Velocity and dye are resampled; every other grid comes back zeroed, so the caller has to
    /// rasterize obstacles into `solids` again before the next step.
    pub fn reinit<B: RenderBackend + ?Sized>(
        self,
        backend: &mut B,
        settings: &SimulationSettings,
        viewport: (u32, u32),
    ) -> Result<Self, BackendError> {
        let (sim_w, sim_h) = get_resolution(settings.sim_resolution, viewport);
        let (dye_w, dye_h) = get_resolution(settings.dye_resolution, viewport);

        let Self { velocity, dye, divergence, curl, pressure, solids, bloom, sunrays } = self;
        release(backend, divergence);
        release(backend, curl);
        release_double(backend, pressure);
        release(backend, solids);
        release_aux(backend, bloom, sunrays);

        let velocity = match resize_double(backend, velocity, sim_w, sim_h) {
            Ok(velocity) => velocity,
            Err(err) => {
                release_double(backend, dye);
                return Err(err);
            }
        };
        let dye = match resize_double(backend, dye, dye_w, dye_h) {
            Ok(dye) => dye,
            Err(err) => {
                release_double(backend, velocity);
                return Err(err);
            }
        };
        let grids = Self::with_scalars(backend, settings, viewport, velocity, dye)?;
        for grid in [grids.divergence, grids.curl, *grids.pressure.read(), *grids.pressure.write(), grids.solids] {
            backend.clear(grid.surface)?;
        }
        debug!("reinitialized grids for viewport {viewport:?}: sim {sim_w}x{sim_h}, dye {dye_w}x{dye_h}");
        Ok(grids)
    }

    pub fn clear_all<B: RenderBackend + ?Sized>(&mut self, backend: &mut B) -> Result<(), BackendError> {
        for surface in self.surfaces() {
            backend.clear(surface)?;
        }
        Ok(())
    }

    pub fn release_all<B: RenderBackend + ?Sized>(self, backend: &mut B) {
        for surface in self.surfaces() {
            backend.destroy_surface(surface);
        }
    }

    fn surfaces(&self) -> Vec<SurfaceId> {
        let mut out = vec![
            self.velocity.read().surface,
            self.velocity.write().surface,
            self.dye.read().surface,
            self.dye.write().surface,
            self.divergence.surface,
            self.curl.surface,
            self.pressure.read().surface,
            self.pressure.write().surface,
            self.solids.surface,
        ];
        if let Some(bloom) = &self.bloom {
            out.push(bloom.target.surface);
            out.extend(bloom.levels.iter().map(|g| g.surface));
        }
        if let Some(sunrays) = &self.sunrays {
            out.push(sunrays.rays.surface);
            out.push(sunrays.temp.surface);
        }
        out
    }
}

fn allocate_bloom<B: RenderBackend + ?Sized>(
    backend: &mut B,
    settings: &SimulationSettings,
    viewport: (u32, u32),
) -> Result<BloomChain, BackendError> {
    let (w, h) = get_resolution(settings.bloom_resolution, viewport);
    let target = allocate(backend, w, h, ChannelLayout::Rgba, FilterMode::Linear)?;
    let mut levels = Vec::new();
    for i in 0..settings.bloom_iterations {
        let (lw, lh) = (w >> (i + 1), h >> (i + 1));
        if lw < 2 || lh < 2 {
            break;
        }
        levels.push(allocate(backend, lw, lh, ChannelLayout::Rgba, FilterMode::Linear)?);
    }
    Ok(BloomChain { target, levels })
}

fn release_aux<B: RenderBackend + ?Sized>(backend: &mut B, bloom: Option<BloomChain>, sunrays: Option<SunraysGrids>) {
    if let Some(bloom) = bloom {
        release(backend, bloom.target);
        for level in bloom.levels {
            release(backend, level);
        }
    }
    if let Some(sunrays) = sunrays {
        release(backend, sunrays.rays);
        release(backend, sunrays.temp);
    }
}
