use crate::grid::FluidGrids;
use crate::render::{BackendError, Pass, Program, RenderBackend, RenderCapabilities, Uniforms};
use crate::settings::SimulationSettings;

/// Projection-method step over the fluid grids.
///
/// Stage order is fixed: curl, vorticity confinement, divergence, pressure relaxation,
/// gradient subtraction, advection. Each stage is exposed on its own so callers can observe
/// the field between stages.
#[derive(Debug, Clone, Copy)]
pub struct FluidSolver {
    manual_filtering: bool,
}

impl FluidSolver {
    pub fn new(caps: &RenderCapabilities) -> Self {
        Self { manual_filtering: !caps.linear_filtering }
    }

    pub fn manual_filtering(&self) -> bool {
        self.manual_filtering
    }

    pub fn step<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        grids: &mut FluidGrids,
        settings: &SimulationSettings,
        dt: f32,
    ) -> Result<(), BackendError> {
        self.curl(backend, grids)?;
        self.vorticity(backend, grids, settings.curl, dt)?;
        self.divergence(backend, grids)?;
        self.pressure(backend, grids, settings.pressure, settings.pressure_iterations)?;
        self.gradient_subtract(backend, grids)?;
        self.advect(backend, grids, settings, dt)
    }

    pub fn curl<B: RenderBackend + ?Sized>(&self, backend: &mut B, grids: &mut FluidGrids) -> Result<(), BackendError> {
        let uniforms = Uniforms::new()
            .surface("uVelocity", grids.velocity.read().surface)
            .vec2("texelSize", grids.velocity.texel_size());
        backend.run(&Pass::full_screen(Program::Curl, &uniforms, grids.curl.surface))
    }

    pub fn vorticity<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        grids: &mut FluidGrids,
        curl: f32,
        dt: f32,
    ) -> Result<(), BackendError> {
        let uniforms = Uniforms::new()
            .surface("uVelocity", grids.velocity.read().surface)
            .surface("uCurl", grids.curl.surface)
            .vec2("texelSize", grids.velocity.texel_size())
            .float("curl", curl)
            .float("dt", dt);
        backend.run(&Pass::full_screen(Program::Vorticity, &uniforms, grids.velocity.write().surface))?;
        grids.velocity.swap();
        Ok(())
    }

    pub fn divergence<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        grids: &mut FluidGrids,
    ) -> Result<(), BackendError> {
        let uniforms = Uniforms::new()
            .surface("uVelocity", grids.velocity.read().surface)
            .surface("uSolids", grids.solids.surface)
            .vec2("texelSize", grids.velocity.texel_size());
        backend.run(&Pass::full_screen(Program::Divergence, &uniforms, grids.divergence.surface))
    }

    /// Decays the previous pressure by `decay`, then runs `iterations` Jacobi passes.
    pub fn pressure<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        grids: &mut FluidGrids,
        decay: f32,
        iterations: u32,
    ) -> Result<(), BackendError> {
        let clear = Uniforms::new()
            .surface("uTexture", grids.pressure.read().surface)
            .float("value", decay);
        backend.run(&Pass::full_screen(Program::Clear, &clear, grids.pressure.write().surface))?;
        grids.pressure.swap();

        for _ in 0..iterations {
            let uniforms = Uniforms::new()
                .surface("uPressure", grids.pressure.read().surface)
                .surface("uDivergence", grids.divergence.surface)
                .surface("uSolids", grids.solids.surface)
                .vec2("texelSize", grids.velocity.texel_size());
            backend.run(&Pass::full_screen(Program::Pressure, &uniforms, grids.pressure.write().surface))?;
            grids.pressure.swap();
        }
        Ok(())
    }

    pub fn gradient_subtract<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        grids: &mut FluidGrids,
    ) -> Result<(), BackendError> {
        let uniforms = Uniforms::new()
            .surface("uPressure", grids.pressure.read().surface)
            .surface("uVelocity", grids.velocity.read().surface)
            .surface("uSolids", grids.solids.surface)
            .vec2("texelSize", grids.velocity.texel_size());
        backend.run(&Pass::full_screen(Program::GradientSubtract, &uniforms, grids.velocity.write().surface))?;
        grids.velocity.swap();
        Ok(())
    }

    /// Self-advects velocity (masked by solids), then advects dye through the new velocity.
    pub fn advect<B: RenderBackend + ?Sized>(
        &self,
        backend: &mut B,
        grids: &mut FluidGrids,
        settings: &SimulationSettings,
        dt: f32,
    ) -> Result<(), BackendError> {
        let velocity_texel = grids.velocity.texel_size();
        let uniforms = Uniforms::new()
            .surface("uVelocity", grids.velocity.read().surface)
            .surface("uSource", grids.velocity.read().surface)
            .surface("uSolids", grids.solids.surface)
            .vec2("texelSize", velocity_texel)
            .vec2("dyeTexelSize", velocity_texel)
            .float("dt", dt)
            .float("dissipation", settings.velocity_dissipation)
            .flag("manualFiltering", self.manual_filtering)
            .flag("solidMask", true);
        backend.run(&Pass::full_screen(Program::Advection, &uniforms, grids.velocity.write().surface))?;
        grids.velocity.swap();

        let uniforms = Uniforms::new()
            .surface("uVelocity", grids.velocity.read().surface)
            .surface("uSource", grids.dye.read().surface)
            .surface("uSolids", grids.solids.surface)
            .vec2("texelSize", velocity_texel)
            .vec2("dyeTexelSize", grids.dye.texel_size())
            .float("dt", dt)
            .float("dissipation", settings.density_dissipation)
            .flag("manualFiltering", self.manual_filtering)
            .flag("solidMask", false);
        backend.run(&Pass::full_screen(Program::Advection, &uniforms, grids.dye.write().surface))?;
        grids.dye.swap();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::DoubleGrid;
    use crate::render::cpu::CpuBackend;

    fn settings(resolution: u32) -> SimulationSettings {
        SimulationSettings {
            sim_resolution: resolution,
            dye_resolution: resolution * 2,
            bloom: false,
            sunrays: false,
            ..Default::default()
        }
    }

    fn splat_into(backend: &mut CpuBackend, grid: &mut DoubleGrid, point: [f32; 2], color: [f32; 3], radius: f32) {
        let uniforms = Uniforms::new()
            .surface("uTarget", grid.read().surface)
            .vec2("point", point)
            .float("aspectRatio", grid.width() as f32 / grid.height() as f32)
            .float("radius", radius)
            .float("force", 1.0)
            .vec3("color", color);
        backend
            .run(&Pass::full_screen(Program::Splat, &uniforms, grid.write().surface))
            .unwrap();
        grid.swap();
    }

    fn interior_divergence(backend: &mut CpuBackend, grids: &FluidGrids, margin: u32) -> f32 {
        let pixels = backend.read_pixels(grids.divergence.surface).unwrap();
        let (w, h) = grids.divergence.size();
        let mut total = 0.0;
        for y in margin..h - margin {
            for x in margin..w - margin {
                total += pixels[(y * w + x) as usize][0].abs();
            }
        }
        total
    }

    #[test]
    fn test_projection_removes_interior_divergence() {
        let mut backend = CpuBackend::new();
        let mut grids = FluidGrids::init(&mut backend, &settings(32), (32, 32)).unwrap();
        let solver = FluidSolver::new(backend.capabilities());

        splat_into(&mut backend, &mut grids.velocity, [0.5, 0.5], [100.0, 40.0, 0.0], 0.03);
        solver.divergence(&mut backend, &mut grids).unwrap();
        let before = interior_divergence(&mut backend, &grids, 6);
        assert!(before > 1.0, "splat should create divergence, got {before}");

        solver.pressure(&mut backend, &mut grids, 0.0, 1500).unwrap();
        solver.gradient_subtract(&mut backend, &mut grids).unwrap();
        solver.divergence(&mut backend, &mut grids).unwrap();
        let after = interior_divergence(&mut backend, &grids, 6);
        assert!(after < 0.05 * before, "divergence {before} -> {after}");
    }

    #[test]
    fn test_default_pressure_settings_converge_across_frames() {
        let settings = settings(32);
        let mut backend = CpuBackend::new();
        let mut grids = FluidGrids::init(&mut backend, &settings, (32, 32)).unwrap();
        let solver = FluidSolver::new(backend.capabilities());

        splat_into(&mut backend, &mut grids.velocity, [0.5, 0.5], [100.0, 40.0, 0.0], 0.03);
        solver.divergence(&mut backend, &mut grids).unwrap();
        let before = interior_divergence(&mut backend, &grids, 6);

        // Decayed pressure carries over from one frame to the next.
        for _ in 0..20 {
            solver.divergence(&mut backend, &mut grids).unwrap();
            solver
                .pressure(&mut backend, &mut grids, settings.pressure, settings.pressure_iterations)
                .unwrap();
            solver.gradient_subtract(&mut backend, &mut grids).unwrap();
        }
        solver.divergence(&mut backend, &mut grids).unwrap();
        let after = interior_divergence(&mut backend, &grids, 6);
        assert!(after < 0.05 * before, "divergence {before} -> {after}");
    }

    #[test]
    fn test_solid_cells_hold_no_velocity() {
        let mut backend = CpuBackend::new();
        let settings = settings(32);
        let mut grids = FluidGrids::init(&mut backend, &settings, (32, 32)).unwrap();
        let solver = FluidSolver::new(backend.capabilities());

        // Cells 14..18 on both axes.
        let e = 0.125;
        let square = backend
            .create_vertex_buffer(&[[-e, -e], [e, -e], [e, e], [-e, e]])
            .unwrap();
        let uniforms = Uniforms::new();
        backend
            .run(&Pass::polygon(Program::ConstructSolid, &uniforms, grids.solids.surface, square))
            .unwrap();

        for _ in 0..100 {
            splat_into(&mut backend, &mut grids.velocity, [0.3, 0.5], [400.0, 30.0, 0.0], 0.005);
            solver.step(&mut backend, &mut grids, &settings, 1.0 / 60.0).unwrap();
        }

        let velocity = backend.read_pixels(grids.velocity.read().surface).unwrap();
        for y in 14..18 {
            for x in 14..18 {
                let v = velocity[y * 32 + x];
                let speed = (v[0] * v[0] + v[1] * v[1]).sqrt();
                assert!(speed <= 1e-5, "cell ({x}, {y}) moves at {speed}");
            }
        }
        let upstream = velocity[16 * 32 + 10];
        assert!(upstream[0].abs() + upstream[1].abs() > 1e-2, "flow should reach the obstacle");
    }

    #[test]
    fn test_manual_filtering_matches_hardware_filtering() {
        let settings = settings(16);
        let mut linear = CpuBackend::new();
        let mut manual = CpuBackend::with_capabilities(RenderCapabilities {
            linear_filtering: false,
            ..linear.capabilities().clone()
        });

        let mut results = Vec::new();
        for backend in [&mut linear, &mut manual] {
            let mut grids = FluidGrids::init(backend, &settings, (32, 16)).unwrap();
            let solver = FluidSolver::new(backend.capabilities());
            splat_into(backend, &mut grids.velocity, [0.4, 0.5], [300.0, -120.0, 0.0], 0.01);
            splat_into(backend, &mut grids.dye, [0.4, 0.5], [1.0, 0.5, 0.25], 0.01);
            for _ in 0..5 {
                solver.step(backend, &mut grids, &settings, 1.0 / 60.0).unwrap();
            }
            results.push((
                solver.manual_filtering(),
                backend.read_pixels(grids.dye.read().surface).unwrap(),
            ));
        }

        assert!(!results[0].0 && results[1].0);
        let peak = results[0].1.iter().map(|p| p[0]).fold(0.0_f32, f32::max);
        assert!(peak > 0.1, "dye should survive advection, peak {peak}");
        for (a, b) in results[0].1.iter().zip(&results[1].1) {
            for c in 0..3 {
                assert!((a[c] - b[c]).abs() < 1e-3 * peak.max(1.0), "{a:?} vs {b:?}");
            }
        }
    }
}
