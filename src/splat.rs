//! Velocity and dye injection.

use glam::Vec2;
use rand::Rng;

use crate::grid::FluidGrids;
use crate::level::Flow;
use crate::render::{BackendError, Pass, Program, RenderBackend, Uniforms};
use crate::settings::SimulationSettings;

pub type Color = [f32; 3];

/// Widens a radius on landscape viewports so splats stay round on screen.
pub fn correct_radius(radius: f32, aspect: f32) -> f32 {
    if aspect > 1.0 {
        radius * aspect
    } else {
        radius
    }
}

pub fn correct_delta_x(delta: f32, aspect: f32) -> f32 {
    if aspect < 1.0 {
        delta * aspect
    } else {
        delta
    }
}

pub fn correct_delta_y(delta: f32, aspect: f32) -> f32 {
    if aspect > 1.0 {
        delta / aspect
    } else {
        delta
    }
}

/// Radius used by pointer and random splats.
pub fn default_radius(settings: &SimulationSettings, aspect: f32) -> f32 {
    correct_radius(settings.splat_radius / 100.0, aspect)
}

/// Adds a gaussian velocity impulse `delta * force` and a dye impulse `color` centred on
/// `point` (grid uv). `radius` is used as given; pass it through [`correct_radius`] first.
#[allow(clippy::too_many_arguments)]
pub fn splat<B: RenderBackend + ?Sized>(
    backend: &mut B,
    grids: &mut FluidGrids,
    aspect: f32,
    point: [f32; 2],
    delta: [f32; 2],
    color: Color,
    radius: f32,
    force: f32,
) -> Result<(), BackendError> {
    let uniforms = Uniforms::new()
        .surface("uTarget", grids.velocity.read().surface)
        .float("aspectRatio", aspect)
        .vec2("point", point)
        .vec3("color", [delta[0], delta[1], 0.0])
        .float("radius", radius)
        .float("force", force);
    backend.run(&Pass::full_screen(Program::Splat, &uniforms, grids.velocity.write().surface))?;
    grids.velocity.swap();

    let uniforms = uniforms
        .surface("uTarget", grids.dye.read().surface)
        .vec3("color", color);
    backend.run(&Pass::full_screen(Program::Splat, &uniforms, grids.dye.write().surface))?;
    grids.dye.swap();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pointer {
    pub texcoord: [f32; 2],
    pub prev_texcoord: [f32; 2],
    pub delta: [f32; 2],
    pub down: bool,
    pub moved: bool,
    pub color: Color,
}

impl Default for Pointer {
    fn default() -> Self {
        Self {
            texcoord: [0.0; 2],
            prev_texcoord: [0.0; 2],
            delta: [0.0; 2],
            down: false,
            moved: false,
            color: [0.03, 0.0, 0.045],
        }
    }
}

impl Pointer {
    pub fn press(&mut self, texcoord: [f32; 2], color: Color) {
        self.down = true;
        self.moved = false;
        self.texcoord = texcoord;
        self.prev_texcoord = texcoord;
        self.delta = [0.0; 2];
        self.color = color;
    }

    pub fn move_to(&mut self, texcoord: [f32; 2], aspect: f32) {
        self.prev_texcoord = self.texcoord;
        self.texcoord = texcoord;
        self.delta = [
            correct_delta_x(texcoord[0] - self.prev_texcoord[0], aspect),
            correct_delta_y(texcoord[1] - self.prev_texcoord[1], aspect),
        ];
        self.moved = self.delta[0].abs() > 0.0 || self.delta[1].abs() > 0.0;
    }

    pub fn release(&mut self) {
        self.down = false;
    }
}

/// Splats the pointer's last movement, scaled by `splat_force`.
pub fn splat_pointer<B: RenderBackend + ?Sized>(
    backend: &mut B,
    grids: &mut FluidGrids,
    settings: &SimulationSettings,
    aspect: f32,
    pointer: &Pointer,
) -> Result<(), BackendError> {
    let delta = [pointer.delta[0] * settings.splat_force, pointer.delta[1] * settings.splat_force];
    let radius = default_radius(settings, aspect);
    splat(backend, grids, aspect, pointer.texcoord, delta, pointer.color, radius, 1.0)
}

/// Bursts of bright splats at random positions.
pub fn random_splats<B: RenderBackend + ?Sized, R: Rng>(
    backend: &mut B,
    grids: &mut FluidGrids,
    settings: &SimulationSettings,
    aspect: f32,
    count: usize,
    rng: &mut R,
) -> Result<(), BackendError> {
    let radius = default_radius(settings, aspect);
    for _ in 0..count {
        let color = generate_color(rng).map(|c| c * 10.0);
        let point = [rng.gen::<f32>(), rng.gen::<f32>()];
        let delta = [1000.0 * (rng.gen::<f32>() - 0.5), 1000.0 * (rng.gen::<f32>() - 0.5)];
        splat(backend, grids, aspect, point, delta, color, radius, 1.0)?;
    }
    Ok(())
}

/// One splat per level flow at its begin point, pushing along `end - begin` (map units).
#[allow(clippy::too_many_arguments)]
pub fn apply_flows<B: RenderBackend + ?Sized>(
    backend: &mut B,
    grids: &mut FluidGrids,
    settings: &SimulationSettings,
    aspect: f32,
    map_size: Vec2,
    flows: &[Flow],
    dt: f32,
) -> Result<(), BackendError> {
    let radius = default_radius(settings, aspect);
    for flow in flows {
        let point = (Vec2::from(flow.begin) / map_size).to_array();
        let delta = flow.direction().to_array();
        splat(backend, grids, aspect, point, delta, flow.color, radius * flow.radius, flow.force * dt)?;
    }
    Ok(())
}

/// Fully saturated random hue at full brightness.
pub fn vivid_color<R: Rng>(rng: &mut R) -> Color {
    hsv_to_rgb(rng.gen::<f32>(), 1.0, 1.0)
}

/// Fully saturated random hue, dimmed so repeated splats do not blow out the dye.
pub fn generate_color<R: Rng>(rng: &mut R) -> Color {
    hsv_to_rgb(rng.gen::<f32>(), 1.0, 1.0).map(|c| c * 0.15)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Color {
    let i = (h * 6.0).floor();
    let f = h * 6.0 - i;
    let p = v * (1.0 - s);
    let q = v * (1.0 - f * s);
    let t = v * (1.0 - (1.0 - f) * s);
    match (i as i32).rem_euclid(6) {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::cpu::CpuBackend;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn grids(backend: &mut CpuBackend, viewport: (u32, u32)) -> FluidGrids {
        let settings = SimulationSettings {
            sim_resolution: 32,
            dye_resolution: 32,
            bloom: false,
            sunrays: false,
            ..Default::default()
        };
        FluidGrids::init(backend, &settings, viewport).unwrap()
    }

    fn speed(p: [f32; 4]) -> f32 {
        (p[0] * p[0] + p[1] * p[1]).sqrt()
    }

    #[test]
    fn test_correct_radius_only_widens_landscape() {
        assert_eq!(correct_radius(0.005, 2.0), 0.01);
        assert_eq!(correct_radius(0.005, 0.5), 0.005);
    }

    #[test]
    fn test_splat_footprint_is_round_on_wide_grid() {
        let mut backend = CpuBackend::new();
        let mut grids = grids(&mut backend, (64, 32));
        assert_eq!(grids.velocity.read().size(), (64, 32));

        let aspect = 2.0;
        let radius = correct_radius(0.005, aspect);
        let center = [32.5 / 64.0, 16.5 / 32.0];
        splat(&mut backend, &mut grids, aspect, center, [100.0, 0.0], [1.0, 1.0, 1.0], radius, 1.0).unwrap();

        let velocity = backend.read_pixels(grids.velocity.read().surface).unwrap();
        let at = |x: usize, y: usize| speed(velocity[y * 64 + x]);
        let peak = at(32, 16);
        assert!((peak - 100.0).abs() < 1e-3, "peak {peak}");

        for d in 1..6 {
            let horizontal = at(32 + d, 16);
            let vertical = at(32, 16 + d);
            assert!(
                (horizontal - vertical).abs() <= 1e-3 * peak,
                "offset {d}: horizontal {horizontal}, vertical {vertical}"
            );
        }
        // Equal uv offsets: six cells sideways against three cells up.
        let sideways = at(38, 16);
        let up = at(32, 19);
        assert!(up > 5.0 * sideways, "up {up}, sideways {sideways}");
    }

    #[test]
    fn test_splat_writes_dye_and_swaps_both_grids() {
        let mut backend = CpuBackend::new();
        let mut grids = grids(&mut backend, (32, 32));
        let (velocity_read, dye_read) = (grids.velocity.read().surface, grids.dye.read().surface);

        splat(&mut backend, &mut grids, 1.0, [0.5, 0.5], [0.0, 0.0], [0.0, 0.5, 0.0], 0.01, 1.0).unwrap();
        assert_eq!(grids.velocity.write().surface, velocity_read);
        assert_eq!(grids.dye.write().surface, dye_read);

        let dye = backend.read_pixels(grids.dye.read().surface).unwrap();
        let green = dye.iter().map(|p| p[1]).fold(0.0_f32, f32::max);
        assert!((green - 0.5).abs() < 0.05, "green {green}");
    }

    #[test]
    fn test_pointer_delta_is_aspect_corrected() {
        let mut pointer = Pointer::default();
        pointer.press([0.5, 0.5], [1.0, 0.0, 0.0]);
        pointer.move_to([0.6, 0.7], 2.0);
        assert!((pointer.delta[0] - 0.1).abs() < 1e-6);
        assert!((pointer.delta[1] - 0.1).abs() < 1e-6);
        assert!(pointer.moved);
    }

    #[test]
    fn test_random_splats_add_energy() {
        let mut backend = CpuBackend::new();
        let mut grids = grids(&mut backend, (32, 32));
        let mut rng = StdRng::seed_from_u64(7);
        random_splats(&mut backend, &mut grids, &SimulationSettings::default(), 1.0, 5, &mut rng).unwrap();
        let velocity = backend.read_pixels(grids.velocity.read().surface).unwrap();
        assert!(velocity.iter().any(|p| speed(*p) > 1.0));
    }

    #[test]
    fn test_flow_pushes_along_its_direction() {
        let mut backend = CpuBackend::new();
        let mut grids = grids(&mut backend, (32, 32));
        let flow = Flow { begin: [80.0, 160.0], end: [180.0, 160.0], force: 20.0, color: [0.0, 0.0, 1.0], radius: 1.0 };
        let settings = SimulationSettings::default();
        apply_flows(&mut backend, &mut grids, &settings, 1.0, Vec2::splat(320.0), &[flow], 1.0 / 60.0).unwrap();

        let velocity = backend.read_pixels(grids.velocity.read().surface).unwrap();
        // begin (80, 160) is cell (8, 16) on a 32x32 grid over 320 map units.
        let at_source = velocity[16 * 32 + 8];
        assert!(at_source[0] > 10.0, "{at_source:?}");
        assert!(at_source[1].abs() < 1e-3);
        let dye = backend.read_pixels(grids.dye.read().surface).unwrap();
        assert!(dye[16 * 32 + 8][2] > 0.1);
        assert_eq!(dye[16 * 32 + 8][0], 0.0);
    }

    #[test]
    fn test_generate_color_is_dim_and_saturated() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..32 {
            let c = generate_color(&mut rng);
            let max = c.iter().cloned().fold(0.0_f32, f32::max);
            let min = c.iter().cloned().fold(1.0_f32, f32::min);
            assert!((max - 0.15).abs() < 1e-6);
            assert!(min.abs() < 1e-6);
        }
    }
}
