//! Feeds the fluid velocity back into actor bodies.
//!
//! Velocity is read back once per frame into a [`VelocitySnapshot`]; every actor then samples
//! its four rotated corners and centre and turns them into a force and a torque.

use glam::Vec2;

use crate::actor::Actor;
use crate::grid::Grid;
use crate::physics::{PhysicsError, PhysicsWorld};
use crate::render::{BackendError, RenderBackend};
use crate::settings::SimulationSettings;

/// CPU copy of the velocity grid, in texels per second.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocitySnapshot {
    width: u32,
    height: u32,
    velocity: Vec<Vec2>,
    /// Grid cells per map unit, per axis.
    cells_per_unit: Vec2,
}

impl VelocitySnapshot {
    pub fn capture<B: RenderBackend + ?Sized>(
        backend: &mut B,
        velocity: &Grid,
        map_size: Vec2,
    ) -> Result<Self, BackendError> {
        let texels = backend.read_pixels(velocity.surface)?;
        Ok(Self::from_texels(velocity.width, velocity.height, &texels, map_size))
    }

    pub fn from_texels(width: u32, height: u32, texels: &[[f32; 4]], map_size: Vec2) -> Self {
        let velocity = texels.iter().map(|t| Vec2::new(t[0], t[1])).collect();
        Self {
            width,
            height,
            velocity,
            cells_per_unit: Vec2::new(width as f32, height as f32) / map_size,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Map units covered by one cell.
    pub fn cell_size(&self) -> Vec2 {
        1.0 / self.cells_per_unit
    }

    /// Nearest cell under a map position; positions off the grid use the edge cell.
    pub fn sample(&self, position: Vec2) -> Vec2 {
        let cell = (position * self.cells_per_unit).floor();
        let x = (cell.x.max(0.0) as u32).min(self.width.saturating_sub(1));
        let y = (cell.y.max(0.0) as u32).min(self.height.saturating_sub(1));
        self.velocity
            .get((y * self.width + x) as usize)
            .copied()
            .unwrap_or(Vec2::ZERO)
    }
}

/// The four rotated corners of an actor, then its centre.
pub fn sample_points(center: Vec2, size: Vec2, angle: f32) -> [Vec2; 5] {
    let rotation = Vec2::from_angle(angle);
    let half = size * 0.5;
    let corner = |sx: f32, sy: f32| center + rotation.rotate(Vec2::new(sx * half.x, sy * half.y));
    [corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0), center]
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coupling {
    pub translation: Vec2,
    pub angular: f32,
}

/// Splits corner velocities into a part along the centre-to-corner direction, which drives
/// rotation, and the remainder, which drives translation. The centre sample counts four times.
pub fn couple(center: Vec2, points: &[Vec2; 5], samples: &[Vec2; 5], epsilon: f32) -> Coupling {
    let mut out = Coupling::default();
    for (point, v) in points[..4].iter().zip(&samples[..4]) {
        let length = v.length();
        if length < epsilon {
            continue;
        }
        let Some(outward) = (*point - center).try_normalize() else {
            continue;
        };
        let s = (*v / length).dot(outward);
        out.translation += *v * (1.0 - s);
        out.angular += s * length;
    }
    out.translation += samples[4] * 4.0;
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActorCoupler {
    pub coupling_strength: f32,
    pub angular_strength: f32,
    pub epsilon: f32,
}

impl ActorCoupler {
    pub fn from_settings(settings: &SimulationSettings) -> Self {
        Self {
            coupling_strength: settings.coupling_strength,
            angular_strength: settings.angular_strength,
            epsilon: settings.sample_epsilon,
        }
    }

    /// Pushes one actor along the flow. Returns `None` when its body no longer exists.
    pub fn apply<W: PhysicsWorld + ?Sized>(
        &self,
        physics: &mut W,
        actor: &Actor,
        snapshot: &VelocitySnapshot,
        dt: f32,
    ) -> Result<Option<Coupling>, PhysicsError> {
        let Some((center, angle)) = actor.pose(physics) else {
            return Ok(None);
        };
        let points = sample_points(center, actor.size, angle);
        let samples = points.map(|p| snapshot.sample(p));
        let coupling = couple(center, &points, &samples, self.epsilon);

        // Texels per second to map units per second.
        let translation = coupling.translation * snapshot.cell_size();
        let angular = coupling.angular * snapshot.cell_size().x;

        if translation.is_finite() && translation != Vec2::ZERO {
            physics.apply_force(actor.body, translation * self.coupling_strength * dt, center)?;
        }
        if angular.is_finite() && angular != 0.0 {
            physics.apply_torque(actor.body, angular * self.angular_strength * dt)?;
        }
        Ok(Some(coupling))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::rapier::RapierWorld;
    use crate::physics::ActorId;
    use crate::render::cpu::CpuBackend;
    use crate::render::{ChannelLayout, FilterMode, Pass, Program, Uniforms};

    fn uniform(width: u32, height: u32, v: Vec2, map_size: Vec2) -> VelocitySnapshot {
        let texels = vec![[v.x, v.y, 0.0, 1.0]; (width * height) as usize];
        VelocitySnapshot::from_texels(width, height, &texels, map_size)
    }

    #[test]
    fn test_uniform_field_translates_without_rotation() {
        let map = Vec2::new(200.0, 100.0);
        let snapshot = uniform(20, 10, Vec2::new(3.0, -4.0), map);
        let center = Vec2::new(100.0, 50.0);
        let points = sample_points(center, Vec2::new(30.0, 20.0), 0.4);
        let samples = points.map(|p| snapshot.sample(p));

        let c = couple(center, &points, &samples, 1e-4);
        assert!(c.angular.abs() < 1e-4, "angular {}", c.angular);
        assert!((c.translation - Vec2::new(24.0, -32.0)).length() < 1e-4, "{:?}", c.translation);
    }

    #[test]
    fn test_outward_flow_rotates_without_translating_corners() {
        let center = Vec2::ZERO;
        let points = sample_points(center, Vec2::splat(2.0), 0.0);
        // Every corner sample points straight away from the centre.
        let mut samples = points.map(|p| p.normalize_or_zero() * 5.0);
        samples[4] = Vec2::ZERO;

        let c = couple(center, &points, &samples, 1e-4);
        assert!(c.translation.length() < 1e-4, "{:?}", c.translation);
        assert!((c.angular - 20.0).abs() < 1e-4, "angular {}", c.angular);
    }

    #[test]
    fn test_samples_below_epsilon_are_skipped() {
        let center = Vec2::new(5.0, 5.0);
        let points = sample_points(center, Vec2::splat(4.0), 0.0);
        let samples = [Vec2::splat(1e-6), Vec2::ZERO, Vec2::ZERO, Vec2::ZERO, Vec2::new(1.0, 0.0)];
        let c = couple(center, &points, &samples, 1e-4);
        assert_eq!(c.translation, Vec2::new(4.0, 0.0));
        assert_eq!(c.angular, 0.0);
    }

    #[test]
    fn test_sample_clamps_positions_off_the_grid() {
        let map = Vec2::new(100.0, 100.0);
        let texels: Vec<[f32; 4]> = (0..16).map(|i| [i as f32, 0.0, 0.0, 1.0]).collect();
        let snapshot = VelocitySnapshot::from_texels(4, 4, &texels, map);

        assert_eq!(snapshot.sample(Vec2::new(-50.0, -50.0)).x, 0.0);
        assert_eq!(snapshot.sample(Vec2::new(1e6, 1e6)).x, 15.0);
        assert_eq!(snapshot.sample(Vec2::new(99.9, 0.0)).x, 3.0);
        assert_eq!(snapshot.sample(Vec2::new(30.0, 60.0)).x, 9.0);
        assert!((snapshot.cell_size() - Vec2::splat(25.0)).length() < 1e-3);
    }

    #[test]
    fn test_capture_reads_the_velocity_grid() {
        let mut backend = CpuBackend::new();
        let blank = crate::grid::allocate(&mut backend, 8, 4, ChannelLayout::Rg, FilterMode::Linear).unwrap();
        let grid = crate::grid::allocate(&mut backend, 8, 4, ChannelLayout::Rg, FilterMode::Linear).unwrap();
        let uniforms = Uniforms::new()
            .surface("uTarget", blank.surface)
            .float("aspectRatio", 1.0)
            .vec2("point", [0.5, 0.5])
            .vec3("color", [10.0, 0.0, 0.0])
            .float("radius", 100.0)
            .float("force", 1.0);
        backend.run(&Pass::full_screen(Program::Splat, &uniforms, grid.surface)).unwrap();

        let snapshot = VelocitySnapshot::capture(&mut backend, &grid, Vec2::new(80.0, 40.0)).unwrap();
        assert_eq!(snapshot.size(), (8, 4));
        assert!(snapshot.sample(Vec2::new(40.0, 20.0)).x > 9.9);
    }

    #[test]
    fn test_coupler_pushes_actor_downstream() {
        let mut world = RapierWorld::new();
        let settings = SimulationSettings::default();
        let actor = Actor::spawn(
            &mut world,
            &settings,
            ActorId(1),
            Vec2::splat(40.0),
            Vec2::new(300.0, 200.0),
            [1.0, 0.0, 0.0],
        )
        .unwrap();
        let snapshot = uniform(64, 32, Vec2::new(20.0, 0.0), Vec2::new(640.0, 320.0));
        let coupler = ActorCoupler::from_settings(&settings);

        for _ in 0..30 {
            coupler.apply(&mut world, &actor, &snapshot, 1.0 / 60.0).unwrap();
            world.step(1.0 / 60.0);
        }
        let position = world.position(actor.body).unwrap();
        assert!(position.x > 305.0, "actor barely moved: {position:?}");
        assert!((position.y - 200.0).abs() < 1.0, "{position:?}");
    }

    #[test]
    fn test_coupler_skips_destroyed_bodies() {
        let mut world = RapierWorld::new();
        let settings = SimulationSettings::default();
        let actor = Actor::spawn(&mut world, &settings, ActorId(1), Vec2::splat(10.0), Vec2::ZERO, [0.0; 3]).unwrap();
        world.destroy_body(actor.body);
        let snapshot = uniform(4, 4, Vec2::X, Vec2::splat(40.0));
        let result = ActorCoupler::from_settings(&settings).apply(&mut world, &actor, &snapshot, 0.016);
        assert!(matches!(result, Ok(None)));
    }
}
