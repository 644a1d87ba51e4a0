use glam::{Mat3, Vec2};

use crate::physics::{ActorId, BodyDesc, BodyHandle, BodyTag, Material, PhysicsError, PhysicsWorld, Shape};
use crate::settings::SimulationSettings;
use crate::splat::Color;

const RIBBON_HALF_RATIO: f32 = 0.1;
const PAPER: [u8; 4] = [255, 0, 0, 255];
const RIBBON: [u8; 4] = [255, 255, 0, 255];

/// RGBA8 image, row 0 at the bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentTexture {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl PresentTexture {
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [self.pixels[i], self.pixels[i + 1], self.pixels[i + 2], self.pixels[i + 3]]
    }
}

/// Red wrapping paper with a yellow ribbon cross.
pub fn present_texture(width: u32, height: u32) -> PresentTexture {
    let (width, height) = (width.max(1), height.max(1));
    let in_band = |i: u32, n: u32| {
        let i = i as f32;
        let n = n as f32;
        i >= n * (0.5 - RIBBON_HALF_RATIO) && i < n * (0.5 + RIBBON_HALF_RATIO)
    };

    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let texel = if in_band(x, width) || in_band(y, height) { RIBBON } else { PAPER };
            pixels.extend_from_slice(&texel);
        }
    }
    PresentTexture { width, height, pixels }
}

/// A present floating on the fluid. Pose lives in the physics world only.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    pub id: ActorId,
    pub size: Vec2,
    pub body: BodyHandle,
    pub color: Color,
    pub texture: PresentTexture,
}

impl Actor {
    pub fn spawn<W: PhysicsWorld + ?Sized>(
        physics: &mut W,
        settings: &SimulationSettings,
        id: ActorId,
        size: Vec2,
        position: Vec2,
        color: Color,
    ) -> Result<Self, PhysicsError> {
        let desc = BodyDesc::dynamic(position, 0.0)
            .with_damping(settings.actor_linear_damping, settings.actor_angular_damping);
        let body = physics.create_body(&desc);
        let material = Material { density: settings.actor_density, ..Material::default() };
        let shape = Shape::Box { half_extents: size * 0.5 };
        if let Err(err) = physics.create_fixture(body, &shape, material, BodyTag::Deliverable(id)) {
            physics.destroy_body(body);
            return Err(err);
        }
        let texture = present_texture(size.x.round() as u32, size.y.round() as u32);
        Ok(Self { id, size, body, color, texture })
    }

    pub fn pose<W: PhysicsWorld + ?Sized>(&self, physics: &W) -> Option<(Vec2, f32)> {
        Some((physics.position(self.body)?, physics.angle(self.body)?))
    }

    /// Maps the unit quad [-1, 1]^2 onto the actor's footprint in clip space.
    pub fn render_transform<W: PhysicsWorld + ?Sized>(&self, physics: &W, map_size: Vec2) -> Option<Mat3> {
        let (position, angle) = self.pose(physics)?;
        Some(render_transform(position, angle, self.size, map_size))
    }
}

pub fn render_transform(position: Vec2, angle: f32, size: Vec2, map_size: Vec2) -> Mat3 {
    let aspect = map_size.x / map_size.y;
    let clip = position / map_size * 2.0 - 1.0;
    let projection = Mat3::from_scale(Vec2::new(1.0, aspect));
    projection
        * Mat3::from_translation(clip * Vec2::new(1.0, 1.0 / aspect))
        * Mat3::from_angle(angle)
        * Mat3::from_scale(size / map_size.x)
}
