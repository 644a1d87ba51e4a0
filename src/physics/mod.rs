//! Rigid-body boundary. The game drives a [`PhysicsWorld`]; `rapier` provides the real one.

pub mod rapier;

use glam::Vec2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObstacleId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub u32);

/// Identity carried by every fixture so contacts can be told apart without lookups by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodyTag {
    Obstacle(ObstacleId),
    Deliverable(ActorId),
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BodyHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Static,
    Dynamic,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BodyDesc {
    pub kind: BodyKind,
    pub position: Vec2,
    pub angle: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    /// Continuous collision detection for fast movers.
    pub ccd: bool,
}

impl BodyDesc {
    pub fn fixed(position: Vec2) -> Self {
        Self {
            kind: BodyKind::Static,
            position,
            angle: 0.0,
            linear_damping: 0.0,
            angular_damping: 0.0,
            ccd: false,
        }
    }

    pub fn dynamic(position: Vec2, angle: f32) -> Self {
        Self { kind: BodyKind::Dynamic, angle, ccd: true, ..Self::fixed(position) }
    }

    pub fn with_damping(mut self, linear: f32, angular: f32) -> Self {
        self.linear_damping = linear;
        self.angular_damping = angular;
        self
    }
}

/// Fixture geometry in body-local coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Closed outline. Concave outlines are split into triangles so the fixture covers exactly
    /// the enclosed area.
    Polygon(Vec<Vec2>),
    Box { half_extents: Vec2 },
    Segment(Vec2, Vec2),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Material {
    pub density: f32,
    pub friction: f32,
    pub restitution: f32,
}

impl Default for Material {
    fn default() -> Self {
        Self { density: 1.0, friction: 0.2, restitution: 0.0 }
    }
}

/// Two fixtures started touching during the last step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContactEvent {
    pub a: BodyTag,
    pub b: BodyTag,
}

#[derive(Debug, Error)]
pub enum PhysicsError {
    #[error("unknown body {0:?}")]
    UnknownBody(BodyHandle),
    #[error("invalid shape: {0}")]
    InvalidShape(String),
}

pub trait PhysicsWorld {
    /// Drops every body and starts an empty world.
    fn reset(&mut self);

    fn create_body(&mut self, desc: &BodyDesc) -> BodyHandle;

    fn create_fixture(
        &mut self,
        body: BodyHandle,
        shape: &Shape,
        material: Material,
        tag: BodyTag,
    ) -> Result<(), PhysicsError>;

    /// Returns false when the body was already gone.
    fn destroy_body(&mut self, body: BodyHandle) -> bool;

    /// Advances the world. Contacts that start during the step are buffered for
    /// [`PhysicsWorld::drain_contacts`]; no caller code runs while the step is in progress.
    fn step(&mut self, dt: f32);

    /// Force in world units at a world-space point, applied during the next step only.
    fn apply_force(&mut self, body: BodyHandle, force: Vec2, point: Vec2) -> Result<(), PhysicsError>;

    fn apply_torque(&mut self, body: BodyHandle, torque: f32) -> Result<(), PhysicsError>;

    fn position(&self, body: BodyHandle) -> Option<Vec2>;

    fn angle(&self, body: BodyHandle) -> Option<f32>;

    fn linear_velocity(&self, body: BodyHandle) -> Option<Vec2>;

    fn drain_contacts(&mut self) -> Vec<ContactEvent>;
}

/// Static edges around the map so actors cannot leave it.
pub fn create_borders<W: PhysicsWorld + ?Sized>(world: &mut W, map_size: Vec2) -> Result<BodyHandle, PhysicsError> {
    let body = world.create_body(&BodyDesc::fixed(Vec2::ZERO));
    let corners = [
        Vec2::ZERO,
        Vec2::new(map_size.x, 0.0),
        map_size,
        Vec2::new(0.0, map_size.y),
    ];
    for i in 0..corners.len() {
        let edge = Shape::Segment(corners[i], corners[(i + 1) % corners.len()]);
        world.create_fixture(body, &edge, Material::default(), BodyTag::Border)?;
    }
    Ok(body)
}

fn signed_area(outline: &[Vec2]) -> f32 {
    let n = outline.len();
    (0..n).map(|i| outline[i].perp_dot(outline[(i + 1) % n])).sum::<f32>() * 0.5
}

/// True when every turn along the outline bends the same way. Collinear points are allowed.
pub(crate) fn is_convex(outline: &[Vec2]) -> bool {
    let n = outline.len();
    let mut sign = 0.0f32;
    for i in 0..n {
        let (a, b, c) = (outline[i], outline[(i + 1) % n], outline[(i + 2) % n]);
        let turn = (b - a).perp_dot(c - b);
        if turn.abs() <= f32::EPSILON {
            continue;
        }
        if sign != 0.0 && turn.signum() != sign {
            return false;
        }
        sign = turn.signum();
    }
    true
}

/// Ear-clipping triangulation of a simple outline, either winding. `None` for degenerate or
/// self-intersecting input.
pub(crate) fn triangulate(outline: &[Vec2]) -> Option<Vec<[Vec2; 3]>> {
    let area = signed_area(outline);
    if outline.len() < 3 || area.abs() <= f32::EPSILON {
        return None;
    }
    let mut ring: Vec<Vec2> = outline.to_vec();
    if area < 0.0 {
        ring.reverse();
    }

    let mut triangles = Vec::with_capacity(ring.len() - 2);
    while ring.len() > 3 {
        let n = ring.len();
        let corner = |i: usize| (ring[(i + n - 1) % n], ring[i], ring[(i + 1) % n]);

        if let Some(flat) = (0..n).find(|&i| {
            let (a, b, c) = corner(i);
            (b - a).perp_dot(c - b).abs() <= f32::EPSILON
        }) {
            ring.remove(flat);
            continue;
        }

        let ear = (0..n).find(|&i| {
            let (a, b, c) = corner(i);
            if (b - a).perp_dot(c - b) < 0.0 {
                return false;
            }
            let (prev, next) = ((i + n - 1) % n, (i + 1) % n);
            ring.iter()
                .enumerate()
                .filter(|&(j, _)| j != prev && j != i && j != next)
                .all(|(_, &p)| !in_triangle(p, a, b, c))
        })?;
        let (a, b, c) = corner(ear);
        triangles.push([a, b, c]);
        ring.remove(ear);
    }
    if signed_area(&ring).abs() > f32::EPSILON {
        triangles.push([ring[0], ring[1], ring[2]]);
    }
    Some(triangles)
}

/// Counter-clockwise `a b c`; points on an edge count as inside.
fn in_triangle(p: Vec2, a: Vec2, b: Vec2, c: Vec2) -> bool {
    (b - a).perp_dot(p - a) >= 0.0 && (c - b).perp_dot(p - b) >= 0.0 && (a - c).perp_dot(p - c) >= 0.0
}
