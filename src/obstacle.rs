//! Static obstacles: polygon geometry, solid-mask stamping and their rigid-body fixtures.

use glam::Vec2;
use log::debug;

use crate::grid::Grid;
use crate::physics::{BodyDesc, BodyHandle, BodyTag, Material, ObstacleId, PhysicsError, PhysicsWorld, Shape};
use crate::render::{BackendError, Pass, Program, RenderBackend, Uniforms, VertexBufferId};

/// Closed outline in map units, at least three points.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    points: Vec<Vec2>,
}

impl Polygon {
    pub fn new(points: Vec<Vec2>) -> Option<Self> {
        (points.len() >= 3).then_some(Self { points })
    }

    pub fn from_array(points: &[[f32; 2]]) -> Option<Self> {
        Self::new(points.iter().copied().map(Vec2::from).collect())
    }

    /// Rectangle spanned by two opposite drag corners.
    pub fn rectangle(begin: Vec2, end: Vec2) -> Self {
        Self {
            points: vec![begin, Vec2::new(end.x, begin.y), end, Vec2::new(begin.x, end.y)],
        }
    }

    pub fn axis_aligned(min: Vec2, max: Vec2) -> Self {
        Self::rectangle(min.min(max), min.max(max))
    }

    /// `sides`-gon inscribed in a circle, first vertex on the +x axis.
    pub fn regular(sides: u32, radius: f32, center: Vec2) -> Option<Self> {
        let points = (0..sides)
            .map(|i| {
                let angle = i as f32 / sides as f32 * std::f32::consts::TAU;
                center + radius * Vec2::new(angle.cos(), angle.sin())
            })
            .collect();
        Self::new(points)
    }

    pub fn points(&self) -> &[Vec2] {
        &self.points
    }

    pub fn to_array(&self) -> Vec<[f32; 2]> {
        self.points.iter().map(|p| p.to_array()).collect()
    }

    /// Vertex average, where the remaining-deliveries label sits.
    pub fn centroid(&self) -> Vec2 {
        self.points.iter().copied().sum::<Vec2>() / self.points.len() as f32
    }

    pub fn bounds(&self) -> (Vec2, Vec2) {
        self.points
            .iter()
            .fold((Vec2::splat(f32::MAX), Vec2::splat(f32::MIN)), |(lo, hi), p| (lo.min(*p), hi.max(*p)))
    }

    /// Diagonal of the bounding box.
    pub fn extent(&self) -> f32 {
        let (lo, hi) = self.bounds();
        lo.distance(hi)
    }

    pub fn to_clip(&self, map_size: Vec2) -> Vec<[f32; 2]> {
        self.points
            .iter()
            .map(|p| (*p / map_size * 2.0 - 1.0).to_array())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObstacleLabel {
    pub position: Vec2,
    pub remaining: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Obstacle {
    pub id: ObstacleId,
    pub polygon: Polygon,
    pub expected_deliveries: u32,
    pub vertex_buffer: VertexBufferId,
    pub body: BodyHandle,
}

impl Obstacle {
    /// Counter shown over goals that still wait for deliveries.
    pub fn label(&self) -> Option<ObstacleLabel> {
        (self.expected_deliveries > 0).then(|| ObstacleLabel {
            position: self.polygon.centroid(),
            remaining: self.expected_deliveries,
        })
    }
}

/// Turns polygons into solid-mask coverage, a clip-space vertex buffer and a static fixture.
#[derive(Debug, Clone, Copy)]
pub struct ObstacleRasterizer {
    pub map_size: Vec2,
    pub min_extent: f32,
}

impl ObstacleRasterizer {
    pub fn new(map_size: Vec2, min_extent: f32) -> Self {
        Self { map_size, min_extent }
    }

    /// Builds an obstacle, or returns `None` for shapes too small to form a sane fixture.
    pub fn rasterize<B, W>(
        &self,
        backend: &mut B,
        physics: &mut W,
        solids: &Grid,
        id: ObstacleId,
        polygon: Polygon,
        expected_deliveries: u32,
    ) -> anyhow::Result<Option<Obstacle>>
    where
        B: RenderBackend + ?Sized,
        W: PhysicsWorld + ?Sized,
    {
        if polygon.extent() < self.min_extent {
            debug!("rejecting obstacle {id:?}: extent {} below {}", polygon.extent(), self.min_extent);
            return Ok(None);
        }

        let body = physics.create_body(&BodyDesc::fixed(Vec2::ZERO));
        let shape = Shape::Polygon(polygon.points().to_vec());
        match physics.create_fixture(body, &shape, Material::default(), BodyTag::Obstacle(id)) {
            Ok(()) => {}
            Err(PhysicsError::InvalidShape(reason)) => {
                debug!("rejecting obstacle {id:?}: {reason}");
                physics.destroy_body(body);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }

        let vertex_buffer = backend.create_vertex_buffer(&polygon.to_clip(self.map_size))?;
        let obstacle = Obstacle { id, polygon, expected_deliveries, vertex_buffer, body };
        Self::stamp(backend, solids, &obstacle)?;
        debug!("rasterized obstacle {id:?} expecting {expected_deliveries}");
        Ok(Some(obstacle))
    }

    /// Writes full coverage for the obstacle into the solid mask.
    pub fn stamp<B: RenderBackend + ?Sized>(backend: &mut B, solids: &Grid, obstacle: &Obstacle) -> Result<(), BackendError> {
        let uniforms = Uniforms::new();
        backend.run(&Pass::polygon(Program::ConstructSolid, &uniforms, solids.surface, obstacle.vertex_buffer))
    }

    /// Vertex buffer for a placement preview; no solid coverage and no fixture.
    pub fn preview<B: RenderBackend + ?Sized>(&self, backend: &mut B, polygon: &Polygon) -> Result<VertexBufferId, BackendError> {
        backend.create_vertex_buffer(&polygon.to_clip(self.map_size))
    }

    pub fn release<B, W>(backend: &mut B, physics: &mut W, obstacle: Obstacle)
    where
        B: RenderBackend + ?Sized,
        W: PhysicsWorld + ?Sized,
    {
        backend.destroy_vertex_buffer(obstacle.vertex_buffer);
        physics.destroy_body(obstacle.body);
    }
}

/// An in-progress player drag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub begin: Vec2,
    pub end: Vec2,
    pub preview: Option<VertexBufferId>,
}

impl Placement {
    pub fn new(begin: Vec2) -> Self {
        Self { begin, end: begin, preview: None }
    }

    pub fn span(&self) -> f32 {
        self.begin.distance(self.end)
    }

    pub fn polygon(&self) -> Polygon {
        Polygon::rectangle(self.begin, self.end)
    }
}
