use std::collections::HashMap;
use std::sync::Mutex;

use glam::Vec2;
use log::warn;
use rapier2d::prelude::*;

use super::{
    is_convex, triangulate, BodyDesc, BodyHandle, BodyKind, BodyTag, ContactEvent, Material, PhysicsError, PhysicsWorld,
    Shape,
};

/// Collects contact starts while the pipeline steps; read back once the step returns.
#[derive(Default)]
struct ContactCollector {
    started: Mutex<Vec<(ColliderHandle, ColliderHandle)>>,
}

impl EventHandler for ContactCollector {
    fn handle_collision_event(
        &self,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        event: CollisionEvent,
        _contact_pair: Option<&ContactPair>,
    ) {
        if let CollisionEvent::Started(a, b, _) = event {
            match self.started.lock() {
                Ok(mut started) => started.push((a, b)),
                Err(_) => warn!("contact buffer poisoned, dropping contact"),
            }
        }
    }

    fn handle_contact_force_event(
        &self,
        _dt: Real,
        _bodies: &RigidBodySet,
        _colliders: &ColliderSet,
        _contact_pair: &ContactPair,
        _total_force_magnitude: Real,
    ) {
    }
}

/// Zero-gravity top-down world backed by rapier.
pub struct RapierWorld {
    gravity: Vector<Real>,
    integration_parameters: IntegrationParameters,
    pipeline: PhysicsPipeline,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    contacts: ContactCollector,
    handles: HashMap<BodyHandle, RigidBodyHandle>,
    tags: HashMap<ColliderHandle, BodyTag>,
    next_handle: u64,
}

impl Default for RapierWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl RapierWorld {
    pub fn new() -> Self {
        Self {
            gravity: vector![0.0, 0.0],
            integration_parameters: IntegrationParameters::default(),
            pipeline: PhysicsPipeline::new(),
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            contacts: ContactCollector::default(),
            handles: HashMap::new(),
            tags: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn body_count(&self) -> usize {
        self.handles.len()
    }

    fn body(&self, handle: BodyHandle) -> Option<&RigidBody> {
        self.handles.get(&handle).and_then(|h| self.bodies.get(*h))
    }

    fn body_mut(&mut self, handle: BodyHandle) -> Result<&mut RigidBody, PhysicsError> {
        let rb = *self.handles.get(&handle).ok_or(PhysicsError::UnknownBody(handle))?;
        self.bodies.get_mut(rb).ok_or(PhysicsError::UnknownBody(handle))
    }
}

fn to_point(v: Vec2) -> Point<Real> {
    point![v.x, v.y]
}

impl PhysicsWorld for RapierWorld {
    fn reset(&mut self) {
        *self = Self::new();
    }

    fn create_body(&mut self, desc: &BodyDesc) -> BodyHandle {
        let builder = match desc.kind {
            BodyKind::Static => RigidBodyBuilder::fixed(),
            BodyKind::Dynamic => RigidBodyBuilder::dynamic(),
        };
        let body = builder
            .translation(vector![desc.position.x, desc.position.y])
            .rotation(desc.angle)
            .linear_damping(desc.linear_damping)
            .angular_damping(desc.angular_damping)
            .ccd_enabled(desc.ccd)
            .build();
        let rb = self.bodies.insert(body);

        let handle = BodyHandle(self.next_handle);
        self.next_handle += 1;
        self.handles.insert(handle, rb);
        handle
    }

    fn create_fixture(
        &mut self,
        body: BodyHandle,
        shape: &Shape,
        material: Material,
        tag: BodyTag,
    ) -> Result<(), PhysicsError> {
        let rb = *self.handles.get(&body).ok_or(PhysicsError::UnknownBody(body))?;
        let builder = match shape {
            Shape::Polygon(outline) if !is_convex(outline) => {
                let triangles = triangulate(outline).ok_or_else(|| {
                    PhysicsError::InvalidShape(format!("cannot triangulate {}-point outline", outline.len()))
                })?;
                let parts = triangles
                    .into_iter()
                    .map(|[a, b, c]| (Isometry::identity(), SharedShape::triangle(to_point(a), to_point(b), to_point(c))))
                    .collect();
                ColliderBuilder::compound(parts)
            }
            Shape::Polygon(outline) => {
                let points: Vec<Point<Real>> = outline.iter().copied().map(to_point).collect();
                ColliderBuilder::convex_hull(&points)
                    .ok_or_else(|| PhysicsError::InvalidShape(format!("no convex hull for {} points", points.len())))?
            }
            Shape::Box { half_extents } => ColliderBuilder::cuboid(half_extents.x, half_extents.y),
            Shape::Segment(a, b) => ColliderBuilder::segment(to_point(*a), to_point(*b)),
        };
        let collider = builder
            .density(material.density)
            .friction(material.friction)
            .restitution(material.restitution)
            .active_events(ActiveEvents::COLLISION_EVENTS)
            .build();
        let handle = self.colliders.insert_with_parent(collider, rb, &mut self.bodies);
        self.tags.insert(handle, tag);
        Ok(())
    }

    fn destroy_body(&mut self, body: BodyHandle) -> bool {
        let Some(rb) = self.handles.remove(&body) else {
            return false;
        };
        let attached = self.bodies.get(rb).map(|b| b.colliders().to_vec()).unwrap_or_default();
        for collider in &attached {
            self.tags.remove(collider);
        }
        self.bodies.remove(
            rb,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
        true
    }

    fn step(&mut self, dt: f32) {
        self.integration_parameters.dt = dt;
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            None,
            &(),
            &self.contacts,
        );
        // Forces only last for the step they were applied in.
        for (_, body) in self.bodies.iter_mut() {
            body.reset_forces(false);
            body.reset_torques(false);
        }
    }

    fn apply_force(&mut self, body: BodyHandle, force: Vec2, point: Vec2) -> Result<(), PhysicsError> {
        self.body_mut(body)?
            .add_force_at_point(vector![force.x, force.y], to_point(point), true);
        Ok(())
    }

    fn apply_torque(&mut self, body: BodyHandle, torque: f32) -> Result<(), PhysicsError> {
        self.body_mut(body)?.add_torque(torque, true);
        Ok(())
    }

    fn position(&self, body: BodyHandle) -> Option<Vec2> {
        self.body(body).map(|b| Vec2::new(b.translation().x, b.translation().y))
    }

    fn angle(&self, body: BodyHandle) -> Option<f32> {
        self.body(body).map(|b| b.rotation().angle())
    }

    fn linear_velocity(&self, body: BodyHandle) -> Option<Vec2> {
        self.body(body).map(|b| Vec2::new(b.linvel().x, b.linvel().y))
    }

    fn drain_contacts(&mut self) -> Vec<ContactEvent> {
        let started = match self.contacts.started.get_mut() {
            Ok(started) => std::mem::take(started),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        started
            .into_iter()
            .filter_map(|(a, b)| {
                let a = *self.tags.get(&a)?;
                let b = *self.tags.get(&b)?;
                Some(ContactEvent { a, b })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physics::{create_borders, ActorId, ObstacleId};

    #[test]
    fn test_force_moves_dynamic_body() {
        let mut world = RapierWorld::new();
        let body = world.create_body(&BodyDesc::dynamic(Vec2::new(10.0, 10.0), 0.0));
        world
            .create_fixture(body, &Shape::Box { half_extents: Vec2::splat(1.0) }, Material::default(), BodyTag::Border)
            .unwrap();

        for _ in 0..10 {
            world.apply_force(body, Vec2::new(100.0, 0.0), Vec2::new(10.0, 10.0)).unwrap();
            world.step(1.0 / 60.0);
        }
        let position = world.position(body).unwrap();
        assert!(position.x > 10.0, "body did not move: {position:?}");
        assert!((position.y - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_forces_do_not_persist_between_steps() {
        let mut world = RapierWorld::new();
        let body = world.create_body(&BodyDesc::dynamic(Vec2::ZERO, 0.0));
        world
            .create_fixture(body, &Shape::Box { half_extents: Vec2::splat(1.0) }, Material::default(), BodyTag::Border)
            .unwrap();
        world.apply_force(body, Vec2::new(100.0, 0.0), Vec2::ZERO).unwrap();
        world.step(1.0 / 60.0);
        let v1 = world.linear_velocity(body).unwrap();
        world.step(1.0 / 60.0);
        let v2 = world.linear_velocity(body).unwrap();
        assert!(v1.x > 0.0);
        assert!((v1.x - v2.x).abs() < 1e-4, "velocity kept growing: {v1:?} -> {v2:?}");
    }

    #[test]
    fn test_contact_reports_both_tags() {
        let mut world = RapierWorld::new();
        let goal = world.create_body(&BodyDesc::fixed(Vec2::ZERO));
        let square = vec![
            Vec2::new(20.0, -10.0),
            Vec2::new(40.0, -10.0),
            Vec2::new(40.0, 10.0),
            Vec2::new(20.0, 10.0),
        ];
        world
            .create_fixture(goal, &Shape::Polygon(square), Material::default(), BodyTag::Obstacle(ObstacleId(1)))
            .unwrap();
        let present = world.create_body(&BodyDesc::dynamic(Vec2::ZERO, 0.0));
        world
            .create_fixture(
                present,
                &Shape::Box { half_extents: Vec2::splat(5.0) },
                Material::default(),
                BodyTag::Deliverable(ActorId(2)),
            )
            .unwrap();

        let mut contacts = Vec::new();
        for _ in 0..240 {
            world.apply_force(present, Vec2::new(20_000.0, 0.0), world.position(present).unwrap()).unwrap();
            world.step(1.0 / 60.0);
            contacts.extend(world.drain_contacts());
            if !contacts.is_empty() {
                break;
            }
        }
        let contact = contacts.first().expect("bodies never touched");
        let tags = [contact.a, contact.b];
        assert!(tags.contains(&BodyTag::Obstacle(ObstacleId(1))));
        assert!(tags.contains(&BodyTag::Deliverable(ActorId(2))));
    }

    fn notched_obstacle(world: &mut RapierWorld) {
        let body = world.create_body(&BodyDesc::fixed(Vec2::ZERO));
        let corners: [[f32; 2]; 8] =
            [[0.0, 0.0], [90.0, 0.0], [90.0, 90.0], [60.0, 90.0], [60.0, 30.0], [30.0, 30.0], [30.0, 90.0], [0.0, 90.0]];
        let outline = corners.map(Vec2::from).to_vec();
        world
            .create_fixture(body, &Shape::Polygon(outline), Material::default(), BodyTag::Obstacle(ObstacleId(1)))
            .unwrap();
    }

    fn contacts_for_box_at(position: Vec2) -> Vec<ContactEvent> {
        let mut world = RapierWorld::new();
        notched_obstacle(&mut world);
        let present = world.create_body(&BodyDesc::dynamic(position, 0.0));
        world
            .create_fixture(
                present,
                &Shape::Box { half_extents: Vec2::splat(5.0) },
                Material::default(),
                BodyTag::Deliverable(ActorId(2)),
            )
            .unwrap();
        let mut contacts = Vec::new();
        for _ in 0..5 {
            world.step(1.0 / 60.0);
            contacts.extend(world.drain_contacts());
        }
        contacts
    }

    #[test]
    fn test_concave_obstacle_leaves_notch_open() {
        assert!(contacts_for_box_at(Vec2::new(45.0, 70.0)).is_empty());
        assert!(!contacts_for_box_at(Vec2::new(15.0, 45.0)).is_empty());
    }

    #[test]
    fn test_double_destroy_is_a_no_op() {
        let mut world = RapierWorld::new();
        let body = world.create_body(&BodyDesc::dynamic(Vec2::ZERO, 0.0));
        assert!(world.destroy_body(body));
        assert!(!world.destroy_body(body));
        assert!(world.position(body).is_none());
        assert!(world.apply_force(body, Vec2::X, Vec2::ZERO).is_err());
    }

    #[test]
    fn test_borders_and_reset() {
        let mut world = RapierWorld::new();
        create_borders(&mut world, Vec2::new(100.0, 50.0)).unwrap();
        assert_eq!(world.body_count(), 1);
        world.reset();
        assert_eq!(world.body_count(), 0);
    }
}
