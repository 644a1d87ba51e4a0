//! Goal resolution. Contacts are queued while physics steps and acted on once it returns.

use log::{debug, info};

use crate::actor::Actor;
use crate::grid::FluidGrids;
use crate::obstacle::Obstacle;
use crate::physics::{ActorId, BodyTag, ContactEvent, ObstacleId, PhysicsWorld};
use crate::render::{BackendError, Pass, Program, RenderBackend, Uniforms};

/// Alpha of the colour painted into a goal's footprint per delivery.
pub const DELIVERY_PAINT_ALPHA: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    Deliver { obstacle: ObstacleId, actor: ActorId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub obstacle: ObstacleId,
    pub actor: ActorId,
    /// Deliveries the obstacle still expects after this one.
    pub remaining: u32,
}

#[derive(Debug, Default)]
pub struct DeliveryResolver {
    pending: Vec<DeferredAction>,
}

impl DeliveryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a delivery for every obstacle/deliverable contact. Returns how many were queued.
    pub fn schedule(&mut self, contacts: &[ContactEvent]) -> usize {
        let before = self.pending.len();
        for contact in contacts {
            match (contact.a, contact.b) {
                (BodyTag::Obstacle(obstacle), BodyTag::Deliverable(actor))
                | (BodyTag::Deliverable(actor), BodyTag::Obstacle(obstacle)) => {
                    self.pending.push(DeferredAction::Deliver { obstacle, actor });
                }
                _ => {}
            }
        }
        self.pending.len() - before
    }

    pub fn pending(&self) -> &[DeferredAction] {
        &self.pending
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Applies every queued action in order. Duplicates resolve to no-ops: an obstacle that
    /// expects nothing more, or an actor that was already delivered, is skipped.
    pub fn drain<B, W>(
        &mut self,
        backend: &mut B,
        physics: &mut W,
        grids: &mut FluidGrids,
        obstacles: &mut [Obstacle],
        actors: &mut Vec<Actor>,
    ) -> Result<Vec<Delivery>, BackendError>
    where
        B: RenderBackend + ?Sized,
        W: PhysicsWorld + ?Sized,
    {
        let mut deliveries = Vec::new();
        for action in std::mem::take(&mut self.pending) {
            let DeferredAction::Deliver { obstacle: obstacle_id, actor: actor_id } = action;

            let Some(obstacle) = obstacles.iter_mut().find(|o| o.id == obstacle_id) else {
                debug!("delivery to unknown obstacle {obstacle_id:?}");
                continue;
            };
            if obstacle.expected_deliveries == 0 {
                continue;
            }
            let Some(index) = actors.iter().position(|a| a.id == actor_id) else {
                continue;
            };

            obstacle.expected_deliveries -= 1;
            let actor = actors.remove(index);
            paint_delivery(backend, grids, obstacle, &actor)?;
            physics.destroy_body(actor.body);

            info!(
                "{actor_id:?} delivered to {obstacle_id:?}, {} remaining",
                obstacle.expected_deliveries
            );
            deliveries.push(Delivery {
                obstacle: obstacle_id,
                actor: actor_id,
                remaining: obstacle.expected_deliveries,
            });
        }
        Ok(deliveries)
    }
}

/// Blends the actor's colour over the obstacle's footprint in the dye grid.
fn paint_delivery<B: RenderBackend + ?Sized>(
    backend: &mut B,
    grids: &mut FluidGrids,
    obstacle: &Obstacle,
    actor: &Actor,
) -> Result<(), BackendError> {
    let [r, g, b] = actor.color;
    let uniforms = Uniforms::new()
        .surface("uSource", grids.dye.read().surface)
        .vec4("color", [r, g, b, DELIVERY_PAINT_ALPHA]);
    backend.run(&Pass::polygon(
        Program::PaintPolygon,
        &uniforms,
        grids.dye.write().surface,
        obstacle.vertex_buffer,
    ))?;
    grids.dye.swap();
    Ok(())
}

/// Sum of deliveries still expected across all obstacles.
pub fn remaining_deliveries(obstacles: &[Obstacle]) -> u32 {
    obstacles.iter().map(|o| o.expected_deliveries).sum()
}
