//! One game session: fluid, physics, obstacles, actors and the current level.

use std::collections::VecDeque;

use anyhow::Context;
use glam::{Mat3, Vec2};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::actor::Actor;
use crate::coupling::{ActorCoupler, VelocitySnapshot};
use crate::delivery::{self, Delivery, DeliveryResolver};
use crate::grid::FluidGrids;
use crate::level::{builtin, Flow, Level, LevelCatalog, PresentDef};
use crate::obstacle::{Obstacle, ObstacleLabel, ObstacleRasterizer, Placement, Polygon};
use crate::physics::{self, ActorId, ObstacleId, PhysicsWorld};
use crate::render::RenderBackend;
use crate::settings::SimulationSettings;
use crate::solver::FluidSolver;
use crate::splat::{self, Pointer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LevelStatus {
    Playing,
    /// Every goal received its deliveries.
    Completed,
    /// The campaign is over.
    Won,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    /// Time step actually used, after clamping.
    pub dt: f32,
    pub fluid_stepped: bool,
    pub deliveries: Vec<Delivery>,
    pub spawned: Vec<ActorId>,
    pub status: LevelStatus,
}

pub struct SimulationState<B: RenderBackend, P: PhysicsWorld> {
    backend: B,
    physics: P,
    settings: SimulationSettings,
    viewport: (u32, u32),
    grids: FluidGrids,
    solver: FluidSolver,
    rasterizer: ObstacleRasterizer,
    coupler: ActorCoupler,

    level: Level,
    obstacles: Vec<Obstacle>,
    actors: Vec<Actor>,
    flows: Vec<Flow>,
    queue: VecDeque<PresentDef>,
    spawning: bool,
    spawn_timer: f32,
    resolver: DeliveryResolver,
    placement: Option<Placement>,
    placement_budget: u32,
    status: LevelStatus,

    pointer: Pointer,
    pending_random_splats: usize,
    next_obstacle: u32,
    next_actor: u32,
    rng: StdRng,
}

impl<B: RenderBackend, P: PhysicsWorld> SimulationState<B, P> {
    pub fn new(
        mut backend: B,
        physics: P,
        settings: SimulationSettings,
        viewport: (u32, u32),
        level: Level,
    ) -> anyhow::Result<Self> {
        let grids = FluidGrids::init(&mut backend, &settings, viewport).context("allocating fluid grids")?;
        let solver = FluidSolver::new(backend.capabilities());
        if solver.manual_filtering() {
            info!("backend lacks linear filtering, advection filters manually");
        }
        let map_size = Vec2::from(settings.map_size);

        let mut state = Self {
            rasterizer: ObstacleRasterizer::new(map_size, settings.min_obstacle_extent),
            coupler: ActorCoupler::from_settings(&settings),
            rng: StdRng::seed_from_u64(settings.seed),
            backend,
            physics,
            settings,
            viewport,
            grids,
            solver,
            level: level.clone(),
            obstacles: Vec::new(),
            actors: Vec::new(),
            flows: Vec::new(),
            queue: VecDeque::new(),
            spawning: false,
            spawn_timer: 0.0,
            resolver: DeliveryResolver::new(),
            placement: None,
            placement_budget: 0,
            status: LevelStatus::Playing,
            pointer: Pointer::default(),
            pending_random_splats: 0,
            next_obstacle: 0,
            next_actor: 0,
        };
        state.load_level(level)?;
        Ok(state)
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn physics(&self) -> &P {
        &self.physics
    }

    pub fn settings(&self) -> &SimulationSettings {
        &self.settings
    }

    pub fn grids(&self) -> &FluidGrids {
        &self.grids
    }

    pub fn level(&self) -> &Level {
        &self.level
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn actors(&self) -> &[Actor] {
        &self.actors
    }

    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    pub fn status(&self) -> LevelStatus {
        self.status
    }

    pub fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    pub fn aspect(&self) -> f32 {
        self.viewport.0 as f32 / self.viewport.1.max(1) as f32
    }

    pub fn map_size(&self) -> Vec2 {
        Vec2::from(self.settings.map_size)
    }

    pub fn paused(&self) -> bool {
        self.settings.paused
    }

    pub fn placement_budget(&self) -> u32 {
        self.placement_budget
    }

    pub fn placement(&self) -> Option<&Placement> {
        self.placement.as_ref()
    }

    pub fn queued_presents(&self) -> usize {
        self.queue.len()
    }

    pub fn remaining_deliveries(&self) -> u32 {
        delivery::remaining_deliveries(&self.obstacles)
    }

    pub fn labels(&self) -> Vec<ObstacleLabel> {
        self.obstacles.iter().filter_map(Obstacle::label).collect()
    }

    pub fn actor_transforms(&self) -> Vec<(ActorId, Mat3)> {
        let map_size = self.map_size();
        self.actors
            .iter()
            .filter_map(|a| Some((a.id, a.render_transform(&self.physics, map_size)?)))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Level lifecycle
    // ------------------------------------------------------------------------

    /// Tears down the current level and builds `level` from scratch: fresh physics world with
    /// borders, cleared grids, every obstacle rasterized.
    pub fn load_level(&mut self, level: Level) -> anyhow::Result<()> {
        self.cancel_placement();
        for obstacle in self.obstacles.drain(..) {
            self.backend.destroy_vertex_buffer(obstacle.vertex_buffer);
        }
        self.actors.clear();
        self.resolver.clear();
        self.physics.reset();
        let map_size = self.map_size();
        physics::create_borders(&mut self.physics, map_size)?;
        self.grids.clear_all(&mut self.backend)?;

        for def in &level.obstacles {
            let Some(polygon) = Polygon::from_array(&def.points) else {
                warn!("level '{}' has an obstacle with fewer than three points", level.name);
                continue;
            };
            let id = self.next_obstacle_id();
            if let Some(obstacle) = self.rasterizer.rasterize(
                &mut self.backend,
                &mut self.physics,
                &self.grids.solids,
                id,
                polygon,
                def.expected,
            )? {
                self.obstacles.push(obstacle);
            }
        }

        self.flows = level.flows.clone();
        self.queue = level.delivery_queue.iter().copied().collect();
        self.spawning = false;
        self.spawn_timer = 0.0;
        self.placement_budget = level.placeable_obstacles;
        self.status = LevelStatus::Playing;
        info!(
            "level '{}': {} obstacles, {} deliveries expected, {} presents queued",
            level.name,
            self.obstacles.len(),
            self.remaining_deliveries(),
            self.queue.len()
        );
        self.level = level;
        Ok(())
    }

    pub fn reset_level(&mut self) -> anyhow::Result<()> {
        self.load_level(self.level.clone())
    }

    /// Loads the catalog's next level, or the closing scene once the campaign is over.
    pub fn advance_level(&mut self, catalog: &mut LevelCatalog) -> anyhow::Result<LevelStatus> {
        match catalog.advance().cloned() {
            Some(level) => self.load_level(level)?,
            None => {
                self.load_level(builtin::finished())?;
                self.status = LevelStatus::Won;
                info!("campaign won");
            }
        }
        Ok(self.status)
    }

    /// Rebuilds grids for a new viewport and stamps every obstacle again.
    pub fn resize(&mut self, viewport: (u32, u32)) -> anyhow::Result<()> {
        if viewport == self.viewport {
            return Ok(());
        }
        self.grids = self
            .grids
            .clone()
            .reinit(&mut self.backend, &self.settings, viewport)
            .context("resizing fluid grids")?;
        self.viewport = viewport;
        self.restamp_obstacles()
    }

    fn restamp_obstacles(&mut self) -> anyhow::Result<()> {
        for obstacle in &self.obstacles {
            ObstacleRasterizer::stamp(&mut self.backend, &self.grids.solids, obstacle)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Player input
    // ------------------------------------------------------------------------

    /// Starts a drag at a map position. Refused when the budget is spent.
    pub fn begin_placement(&mut self, position: Vec2) -> bool {
        if self.placement_budget == 0 {
            return false;
        }
        self.cancel_placement();
        self.placement = Some(Placement::new(position));
        true
    }

    pub fn update_placement(&mut self, position: Vec2) -> anyhow::Result<()> {
        let Some(mut placement) = self.placement.take() else {
            return Ok(());
        };
        if let Some(preview) = placement.preview.take() {
            self.backend.destroy_vertex_buffer(preview);
        }
        placement.end = position;
        placement.preview = Some(self.rasterizer.preview(&mut self.backend, &placement.polygon())?);
        self.placement = Some(placement);
        Ok(())
    }

    pub fn cancel_placement(&mut self) {
        if let Some(preview) = self.placement.take().and_then(|p| p.preview) {
            self.backend.destroy_vertex_buffer(preview);
        }
    }

    /// Ends the drag. Short drags are dropped without spending budget.
    pub fn finish_placement(&mut self, position: Vec2) -> anyhow::Result<Option<ObstacleId>> {
        let Some(mut placement) = self.placement.take() else {
            return Ok(None);
        };
        if let Some(preview) = placement.preview.take() {
            self.backend.destroy_vertex_buffer(preview);
        }
        placement.end = position;
        if placement.span() < self.settings.min_placement_span || self.placement_budget == 0 {
            debug!("placement dropped, span {:.1}", placement.span());
            return Ok(None);
        }

        let id = self.next_obstacle_id();
        let built = self.rasterizer.rasterize(
            &mut self.backend,
            &mut self.physics,
            &self.grids.solids,
            id,
            placement.polygon(),
            0,
        )?;
        let Some(obstacle) = built else {
            return Ok(None);
        };
        self.obstacles.push(obstacle);
        self.placement_budget -= 1;
        info!("placed obstacle {id:?}, {} left", self.placement_budget);
        Ok(Some(id))
    }

    /// Spawns the first queued present now and the rest on the spawn interval.
    pub fn start_spawning(&mut self) -> anyhow::Result<Option<ActorId>> {
        if self.spawning {
            return Ok(None);
        }
        self.spawning = true;
        self.spawn_timer = self.settings.spawn_interval;
        self.spawn_next()
    }

    pub fn toggle_pause(&mut self) -> bool {
        self.settings.paused = !self.settings.paused;
        self.settings.paused
    }

    pub fn pointer_down(&mut self, texcoord: [f32; 2]) {
        let color = splat::generate_color(&mut self.rng);
        self.pointer.press(texcoord, color);
    }

    pub fn pointer_move(&mut self, texcoord: [f32; 2]) {
        let aspect = self.aspect();
        self.pointer.move_to(texcoord, aspect);
    }

    pub fn pointer_up(&mut self) {
        self.pointer.release();
    }

    /// Random bursts land on the next update.
    pub fn queue_random_splats(&mut self, count: usize) {
        self.pending_random_splats += count;
    }

    // ------------------------------------------------------------------------
    // Frame
    // ------------------------------------------------------------------------

    /// Advances the fluid alone.
    pub fn step(&mut self, dt: f32) -> anyhow::Result<()> {
        self.solver
            .step(&mut self.backend, &mut self.grids, &self.settings, dt)
            .context("fluid step")?;
        Ok(())
    }

    pub fn update(&mut self, dt: f32) -> anyhow::Result<FrameReport> {
        // NaN survives `clamp`; treat it as a frame where no time passed.
        let dt = if dt.is_nan() { 0.0 } else { dt.clamp(0.0, self.settings.max_dt) };
        let aspect = self.aspect();
        let map_size = self.map_size();

        self.apply_inputs(aspect)?;

        let fluid_stepped = !self.settings.paused;
        if fluid_stepped {
            self.step(dt)?;
        }

        if dt > 0.0 {
            self.physics.step(dt);
        }
        let contacts = self.physics.drain_contacts();
        self.resolver.schedule(&contacts);
        let deliveries = self.resolver.drain(
            &mut self.backend,
            &mut self.physics,
            &mut self.grids,
            &mut self.obstacles,
            &mut self.actors,
        )?;

        if !self.actors.is_empty() {
            let snapshot = VelocitySnapshot::capture(&mut self.backend, self.grids.velocity.read(), map_size)?;
            for actor in &self.actors {
                self.coupler.apply(&mut self.physics, actor, &snapshot, dt)?;
            }
        }

        if fluid_stepped {
            splat::apply_flows(
                &mut self.backend,
                &mut self.grids,
                &self.settings,
                aspect,
                map_size,
                &self.flows,
                dt,
            )?;
        }

        let spawned = self.tick_spawner(dt)?;

        if self.status == LevelStatus::Playing && self.remaining_deliveries() == 0 {
            self.status = LevelStatus::Completed;
            info!("level '{}' completed", self.level.name);
        }

        Ok(FrameReport { dt, fluid_stepped, deliveries, spawned, status: self.status })
    }

    fn apply_inputs(&mut self, aspect: f32) -> anyhow::Result<()> {
        if self.pending_random_splats > 0 {
            let count = std::mem::take(&mut self.pending_random_splats);
            splat::random_splats(&mut self.backend, &mut self.grids, &self.settings, aspect, count, &mut self.rng)?;
        }
        if self.pointer.moved {
            self.pointer.moved = false;
            splat::splat_pointer(&mut self.backend, &mut self.grids, &self.settings, aspect, &self.pointer)?;
        }
        Ok(())
    }

    fn tick_spawner(&mut self, dt: f32) -> anyhow::Result<Vec<ActorId>> {
        let mut spawned = Vec::new();
        if !self.spawning {
            return Ok(spawned);
        }
        self.spawn_timer -= dt;
        while self.spawning && self.spawn_timer <= 0.0 {
            self.spawn_timer += self.settings.spawn_interval;
            spawned.extend(self.spawn_next()?);
        }
        Ok(spawned)
    }

    fn spawn_next(&mut self) -> anyhow::Result<Option<ActorId>> {
        let Some(present) = self.queue.pop_front() else {
            self.spawning = false;
            return Ok(None);
        };
        let id = ActorId(self.next_actor);
        self.next_actor += 1;
        let color = splat::vivid_color(&mut self.rng);
        let actor = Actor::spawn(
            &mut self.physics,
            &self.settings,
            id,
            Vec2::from(present.size),
            Vec2::from(present.position),
            color,
        )?;
        debug!("spawned {id:?} at {:?}", present.position);
        self.actors.push(actor);
        if self.queue.is_empty() {
            self.spawning = false;
        }
        Ok(Some(id))
    }

    fn next_obstacle_id(&mut self) -> ObstacleId {
        let id = ObstacleId(self.next_obstacle);
        self.next_obstacle += 1;
        id
    }

    /// Releases every backend resource owned by the session.
    pub fn shutdown(mut self) {
        self.cancel_placement();
        for obstacle in self.obstacles.drain(..) {
            ObstacleRasterizer::release(&mut self.backend, &mut self.physics, obstacle);
        }
        self.grids.release_all(&mut self.backend);
    }
}
