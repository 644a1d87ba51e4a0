use fluid_courier::level::{Flow, Level, ObstacleDef, PresentDef};
use fluid_courier::physics::rapier::RapierWorld;
use fluid_courier::render::cpu::CpuBackend;
use fluid_courier::render::RenderBackend;
use fluid_courier::settings::SimulationSettings;
use fluid_courier::simulation::{LevelStatus, SimulationState};

const DT: f32 = 1.0 / 60.0;

fn settings() -> SimulationSettings {
    SimulationSettings {
        sim_resolution: 32,
        dye_resolution: 64,
        bloom: false,
        sunrays: false,
        map_size: [640.0, 360.0],
        ..Default::default()
    }
}

/// A jet along the horizontal centreline carries one present into a goal sitting on the same
/// line. Everything is mirror-symmetric about y = 180, so the present stays on course.
fn corridor() -> Level {
    Level {
        name: "corridor".into(),
        obstacles: vec![ObstacleDef {
            points: vec![[280.0, 140.0], [360.0, 140.0], [360.0, 220.0], [280.0, 220.0]],
            expected: 1,
        }],
        // Black, so the only dye in the grid comes from the delivery.
        flows: vec![Flow { begin: [60.0, 180.0], end: [260.0, 180.0], force: 20.0, color: [0.0; 3], radius: 1.0 }],
        delivery_queue: vec![PresentDef { size: [40.0, 40.0], position: [220.0, 180.0] }],
        placeable_obstacles: 0,
    }
}

#[test]
fn test_flow_carries_present_into_goal() {
    let mut sim = SimulationState::new(CpuBackend::new(), RapierWorld::new(), settings(), (640, 360), corridor())
        .expect("session");
    assert_eq!(sim.remaining_deliveries(), 1);

    let spawned = sim.start_spawning().expect("spawn");
    assert!(spawned.is_some());
    assert_eq!(sim.actors().len(), 1);
    assert_eq!(sim.queued_presents(), 0);

    let mut delivered_at = None;
    for frame in 0..1800 {
        let report = sim.update(DT).expect("frame");
        if !report.deliveries.is_empty() {
            assert_eq!(report.deliveries.len(), 1);
            assert_eq!(report.deliveries[0].remaining, 0);
            assert_eq!(report.status, LevelStatus::Completed);
            delivered_at = Some(frame);
            break;
        }
        assert_eq!(report.status, LevelStatus::Playing);
    }
    assert!(delivered_at.is_some(), "present never reached the goal");

    assert_eq!(sim.remaining_deliveries(), 0);
    assert!(sim.actors().is_empty());
    assert!(sim.labels().is_empty());
    assert_eq!(sim.status(), LevelStatus::Completed);

    let dye = *sim.grids().dye.read();
    let pixels = sim.backend_mut().read_pixels(dye.surface).expect("readback");
    let (w, h) = dye.size();
    let mut inside = 0.0_f32;
    let mut outside = 0.0_f32;
    for y in 0..h {
        for x in 0..w {
            // Cell centre in map units.
            let mx = (x as f32 + 0.5) / w as f32 * 640.0;
            let my = (y as f32 + 0.5) / h as f32 * 360.0;
            let p = pixels[(y * w + x) as usize];
            let brightness = p[0].max(p[1]).max(p[2]);
            if (280.0..360.0).contains(&mx) && (140.0..220.0).contains(&my) {
                inside = inside.max(brightness);
            } else {
                outside = outside.max(brightness);
            }
        }
    }
    assert!(inside > 0.05, "goal footprint was not painted ({inside})");
    assert!(inside > outside, "paint is not confined to the goal ({inside} vs {outside})");
}

#[test]
fn test_level_without_goals_completes_immediately() {
    let mut level = corridor();
    level.obstacles[0].expected = 0;
    let mut sim = SimulationState::new(CpuBackend::new(), RapierWorld::new(), settings(), (640, 360), level)
        .expect("session");
    assert_eq!(sim.status(), LevelStatus::Playing);

    let report = sim.update(DT).expect("frame");
    assert!(report.deliveries.is_empty());
    assert_eq!(report.status, LevelStatus::Completed);
}
