//! Level descriptions: goals, ambient flows and the delivery queue.
//!
//! Levels are plain serde data authored in map units. The campaign ships as built-in levels;
//! custom ones load from JSON.

use std::fs;
use std::path::Path;

use anyhow::Context;
use glam::Vec2;
use log::info;
use serde::{Deserialize, Serialize};

use crate::obstacle::Polygon;
use crate::splat::Color;

fn one() -> f32 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObstacleDef {
    pub points: Vec<[f32; 2]>,
    #[serde(default)]
    pub expected: u32,
}

impl ObstacleDef {
    fn new(polygon: Polygon, expected: u32) -> Self {
        Self { points: polygon.to_array(), expected }
    }
}

/// A source that splats into the fluid every frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub begin: [f32; 2],
    pub end: [f32; 2],
    pub force: f32,
    pub color: Color,
    /// Multiplier on the default splat radius.
    #[serde(default = "one")]
    pub radius: f32,
}

impl Flow {
    pub fn direction(&self) -> Vec2 {
        Vec2::from(self.end) - Vec2::from(self.begin)
    }
}

/// One queued present: its size and spawn position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresentDef {
    pub size: [f32; 2],
    pub position: [f32; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Level {
    pub name: String,
    #[serde(default)]
    pub obstacles: Vec<ObstacleDef>,
    #[serde(default)]
    pub flows: Vec<Flow>,
    /// Spawned front to back.
    #[serde(default)]
    pub delivery_queue: Vec<PresentDef>,
    #[serde(default)]
    pub placeable_obstacles: u32,
}

impl Level {
    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path).with_context(|| format!("reading level {}", path.display()))?;
        let level: Self = serde_json::from_str(&data).with_context(|| format!("parsing level {}", path.display()))?;
        info!("loaded level '{}' from {}", level.name, path.display());
        Ok(level)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn expected_deliveries(&self) -> u32 {
        self.obstacles.iter().map(|o| o.expected).sum()
    }
}

/// Built-in levels, authored for a 1366 x 768 map.
pub mod builtin {
    use super::*;

    pub const MAP_SIZE: Vec2 = Vec2::new(1366.0, 768.0);
    pub const CAMPAIGN: [&str; 3] = ["01", "02", "03"];
    pub const NAMES: [&str; 6] = ["test", "01", "02", "03", "04", "finished"];

    const PRESENT: [f32; 2] = [50.0, 50.0];

    pub fn by_name(name: &str) -> Option<Level> {
        Some(match name {
            "test" => test(),
            "01" => map_01(),
            "02" => map_02(),
            "03" => map_03(),
            "04" => map_04(),
            "finished" => finished(),
            _ => return None,
        })
    }

    fn rect(min: Vec2, max: Vec2, expected: u32) -> ObstacleDef {
        ObstacleDef::new(Polygon::axis_aligned(min, max), expected)
    }

    fn regular(sides: u32, radius: f32, center: Vec2, expected: u32) -> ObstacleDef {
        let polygon = Polygon::regular(sides, radius, center).unwrap_or_else(|| Polygon::rectangle(center, center + 1.0));
        ObstacleDef::new(polygon, expected)
    }

    /// Triangles on a ring around `center`, each pointing outward.
    fn spikes(count: usize, sides: u32, ring: f32, length: f32, half_width: f32, center: Vec2) -> Vec<ObstacleDef> {
        let ring = match Polygon::regular(sides, ring, center) {
            Some(polygon) => polygon.points().to_vec(),
            None => return Vec::new(),
        };
        ring.into_iter()
            .take(count)
            .map(|v| {
                let dir = (v - center).normalize_or_zero();
                let orth = dir.perp();
                ObstacleDef {
                    points: vec![
                        (v + dir * length).to_array(),
                        (v - orth * half_width).to_array(),
                        (v + orth * half_width).to_array(),
                    ],
                    expected: 0,
                }
            })
            .collect()
    }

    fn flow(begin: Vec2, end: Vec2, color: Color, radius: f32) -> Flow {
        Flow { begin: begin.to_array(), end: end.to_array(), force: 20.0, color, radius }
    }

    /// Flow from a corner towards the map centre.
    fn corner_flow(from: Vec2, color: Color) -> Flow {
        let dir = (MAP_SIZE * 0.5 - from).normalize_or_zero();
        flow(from, from + dir * 100.0, color, 1.0)
    }

    fn queue(positions: &[Vec2]) -> Vec<PresentDef> {
        positions
            .iter()
            .map(|p| PresentDef { size: PRESENT, position: p.to_array() })
            .collect()
    }

    pub fn test() -> Level {
        let spawn = Vec2::new(500.0, 210.0);
        Level {
            name: "test".into(),
            obstacles: vec![
                rect(Vec2::new(256.0, 256.0), Vec2::new(512.0, 512.0), 1),
                rect(Vec2::new(600.0, 256.0), Vec2::new(800.0, 512.0), 1),
            ],
            flows: vec![Flow {
                force: 10.0,
                ..flow(Vec2::new(556.0, 256.0), Vec2::new(556.0, 512.0), [0.0, 0.0, 0.5], 1.0)
            }],
            delivery_queue: queue(&[spawn; 4]),
            placeable_obstacles: 0,
        }
    }

    pub fn map_01() -> Level {
        let source = Vec2::new(50.0, MAP_SIZE.y / 2.0);
        Level {
            name: "01".into(),
            obstacles: vec![
                rect(Vec2::new(683.0, 92.0), Vec2::new(883.0, 292.0), 1),
                rect(Vec2::new(683.0, 92.0 + 384.0), Vec2::new(883.0, 292.0 + 384.0), 1),
            ],
            flows: vec![flow(source, source + Vec2::new(200.0, 0.0), [0.0, 0.1, 0.5], 1.0)],
            delivery_queue: queue(&[source; 2]),
            placeable_obstacles: 3,
        }
    }

    pub fn map_02() -> Level {
        let center = MAP_SIZE * 0.5;
        let pos0 = Vec2::new(50.0, 50.0);
        let pos1 = Vec2::new(MAP_SIZE.x - 50.0, 50.0);
        let pos2 = MAP_SIZE - 50.0;

        let mut obstacles = vec![regular(5, 128.0, center, 6)];
        obstacles.extend(spikes(7, 8, 180.0, 100.0, 50.0, center));
        Level {
            name: "02".into(),
            obstacles,
            flows: vec![
                corner_flow(pos0, [0.4, 0.0, 0.0]),
                corner_flow(pos1, [0.0, 0.4, 0.0]),
                corner_flow(pos2, [0.0, 0.0, 0.4]),
            ],
            delivery_queue: queue(&[pos2, pos1, pos0, pos2, pos1, pos0, pos2]),
            placeable_obstacles: 4,
        }
    }

    pub fn map_03() -> Level {
        let source = Vec2::new(50.0, MAP_SIZE.y / 2.0);
        let source2 = Vec2::new(MAP_SIZE.x - source.x, source.y);
        let u = MAP_SIZE * 0.5;
        let width = 72.0;
        let half = 290.0 / 2.0;
        let begin = half - width;

        Level {
            name: "03".into(),
            obstacles: vec![
                rect(u + Vec2::new(begin, half), u + Vec2::new(half, -half), 1),
                rect(u + Vec2::new(-half, begin), u + Vec2::new(begin, half), 1),
                rect(u + Vec2::new(-half, -begin), u + Vec2::new(begin, -half), 1),
                rect(u - 32.0, u + 32.0, 2),
            ],
            flows: vec![
                flow(source, source + Vec2::new(200.0, 0.0), [0.0, 0.5, 0.4], 1.0),
                flow(source2, source2 - Vec2::new(200.0, 0.0), [0.7, 0.3, 0.4], 1.0),
            ],
            delivery_queue: queue(&[source; 6]),
            placeable_obstacles: 4,
        }
    }

    pub fn map_04() -> Level {
        let source = Vec2::new(50.0, MAP_SIZE.y / 3.0);
        let source2 = Vec2::new(50.0, 2.0 * MAP_SIZE.y / 3.0);
        let building = 64.0;
        let spacing = 256.0;
        let offset = (MAP_SIZE - Vec2::new(spacing * 4.0, spacing * 2.0)) / 2.0;

        let mut obstacles = Vec::new();
        for ix in 0..5u32 {
            for iy in 0..3u32 {
                let pos = Vec2::new(ix as f32, iy as f32) * spacing + offset;
                let expected = u32::from(ix + iy > 2);
                obstacles.push(rect(pos - building, pos + building, expected));
            }
        }
        let sources: Vec<Vec2> = (0..10).map(|i| if i % 2 == 0 { source2 } else { source }).collect();
        Level {
            name: "04".into(),
            obstacles,
            flows: vec![
                flow(source, source + Vec2::new(200.0, 0.0), [0.8, 0.0, 0.9], 0.5),
                flow(source2, source2 + Vec2::new(200.0, 0.0), [0.3, 0.9, 0.4], 0.5),
            ],
            delivery_queue: queue(&sources),
            placeable_obstacles: 5,
        }
    }

    /// Shown once the campaign is won.
    pub fn finished() -> Level {
        let center = MAP_SIZE * 0.5;
        let mut obstacles = vec![regular(6, 128.0, center, 0)];
        obstacles.extend(spikes(12, 12, 180.0, 80.0, 40.0, center));
        let black = [0.0; 3];
        Level {
            name: "finished".into(),
            obstacles,
            flows: vec![
                corner_flow(Vec2::new(50.0, 50.0), black),
                corner_flow(Vec2::new(MAP_SIZE.x - 50.0, 50.0), black),
                corner_flow(MAP_SIZE - 50.0, black),
                corner_flow(Vec2::new(50.0, MAP_SIZE.y - 50.0), black),
            ],
            delivery_queue: Vec::new(),
            placeable_obstacles: 0,
        }
    }
}

/// Where the player stands in the campaign.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Level(usize),
    Won,
}

#[derive(Debug, Clone)]
pub struct LevelCatalog {
    levels: Vec<Level>,
    progress: Progress,
}

impl LevelCatalog {
    pub fn new(levels: Vec<Level>) -> Self {
        let progress = if levels.is_empty() { Progress::Won } else { Progress::Level(0) };
        Self { levels, progress }
    }

    pub fn campaign() -> Self {
        Self::new(builtin::CAMPAIGN.iter().filter_map(|name| builtin::by_name(name)).collect())
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn current(&self) -> Option<&Level> {
        match self.progress {
            Progress::Level(i) => self.levels.get(i),
            Progress::Won => None,
        }
    }

    /// Moves to the next level; `None` once the last one has been completed.
    pub fn advance(&mut self) -> Option<&Level> {
        self.progress = match self.progress {
            Progress::Level(i) if i + 1 < self.levels.len() => Progress::Level(i + 1),
            _ => Progress::Won,
        };
        self.current()
    }

    pub fn is_won(&self) -> bool {
        self.progress == Progress::Won
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}
