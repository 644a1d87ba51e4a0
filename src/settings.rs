use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

/// Tunables for the fluid solver, the rigid-body coupling and the delivery game.
///
/// Every field has a default, so partial JSON files load fine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationSettings {
    /// Shorter grid axis of the velocity/pressure grids.
    pub sim_resolution: u32,
    /// Shorter grid axis of the dye grid.
    pub dye_resolution: u32,
    /// Multiplicative velocity decay per advection step.
    pub velocity_dissipation: f32,
    /// Multiplicative dye decay per advection step.
    pub density_dissipation: f32,
    /// Pressure is multiplied by this before the Jacobi iterations start. Kept in `0..=1`; values
    /// near 1 reuse most of the previous frame's solution, 0 restarts the solve every frame.
    pub pressure: f32,
    pub pressure_iterations: u32,
    /// Vorticity confinement strength.
    pub curl: f32,
    /// Default splat radius in percent of the grid.
    pub splat_radius: f32,
    /// Pointer delta to velocity multiplier.
    pub splat_force: f32,
    /// Upper bound on a single step's time delta, in seconds.
    pub max_dt: f32,
    pub paused: bool,

    pub bloom: bool,
    pub bloom_resolution: u32,
    pub bloom_iterations: u32,
    pub sunrays: bool,
    pub sunrays_resolution: u32,

    // Actor coupling
    pub coupling_strength: f32,
    pub angular_strength: f32,
    pub sample_epsilon: f32,
    pub actor_density: f32,
    pub actor_linear_damping: f32,
    pub actor_angular_damping: f32,

    // Game
    pub map_size: [f32; 2],
    pub min_placement_span: f32,
    pub min_obstacle_extent: f32,
    pub spawn_interval: f32,
    pub seed: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            sim_resolution: 128,
            dye_resolution: 1024,
            velocity_dissipation: 0.99,
            density_dissipation: 0.98,
            pressure: 0.8,
            pressure_iterations: 20,
            curl: 30.0,
            splat_radius: 0.25,
            splat_force: 6000.0,
            max_dt: 1.0 / 60.0,
            paused: false,

            bloom: true,
            bloom_resolution: 256,
            bloom_iterations: 8,
            sunrays: true,
            sunrays_resolution: 196,

            coupling_strength: 25.0,
            angular_strength: 4.0,
            sample_epsilon: 1.0e-4,
            actor_density: 0.001,
            actor_linear_damping: 2.0,
            actor_angular_damping: 2.0,

            map_size: [1366.0, 768.0],
            min_placement_span: 20.0,
            min_obstacle_extent: 1.0,
            spawn_interval: 2.0,
            seed: 0x5eed,
        }
    }
}

impl SimulationSettings {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> anyhow::Result<Self> {
        let data = fs::read_to_string(path)?;
        let mut settings: Self = serde_json::from_str(&data)?;
        settings.sanitize();
        Ok(settings)
    }

    pub fn save_to_disk(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.sim_resolution = self.sim_resolution.clamp(8, 2048);
        self.dye_resolution = self.dye_resolution.clamp(8, 4096);
        self.velocity_dissipation = self.velocity_dissipation.clamp(0.0, 1.0);
        self.density_dissipation = self.density_dissipation.clamp(0.0, 1.0);
        self.pressure = self.pressure.clamp(0.0, 1.0);
        self.pressure_iterations = self.pressure_iterations.clamp(1, 10_000);
        self.curl = self.curl.clamp(0.0, 100.0);
        self.splat_radius = self.splat_radius.clamp(0.01, 1.0);
        self.splat_force = self.splat_force.clamp(0.0, 100_000.0);
        // A zero clamp would freeze the solver for good.
        self.max_dt = self.max_dt.clamp(1.0e-4, 0.1);

        self.bloom_resolution = self.bloom_resolution.clamp(8, 2048);
        self.bloom_iterations = self.bloom_iterations.clamp(1, 16);
        self.sunrays_resolution = self.sunrays_resolution.clamp(8, 2048);

        self.coupling_strength = self.coupling_strength.clamp(0.0, 10_000.0);
        self.angular_strength = self.angular_strength.clamp(0.0, 10_000.0);
        self.sample_epsilon = self.sample_epsilon.clamp(1.0e-8, 1.0);
        self.actor_density = self.actor_density.clamp(1.0e-6, 100.0);
        self.actor_linear_damping = self.actor_linear_damping.clamp(0.0, 100.0);
        self.actor_angular_damping = self.actor_angular_damping.clamp(0.0, 100.0);

        for side in &mut self.map_size {
            *side = side.clamp(16.0, 16_384.0);
        }
        self.min_placement_span = self.min_placement_span.clamp(0.0, 1_000.0);
        self.min_obstacle_extent = self.min_obstacle_extent.clamp(0.0, 1_000.0);
        self.spawn_interval = self.spawn_interval.clamp(0.05, 60.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let settings: SimulationSettings =
            serde_json::from_str(r#"{ "pressure_iterations": 40, "curl": 12.5 }"#).unwrap();
        assert_eq!(settings.pressure_iterations, 40);
        assert_eq!(settings.curl, 12.5);
        assert_eq!(settings.sim_resolution, SimulationSettings::default().sim_resolution);
    }

    #[test]
    fn test_default_pressure_decay_is_a_warm_start() {
        let mut settings = SimulationSettings::default();
        assert!(settings.pressure > 0.0 && settings.pressure <= 1.0);
        settings.sanitize();
        assert_eq!(settings.pressure, SimulationSettings::default().pressure);
    }

    #[test]
    fn test_sanitize_clamps_out_of_range_values() {
        let mut settings = SimulationSettings {
            max_dt: 0.0,
            pressure: 3.0,
            pressure_iterations: 0,
            velocity_dissipation: -1.0,
            ..Default::default()
        };
        settings.sanitize();
        assert!(settings.max_dt > 0.0, "max_dt must stay positive");
        assert_eq!(settings.pressure, 1.0);
        assert_eq!(settings.pressure_iterations, 1);
        assert_eq!(settings.velocity_dissipation, 0.0);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("fluid-courier-settings-{}", std::process::id()));
        let path = dir.join("nested").join(SETTINGS_FILE_NAME);
        let settings = SimulationSettings {
            sim_resolution: 64,
            seed: 42,
            ..Default::default()
        };
        settings.save_to_disk(&path).unwrap();
        let loaded = SimulationSettings::load_from_disk(&path).unwrap();
        assert_eq!(loaded, settings);
        let _ = fs::remove_dir_all(&dir);
    }
}
