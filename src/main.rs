//! Headless runner: plays a level (or the whole campaign) for a number of frames and logs what
//! happens.
//!
//! ```bash
//! # Campaign on the software backend, spawning presents as soon as each level loads
//! fluid-courier --spawn
//!
//! # One built-in level on the GPU
//! fluid-courier --backend gpu --level 02 --frames 7200 --spawn
//!
//! # A level file with custom settings
//! fluid-courier --level my_level.json --settings fluid_settings.json
//! ```

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::{info, warn};

use fluid_courier::level::{builtin, Level, LevelCatalog};
use fluid_courier::physics::rapier::RapierWorld;
use fluid_courier::render::cpu::CpuBackend;
use fluid_courier::render::gpu::GpuBackend;
use fluid_courier::render::RenderBackend;
use fluid_courier::settings::SimulationSettings;
use fluid_courier::simulation::{LevelStatus, SimulationState};

const PROGRESS_INTERVAL: u64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    Cpu,
    Gpu,
}

#[derive(Parser, Debug)]
#[command(name = "fluid-courier")]
#[command(about = "Fluid delivery game, run headless")]
#[command(version)]
struct Args {
    /// Built-in level name (test, 01, 02, 03, 04, finished) or a level JSON file.
    /// Plays the campaign when omitted.
    #[arg(short, long)]
    level: Option<String>,

    /// Frames to simulate, at the settings' maximum time step each
    #[arg(short, long, default_value_t = 3600)]
    frames: u64,

    /// Settings JSON file; defaults to fluid_settings.json in the working directory if present
    #[arg(short, long)]
    settings: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = BackendKind::Cpu)]
    backend: BackendKind,

    /// Viewport the grids are sized for, as WIDTHxHEIGHT
    #[arg(long, default_value = "683x384", value_parser = parse_viewport)]
    viewport: (u32, u32),

    /// Start the delivery queue as soon as each level loads
    #[arg(long)]
    spawn: bool,

    /// Write the effective settings back to disk before running
    #[arg(long)]
    save_settings: bool,
}

fn parse_viewport(s: &str) -> Result<(u32, u32), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{s}'"))?;
    let w: u32 = w.trim().parse().map_err(|_| format!("bad width '{w}'"))?;
    let h: u32 = h.trim().parse().map_err(|_| format!("bad height '{h}'"))?;
    if w == 0 || h == 0 {
        return Err("viewport must be non-empty".into());
    }
    Ok((w, h))
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<(SimulationSettings, PathBuf)> {
    match path {
        Some(path) => {
            let settings = SimulationSettings::load_from_disk(path)
                .with_context(|| format!("loading settings from {}", path.display()))?;
            Ok((settings, path.to_path_buf()))
        }
        None => {
            let path = SimulationSettings::default_path();
            let settings = if path.exists() {
                SimulationSettings::load_from_disk(&path).unwrap_or_else(|err| {
                    warn!("ignoring {}: {err:#}", path.display());
                    SimulationSettings::default()
                })
            } else {
                SimulationSettings::default()
            };
            Ok((settings, path))
        }
    }
}

fn load_catalog(level: Option<&str>) -> anyhow::Result<LevelCatalog> {
    let Some(name) = level else {
        return Ok(LevelCatalog::campaign());
    };
    let level = match builtin::by_name(name) {
        Some(level) => level,
        None => Level::load_from_disk(Path::new(name))?,
    };
    Ok(LevelCatalog::new(vec![level]))
}

fn run<B: RenderBackend>(
    backend: B,
    settings: SimulationSettings,
    viewport: (u32, u32),
    mut catalog: LevelCatalog,
    frames: u64,
    spawn: bool,
) -> anyhow::Result<()> {
    let level = catalog.current().cloned().unwrap_or_else(builtin::finished);
    let dt = settings.max_dt;
    let mut sim = SimulationState::new(backend, RapierWorld::new(), settings, viewport, level)?;
    if spawn {
        sim.start_spawning()?;
    }

    let mut delivered = 0usize;
    for frame in 1..=frames {
        let report = sim.update(dt)?;
        delivered += report.deliveries.len();

        if frame % PROGRESS_INTERVAL == 0 {
            info!(
                "frame {frame}: level '{}', {} actors, {} queued, {} deliveries remaining",
                sim.level().name,
                sim.actors().len(),
                sim.queued_presents(),
                sim.remaining_deliveries()
            );
        }

        match report.status {
            LevelStatus::Playing => {}
            LevelStatus::Completed => {
                if sim.advance_level(&mut catalog)? == LevelStatus::Won {
                    break;
                }
                info!("loaded level '{}'", sim.level().name);
                if spawn {
                    sim.start_spawning()?;
                }
            }
            LevelStatus::Won => break,
        }
    }

    match sim.status() {
        LevelStatus::Won => info!("campaign won after {delivered} deliveries"),
        _ => info!(
            "stopped in level '{}' after {delivered} deliveries, {} still expected",
            sim.level().name,
            sim.remaining_deliveries()
        ),
    }
    sim.shutdown();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let (settings, settings_path) = load_settings(args.settings.as_deref())?;
    if args.save_settings {
        settings
            .save_to_disk(&settings_path)
            .with_context(|| format!("saving settings to {}", settings_path.display()))?;
        info!("settings saved to {}", settings_path.display());
    }
    let catalog = load_catalog(args.level.as_deref())?;

    match args.backend {
        BackendKind::Cpu => run(CpuBackend::new(), settings, args.viewport, catalog, args.frames, args.spawn),
        BackendKind::Gpu => {
            let backend = GpuBackend::new_headless().context("creating GPU backend")?;
            run(backend, settings, args.viewport, catalog, args.frames, args.spawn)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_viewport() {
        assert_eq!(parse_viewport("640x360"), Ok((640, 360)));
        assert_eq!(parse_viewport("1366X768"), Ok((1366, 768)));
        assert!(parse_viewport("640").is_err());
        assert!(parse_viewport("0x10").is_err());
    }

    #[test]
    fn test_catalog_from_builtin_name() {
        let catalog = load_catalog(Some("02")).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.current().unwrap().name, "02");
        assert_eq!(load_catalog(None).unwrap().len(), builtin::CAMPAIGN.len());
    }
}
