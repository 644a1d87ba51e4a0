//! Fluid delivery game core: a stable-fluids solver on a pluggable compute backend, rigid-body
//! actors pushed around by the flow, and goals that count what reaches them.

pub mod actor;
pub mod coupling;
pub mod delivery;
pub mod grid;
pub mod level;
pub mod obstacle;
pub mod physics;
pub mod render;
pub mod settings;
pub mod simulation;
pub mod solver;
pub mod splat;
