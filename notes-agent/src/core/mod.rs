//! Pure, deterministic workflow logic.
//!
//! Nothing in this module touches the filesystem or spawns processes.

pub mod classifier;
pub mod decision;
pub mod line_diff;
pub mod path;
pub mod plan;
pub mod stage;
pub mod types;
