//! Side-effecting operations: filesystem state, snapshots, subprocesses.
//!
//! Everything here is reachable through a trait seam or a plain function that
//! takes explicit paths, so tests can drive it against a temp directory.

pub mod change_gate;
pub mod check;
pub mod config;
pub mod executor;
pub mod feedback;
pub mod history;
pub mod lock;
pub mod paths;
pub mod process;
pub mod project;
pub mod prompt;
pub mod scaffold;
pub mod snapshot;
pub mod state;
