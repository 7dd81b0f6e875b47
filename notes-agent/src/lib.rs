//! Round-based generation workflow for a study-notes agent.
//!
//! A project turns a read-only snapshot of course material into notes by
//! running fixed stages (`round0` through `final`) through an external
//! generation tool, validating and measuring each stage before moving on.
//!
//! - **[`core`]**: Pure, deterministic logic (stage order, failure
//!   classification, decision policy, line diffs). No I/O.
//! - **[`io`]**: Filesystem state, snapshots, subprocesses, checks and
//!   prompts. Side effects sit behind the `Executor` and `CheckRunner` traits.
//!
//! [`workflow`] is the state machine; [`stage`] runs one stage of it.

pub mod core;
pub mod errors;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod stage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workflow;
