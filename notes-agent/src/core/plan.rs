//! Which stages a start or resume still has to execute.

use thiserror::Error;

use crate::core::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid stage range: {from} is after {to}")]
pub struct RangeError {
    pub from: Stage,
    pub to: Stage,
}

/// Validate `from..=to` before any side effect.
pub fn validate_range(from: Stage, to: Stage) -> Result<(), RangeError> {
    if from > to {
        return Err(RangeError { from, to });
    }
    Ok(())
}

/// Remaining stages of a run.
///
/// Continues after `last_completed` when it falls inside the run's range, so
/// a succeeded stage is never executed twice. `restart_from` is the explicit
/// request to rewind and wins over `last_completed`.
pub fn remaining_stages(
    from: Stage,
    to: Stage,
    last_completed: Option<Stage>,
    restart_from: Option<Stage>,
) -> Result<Vec<Stage>, RangeError> {
    validate_range(from, to)?;
    if let Some(restart) = restart_from {
        validate_range(restart, to)?;
        return Ok(Stage::range(restart, to));
    }
    let start = match last_completed {
        Some(done) if done >= from => match done.next() {
            Some(next) => next,
            None => return Ok(Vec::new()),
        },
        _ => from,
    };
    Ok(Stage::range(start, to))
}
