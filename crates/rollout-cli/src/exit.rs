//! Process exit codes.
//!
//! | code | meaning |
//! |------|---------|
//! | 0 | stable / command succeeded |
//! | 1 | usage, config, or local I/O error |
//! | 2 | fatal rollout error (nothing left half-done by the tool) |
//! | 3 | timed out, no rollback attempted |
//! | 4 | timed out and rolled back |
//! | 5 | rollback attempted and failed |

use rollout_core::types::RolloutOutcome;
use rollout_core::RolloutError;

pub const SUCCESS: i32 = 0;
pub const USAGE: i32 = 1;
pub const FATAL: i32 = 2;
pub const TIMED_OUT: i32 = 3;
pub const ROLLED_BACK: i32 = 4;
pub const ROLLBACK_FAILED: i32 = 5;

/// Exit code for the final outcome of a `deploy`.
pub fn for_outcome(outcome: RolloutOutcome) -> i32 {
    match outcome {
        RolloutOutcome::Stable => SUCCESS,
        RolloutOutcome::TimedOut | RolloutOutcome::Pending => TIMED_OUT,
        RolloutOutcome::RolledBack => ROLLED_BACK,
        RolloutOutcome::Failed => ROLLBACK_FAILED,
    }
}

pub fn for_error(err: &anyhow::Error) -> i32 {
    let Some(rollout) = err.downcast_ref::<RolloutError>() else {
        return USAGE;
    };
    match rollout.inner() {
        RolloutError::InvalidServiceRef(_)
        | RolloutError::InvalidOutcome(_)
        | RolloutError::SessionDb(_)
        | RolloutError::Io(_)
        | RolloutError::Yaml(_)
        | RolloutError::Json(_) => USAGE,
        _ => FATAL,
    }
}
