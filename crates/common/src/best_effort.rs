//! Disposition type for sub-operations whose failure must not abort the caller.
//!
//! Clock sync, device-model lookup and similar calls are attempted, and a
//! failure is logged and recorded as `Ignored` instead of being propagated.

use std::fmt::Display;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BestEffort<T> {
    Done(T),
    Ignored {
        operation: &'static str,
        reason: String,
    },
}

impl<T> BestEffort<T> {
    /// Record the outcome of `operation`, logging the reason when it failed.
    pub fn from_result<E: Display>(operation: &'static str, result: Result<T, E>) -> Self {
        match result {
            Ok(value) => BestEffort::Done(value),
            Err(err) => {
                let reason = err.to_string();
                debug!(operation, reason = %reason, "best-effort operation ignored");
                BestEffort::Ignored { operation, reason }
            }
        }
    }

    pub fn ok(self) -> Option<T> {
        match self {
            BestEffort::Done(value) => Some(value),
            BestEffort::Ignored { .. } => None,
        }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, BestEffort::Ignored { .. })
    }
}
