//! Engine error taxonomy
//!
//! Only two things are hard failures here: a configuration that cannot be
//! honored, rejected at construction time, and an invariant violation that
//! signals a modeling bug. Data gaps and guard rejections are not errors;
//! they turn into safe no-op decisions at the call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected at construction: threshold out of range, contradictory flags
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A state the model claims is unreachable was reached. Do not recover.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}
