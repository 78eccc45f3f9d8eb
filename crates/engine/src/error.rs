use halo_core::prelude::{PoolError, Resolution};

use crate::units::UnitError;

/// Errors surfaced by the pipeline API.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Camera index outside 0..4.
    #[error("camera index {0} out of range")]
    InvalidCamera(usize),
    /// A submitted camera buffer does not match the configured geometry.
    #[error("camera buffer geometry mismatch: expected {expected}, got {got}")]
    GeometryMismatch { expected: Resolution, got: Resolution },
    /// A viewpoint update was requested while another is still pending.
    #[error("a viewpoint update is already pending")]
    UpdatePending,
    /// The pipeline has been closed.
    #[error("pipeline is shutting down")]
    Terminated,
    /// A required collaborator was not supplied to the builder.
    #[error("pipeline misconfigured: missing {0}")]
    Misconfigured(&'static str),
    /// A worker thread could not be spawned.
    #[error("worker thread spawn failed: {0}")]
    Spawn(#[from] std::io::Error),
    /// An internal consistency check failed.
    #[error("composition invariant violated: {0}")]
    InvariantViolation(&'static str),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("accelerator error: {0}")]
    Unit(#[from] UnitError),
}

impl EngineError {
    /// Stable machine-readable identifier for logs and counters.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidCamera(_) => "invalid_camera",
            EngineError::GeometryMismatch { .. } => "geometry_mismatch",
            EngineError::UpdatePending => "update_pending",
            EngineError::Terminated => "terminated",
            EngineError::Misconfigured(_) => "misconfigured",
            EngineError::Spawn(_) => "spawn",
            EngineError::InvariantViolation(_) => "invariant",
            EngineError::Pool(_) => "pool",
            EngineError::Unit(_) => "unit",
        }
    }

    /// Whether retrying the same call later can succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UpdatePending | EngineError::Unit(_) | EngineError::Pool(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EngineError::InvalidCamera(7).code(), "invalid_camera");
        assert_eq!(EngineError::UpdatePending.code(), "update_pending");
        assert!(EngineError::UpdatePending.retryable());
        assert!(!EngineError::Terminated.retryable());
    }
}
