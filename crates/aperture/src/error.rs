use aperture_core::prelude::BufferError;
use aperture_pipeline::prelude::FactoryError;

use crate::session::SessionState;

/// Errors surfaced by the session controller.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("{op} not valid in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
    #[error("pipeline graph error: {0}")]
    Factory(#[from] FactoryError),
    #[error("buffer pool setup failed: {0}")]
    PoolSetup(#[from] BufferError),
    #[error("frame mint failed")]
    MintFailed,
    #[error("still capture already in progress")]
    CaptureBusy,
    #[error("setup thread failed")]
    SetupThread,
}

impl SessionError {
    /// Stable string code for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::InvalidState { .. } => "invalid_state",
            SessionError::Factory(_) => "factory_error",
            SessionError::PoolSetup(_) => "pool_setup_failed",
            SessionError::MintFailed => "mint_failed",
            SessionError::CaptureBusy => "capture_busy",
            SessionError::SetupThread => "setup_thread_failed",
        }
    }

    /// Whether the error may succeed when retried.
    pub fn retryable(&self) -> bool {
        matches!(self, SessionError::CaptureBusy)
    }
}
