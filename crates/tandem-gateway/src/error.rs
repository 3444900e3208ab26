use thiserror::Error;

use crate::session::SessionState;

/// Failure of one session operation. None of these end the session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The request was malformed (messaging yourself, blank content, ...).
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// The transition is not allowed from the current state.
    #[error("operation not allowed while {0:?}")]
    InvalidState(SessionState),

    /// The store failed; nothing was written and nothing was broadcast.
    #[error("operation failed: {0}")]
    Operational(#[from] anyhow::Error),
}

impl SessionError {
    /// Stable code reported to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::InvalidState(_) => "invalid_state",
            Self::Operational(_) => "operational",
        }
    }
}
