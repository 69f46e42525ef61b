//! The boundary every portal action returns through.
//!
//! Callers never see a panic or a raw store error: each outcome becomes
//! `Success` or `Failure { error }` with a message fit for the user.
use tracing::error;

use crate::error::WorkflowError;
use crate::types::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResponse<T> {
    Success(T),
    Failure { error: String },
}

impl<T> ActionResponse<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ActionResponse::Success(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ActionResponse::Success(_) => None,
            ActionResponse::Failure { error } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            ActionResponse::Success(value) => Ok(value),
            ActionResponse::Failure { error } => Err(error),
        }
    }
}

impl<T> From<Result<T, WorkflowError>> for ActionResponse<T> {
    fn from(result: Result<T, WorkflowError>) -> Self {
        match result {
            Ok(value) => ActionResponse::Success(value),
            Err(err) => {
                if err.is_unexpected() {
                    error!(error = %err, "portal action failed");
                }
                ActionResponse::Failure {
                    error: err.user_message(),
                }
            }
        }
    }
}

/// Run `action` for an authenticated caller. A missing session fails with
/// `Unauthorized` before the action runs.
pub fn respond<T>(
    session: Option<&Session>,
    action: impl FnOnce(&Session) -> Result<T, WorkflowError>,
) -> ActionResponse<T> {
    match session {
        Some(session) => action(session).into(),
        None => Err(WorkflowError::Unauthorized).into(),
    }
}
