use std::convert::Infallible;
use std::time::Duration;

use sled::transaction::TransactionError;

/// Message returned for reverting a locked form without going through an approval request.
pub const REVERT_SUBMITTED_MESSAGE: &str =
    "Cannot revert a submitted form to draft directly. Request edit access first.";

/// Message shown whenever an unexpected storage failure is hidden from the caller.
pub const GENERIC_FAILURE_MESSAGE: &str = "Failed to save. Please try again.";

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    State(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Collection manager session not found. Please log in again.")]
    SessionNotFound,
    #[error("Session mismatch")]
    SessionMismatch,
    #[error("Collection manager session expired. Please log in again.")]
    SessionExpired,
    #[error("The operation exceeded its {0:?} transaction budget. Please try again.")]
    TransactionTimeout(Duration),
    #[error("storage failure: {0}")]
    Store(#[from] sled::Error),
    #[error("encoding failure: {0}")]
    Encode(String),
    #[error("decoding failure: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("internal failure: {0}")]
    Internal(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }
    pub fn state(reason: impl Into<String>) -> Self {
        Self::State(reason.into())
    }
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// True for failures the caller cannot correct by changing its input.
    pub fn is_unexpected(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Encode(_) | Self::Decode(_) | Self::Internal(_)
        )
    }

    /// The message handed back across the action boundary.
    pub fn user_message(&self) -> String {
        if self.is_unexpected() {
            GENERIC_FAILURE_MESSAGE.to_string()
        } else {
            self.to_string()
        }
    }
}

impl From<minicbor::encode::Error<Infallible>> for WorkflowError {
    fn from(value: minicbor::encode::Error<Infallible>) -> Self {
        Self::Encode(value.to_string())
    }
}

impl From<TransactionError<WorkflowError>> for WorkflowError {
    fn from(value: TransactionError<WorkflowError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => Self::Store(err),
        }
    }
}
