use thiserror::Error;

use crate::types::{JobId, TqId};

#[derive(Error, Debug)]
pub enum TqError {
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("No job matched after {0} attempts due to contention")]
    MatchRetriesExhausted(u32),

    #[error("Task queue not found: {0}")]
    QueueNotFound(TqId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TqError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        TqError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TqError>;
