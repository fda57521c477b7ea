use thiserror::Error;

use crate::ids::JobId;

#[derive(Debug, Error)]
pub enum Error {
    /// Operation issued outside the lifecycle state it requires, or an
    /// internal invariant was found broken. Never retried.
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("leader subscription for job {job_id} failed: {source}")]
    Subscription {
        job_id: JobId,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid config: {0}")]
    Config(String),
    #[error("registration at {address} rejected: {reason}")]
    Rejected { address: String, reason: String },
}

impl Error {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    pub(crate) fn subscription(job_id: &JobId, source: anyhow::Error) -> Self {
        Error::Subscription {
            job_id: job_id.clone(),
            source,
        }
    }

    /// True for programming defects as opposed to forwarded runtime failures.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalState(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
