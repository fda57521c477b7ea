//! Registration of this worker at a job's leader.
//!
//! A [`ConnectionAttempt`] registers at one target address under one fencing
//! token and keeps retrying until it succeeds, is rejected for good, or is
//! closed. The tracker only ever talks to attempts through this trait;
//! [`RetryingConnection`] is the implementation used in production.

pub mod retrying;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::ids::{FencingToken, JobId, WorkerLocation};

pub use retrying::{RetryingConnection, RetryingConnectionFactory};

/// Lifecycle of a connection attempt. `Closed` is terminal and reachable from
/// every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    Succeeded,
    Failed,
    Closed,
}

/// One retrying registration bound to `(target_address, fencing_token)`.
///
/// Implementations must tolerate every method being called from any thread,
/// including from inside their own completion callbacks.
pub trait ConnectionAttempt: Send + Sync {
    fn target_address(&self) -> &str;

    fn fencing_token(&self) -> FencingToken;

    /// Begins registering. A second call, or a call after [`close`], does
    /// nothing.
    ///
    /// [`close`]: ConnectionAttempt::close
    fn start(&self);

    /// Cancels pending retries and releases resources. Idempotent.
    fn close(&self);

    /// Registers again right away. Returns `false` if the attempt is no
    /// longer live.
    fn try_reconnect(&self) -> bool;

    fn state(&self) -> AttemptState;
}

/// Completion hooks of a [`ConnectionAttempt`]. Each registration round fires
/// exactly one of the two.
pub trait RegistrationListener: Send + Sync {
    fn registration_succeeded(
        &self,
        token: FencingToken,
        gateway: Arc<dyn JobMasterGateway>,
        success: RegistrationSuccess,
    );

    fn registration_failed(&self, token: FencingToken, cause: anyhow::Error);
}

/// Builds the attempt for a newly announced leader.
pub trait ConnectionAttemptFactory: Send + Sync {
    fn create(
        &self,
        job_id: &JobId,
        target_address: &str,
        token: FencingToken,
        listener: Arc<dyn RegistrationListener>,
    ) -> Arc<dyn ConnectionAttempt>;
}

impl<F> ConnectionAttemptFactory for F
where
    F: Fn(&JobId, &str, FencingToken, Arc<dyn RegistrationListener>) -> Arc<dyn ConnectionAttempt>
        + Send
        + Sync,
{
    fn create(
        &self,
        job_id: &JobId,
        target_address: &str,
        token: FencingToken,
        listener: Arc<dyn RegistrationListener>,
    ) -> Arc<dyn ConnectionAttempt> {
        self(job_id, target_address, token, listener)
    }
}

/// What the worker sends when registering at a job leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub job_id: JobId,
    pub owner_address: String,
    pub location: WorkerLocation,
    pub token: FencingToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSuccess {
    /// Resource id of the job leader that accepted the registration.
    pub leader_resource_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationResponse {
    Success(RegistrationSuccess),
    /// Refused for now; retried after the refused delay.
    Decline(String),
    /// Refused for good; retrying stops.
    Rejection(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    #[error("registration call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{address} unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("{0}")]
    Other(String),
}

/// Remote handle of a job leader.
pub trait JobMasterGateway: Send + Sync {
    fn address(&self) -> &str;

    /// Performs one registration call, giving up after `timeout`.
    fn register_worker(
        &self,
        request: &RegistrationRequest,
        timeout: Duration,
    ) -> Result<RegistrationResponse, RpcError>;
}

/// Resolves addresses to gateways.
pub trait Transport: Send + Sync {
    fn connect(&self, address: &str) -> Result<Arc<dyn JobMasterGateway>, RpcError>;
}
