//! Worker-side job leader tracking.
//!
//! For every job it runs, a worker has to know which coordinator currently
//! leads the job and keep a registration with that leader alive. Leadership
//! moves on failover; [`JobLeaderService`] follows those moves, replaces
//! stale registrations and reports only outcomes of the current leadership
//! term to the embedding application.

pub mod config;
pub mod error;
pub mod ids;
pub mod leader;
pub mod listener;
pub mod registration;
pub mod service;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tracker;

pub use config::{RetryConfig, ServiceConfig};
pub use error::{Error, Result};
pub use ids::{FencingToken, JobId, WorkerLocation};
pub use leader::{LeaderListener, LeaderSource, LeaderSubscription};
pub use listener::JobLeaderListener;
pub use registration::{
    AttemptState, ConnectionAttempt, ConnectionAttemptFactory, JobMasterGateway,
    RegistrationListener, RegistrationRequest, RegistrationResponse, RegistrationSuccess,
    RetryingConnection, RetryingConnectionFactory, RpcError, Transport,
};
pub use service::{JobLeaderService, ServiceState};
pub use tracker::JobLeaderTracker;
