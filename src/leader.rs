//! Leadership observation contracts consumed by the service.
//!
//! The actual election/observation backend (a coordination store, a static
//! address, ...) lives outside this crate and plugs in through these traits.

use std::sync::Arc;

use crate::ids::{FencingToken, JobId};

/// Receives leadership changes for one job.
///
/// Calls may arrive from any thread, may repeat a previous announcement and
/// may be reordered relative to the real sequence of elections.
pub trait LeaderListener: Send + Sync {
    /// A leader was announced, or leadership was lost when `address` is
    /// `None` or empty.
    fn notify_leader_address(&self, address: Option<&str>, token: Option<FencingToken>);

    /// Observation itself failed.
    fn handle_error(&self, cause: anyhow::Error);
}

/// Observes leadership of one job.
///
/// `start` may notify `listener` before it returns, and `stop` may be called
/// while `start` is still running on the same thread.
pub trait LeaderSubscription: Send + Sync {
    fn start(&self, listener: Arc<dyn LeaderListener>) -> anyhow::Result<()>;

    /// Ends observation. Must be idempotent.
    fn stop(&self) -> anyhow::Result<()>;
}

/// Creates a [`LeaderSubscription`] per job.
pub trait LeaderSource: Send + Sync {
    fn subscription(
        &self,
        job_id: &JobId,
        default_target_address: &str,
    ) -> anyhow::Result<Box<dyn LeaderSubscription>>;
}
