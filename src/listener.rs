use std::sync::Arc;

use crate::ids::{FencingToken, JobId};
use crate::registration::{JobMasterGateway, RegistrationSuccess};

/// Callbacks the embedding application receives for monitored jobs.
///
/// Only outcomes of the currently relevant leadership term are delivered.
/// Callbacks run without any internal lock held, so implementations may call
/// straight back into the service (e.g. `reconnect`).
pub trait JobLeaderListener: Send + Sync {
    fn job_manager_gained_leadership(
        &self,
        job_id: &JobId,
        gateway: Arc<dyn JobMasterGateway>,
        registration: RegistrationSuccess,
    );

    fn job_manager_lost_leadership(&self, job_id: &JobId, token: FencingToken);

    fn handle_error(&self, cause: anyhow::Error);
}
