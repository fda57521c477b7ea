//! Per-job leader tracking.
//!
//! A [`JobLeaderTracker`] listens to the leader subscription of one job and
//! keeps at most one [`ConnectionAttempt`] open to the announced leader. Every
//! attempt is bound to the fencing token it was opened for; completions whose
//! token is no longer the current one are stale and dropped.
//!
//! Tracker state only changes under its mutex. Attempts are started, closed
//! and reconnected, and the [`JobLeaderListener`] is called, only after that
//! mutex has been released, so any of them may call straight back in.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::{Error, Result};
use crate::ids::{FencingToken, JobId};
use crate::leader::LeaderListener;
use crate::listener::JobLeaderListener;
use crate::registration::{
    ConnectionAttempt, ConnectionAttemptFactory, JobMasterGateway, RegistrationListener,
    RegistrationSuccess,
};

/// Collaborators shared by every tracker of one service.
pub(crate) struct TrackerContext {
    pub(crate) listener: Arc<dyn JobLeaderListener>,
    pub(crate) attempts: Arc<dyn ConnectionAttemptFactory>,
    pub(crate) log_target: Arc<str>,
}

pub struct JobLeaderTracker {
    job_id: JobId,
    context: Arc<TrackerContext>,
    state: Mutex<TrackerState>,
    this: Weak<JobLeaderTracker>,
}

#[derive(Default)]
struct TrackerState {
    /// The fencing token and the attempt opened for it, always set together.
    active: Option<ActiveAttempt>,
    stopped: bool,
}

struct ActiveAttempt {
    token: FencingToken,
    address: String,
    attempt: Arc<dyn ConnectionAttempt>,
}

/// Routes attempt completions back to a tracker without keeping it alive.
struct AttemptCallbacks {
    tracker: Weak<JobLeaderTracker>,
}

impl RegistrationListener for AttemptCallbacks {
    fn registration_succeeded(
        &self,
        token: FencingToken,
        gateway: Arc<dyn JobMasterGateway>,
        success: RegistrationSuccess,
    ) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.registration_succeeded(token, gateway, success);
        }
    }

    fn registration_failed(&self, token: FencingToken, cause: anyhow::Error) {
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.registration_failed(token, cause);
        }
    }
}

impl JobLeaderTracker {
    pub fn new(
        job_id: JobId,
        listener: Arc<dyn JobLeaderListener>,
        attempts: Arc<dyn ConnectionAttemptFactory>,
        log_target: impl Into<Arc<str>>,
    ) -> Arc<Self> {
        let context = Arc::new(TrackerContext {
            listener,
            attempts,
            log_target: log_target.into(),
        });
        Self::with_context(job_id, context)
    }

    pub(crate) fn with_context(job_id: JobId, context: Arc<TrackerContext>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            job_id,
            context,
            state: Mutex::new(TrackerState::default()),
            this: this.clone(),
        })
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn current_fencing_token(&self) -> Option<FencingToken> {
        self.lock().active.as_ref().map(|active| active.token)
    }

    /// Address of the leader the tracker is currently registering at.
    pub fn current_target(&self) -> Option<String> {
        self.lock().active.as_ref().map(|active| active.address.clone())
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    /// Closes the active attempt and discards everything that arrives later.
    pub fn stop(&self) {
        let closing = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.active.take()
        };

        if let Some(active) = closing {
            active.attempt.close();
        }
    }

    /// Asks the active attempt to register again right away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the active attempt refuses to
    /// reconnect while it is still the tracker's active attempt.
    pub fn reconnect(&self) -> Result<()> {
        let attempt = {
            let state = self.lock();
            if state.stopped {
                log::debug!(
                    target: self.log_target(),
                    "Cannot reconnect because the leader tracker of job {} has already been stopped.",
                    self.job_id
                );
                return Ok(());
            }
            match &state.active {
                Some(active) => Arc::clone(&active.attempt),
                None => {
                    log::debug!(
                        target: self.log_target(),
                        "Cannot reconnect to an unknown job leader of job {}.",
                        self.job_id
                    );
                    return Ok(());
                }
            }
        };

        if attempt.try_reconnect() {
            return Ok(());
        }

        let state = self.lock();
        let still_active = state
            .active
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(&active.attempt, &attempt));
        if still_active {
            return Err(Error::illegal_state(format!(
                "connection attempt to {} for job {} refused to reconnect while active",
                attempt.target_address(),
                self.job_id
            )));
        }
        log::debug!(
            target: self.log_target(),
            "Connection attempt to {} for job {} was superseded while reconnecting.",
            attempt.target_address(),
            self.job_id
        );
        Ok(())
    }

    fn registration_succeeded(
        &self,
        token: FencingToken,
        gateway: Arc<dyn JobMasterGateway>,
        success: RegistrationSuccess,
    ) {
        if !self.is_current(token) {
            log::debug!(
                target: self.log_target(),
                "Discarding obsolete registration success from {} with fencing token {token}.",
                gateway.address()
            );
            return;
        }

        log::info!(
            target: self.log_target(),
            "Successful registration at job manager {} for job {}.",
            gateway.address(),
            self.job_id
        );
        self.context
            .listener
            .job_manager_gained_leadership(&self.job_id, gateway, success);
    }

    fn registration_failed(&self, token: FencingToken, cause: anyhow::Error) {
        if !self.is_current(token) {
            log::debug!(
                target: self.log_target(),
                "Discarding obsolete registration failure with fencing token {token}: {cause:#}"
            );
            return;
        }

        log::info!(
            target: self.log_target(),
            "Failed to register at job manager for job {}: {cause:#}",
            self.job_id
        );
        self.context.listener.handle_error(cause);
    }

    /// A `stop` racing in right after this check may still see one last
    /// completion delivered; that window is accepted.
    fn is_current(&self, token: FencingToken) -> bool {
        self.lock().active.as_ref().map(|active| active.token) == Some(token)
    }

    fn open_attempt(&self, address: &str, token: FencingToken) -> ActiveAttempt {
        let callbacks: Arc<dyn RegistrationListener> = Arc::new(AttemptCallbacks {
            tracker: self.this.clone(),
        });
        let attempt = self
            .context
            .attempts
            .create(&self.job_id, address, token, callbacks);
        log::info!(
            target: self.log_target(),
            "Try to register at job manager {address} with fencing token {token}."
        );
        ActiveAttempt {
            token,
            address: address.to_string(),
            attempt,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_target(&self) -> &str {
        &self.context.log_target
    }
}

impl LeaderListener for JobLeaderTracker {
    fn notify_leader_address(&self, address: Option<&str>, token: Option<FencingToken>) {
        let mut lost = None;
        let mut closing = None;
        let mut opening = None;

        {
            let mut state = self.lock();
            if state.stopped {
                log::debug!(
                    target: self.log_target(),
                    "Leader tracker of job {} is stopped; ignoring new leader {address:?}.",
                    self.job_id
                );
                return;
            }

            log::debug!(
                target: self.log_target(),
                "New leader information for job {}. Address: {address:?}, fencing token: {token:?}.",
                self.job_id
            );

            match (address.filter(|address| !address.is_empty()), token) {
                (None, _) => {
                    if let Some(active) = state.active.take() {
                        lost = Some(active.token);
                        closing = Some(active.attempt);
                    }
                }
                (Some(address), None) => {
                    log::warn!(
                        target: self.log_target(),
                        "Leader {address} of job {} was announced without a fencing token; ignoring.",
                        self.job_id
                    );
                }
                (Some(address), Some(token)) => {
                    if state.active.as_ref().map(|active| active.token) == Some(token) {
                        log::debug!(
                            target: self.log_target(),
                            "Ongoing attempt to connect to leader of job {}. Ignoring duplicate leader information.",
                            self.job_id
                        );
                    } else {
                        closing = state.active.take().map(|active| active.attempt);
                        let active = self.open_attempt(address, token);
                        opening = Some(Arc::clone(&active.attempt));
                        state.active = Some(active);
                    }
                }
            }
        }

        if let Some(attempt) = closing {
            attempt.close();
        }
        // A stop or newer leader racing in here closes this attempt first,
        // which turns the start into a no-op.
        if let Some(attempt) = opening {
            attempt.start();
        }
        if let Some(token) = lost {
            self.context
                .listener
                .job_manager_lost_leadership(&self.job_id, token);
        }
    }

    fn handle_error(&self, cause: anyhow::Error) {
        if self.is_stopped() {
            log::debug!(
                target: self.log_target(),
                "Leader subscription of job {} reported an error after the tracker stopped: {cause:#}",
                self.job_id
            );
            return;
        }
        self.context.listener.handle_error(cause);
    }
}
