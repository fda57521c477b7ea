//! Job leader service: one leader subscription and tracker per monitored job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::ids::{FencingToken, JobId, WorkerLocation};
use crate::leader::{LeaderListener, LeaderSource, LeaderSubscription};
use crate::listener::JobLeaderListener;
use crate::registration::{ConnectionAttemptFactory, RetryingConnectionFactory, Transport};
use crate::tracker::{JobLeaderTracker, TrackerContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Created,
    Started,
    Stopped,
}

/// Dependencies handed over by `start`.
struct Services {
    owner_address: String,
    leader_source: Arc<dyn LeaderSource>,
    trackers: Arc<TrackerContext>,
}

enum Lifecycle {
    Created,
    Started(Services),
    Stopped,
}

struct JobEntry {
    subscription: Arc<dyn LeaderSubscription>,
    tracker: Arc<JobLeaderTracker>,
}

/// Monitors the leader of every registered job and keeps a registration
/// with it alive.
///
/// Control calls (`add_job`, `remove_job`, `reconnect`, `stop`) are expected
/// from one thread at a time; diagnostic lookups may run concurrently with
/// them. No internal lock is held while collaborators or the
/// [`JobLeaderListener`] are called.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use job_leader::{JobId, JobLeaderService, ServiceConfig, WorkerLocation};
/// # use job_leader::{JobLeaderListener, LeaderSource, Transport};
/// # fn deps() -> (Arc<dyn Transport>, Arc<dyn LeaderSource>, Arc<dyn JobLeaderListener>) { unimplemented!() }
///
/// let (transport, leader_source, listener) = deps();
/// let service = JobLeaderService::new(
///     WorkerLocation::new("tm-1", "10.0.0.7", 6121),
///     ServiceConfig::default(),
/// );
/// service.start("worker@10.0.0.7:6122", transport, leader_source, listener)?;
/// service.add_job(JobId::from("job-1"), "jm@10.0.0.2:6123")?;
/// # Ok::<(), job_leader::Error>(())
/// ```
pub struct JobLeaderService {
    location: WorkerLocation,
    config: ServiceConfig,
    log_target: Arc<str>,
    lifecycle: Mutex<Lifecycle>,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

impl JobLeaderService {
    pub fn new(location: WorkerLocation, config: ServiceConfig) -> Self {
        let log_target = Arc::from(config.log_target.as_str());
        Self {
            location,
            config,
            log_target,
            lifecycle: Mutex::new(Lifecycle::Created),
            jobs: RwLock::new(HashMap::with_capacity(4)),
        }
    }

    /// Starts the service, registering at job leaders through `transport`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an invalid retry configuration and
    /// [`Error::IllegalState`] if the service was started before.
    pub fn start(
        &self,
        owner_address: impl Into<String>,
        transport: Arc<dyn Transport>,
        leader_source: Arc<dyn LeaderSource>,
        listener: Arc<dyn JobLeaderListener>,
    ) -> Result<()> {
        self.config.retry.validate()?;
        let owner_address = owner_address.into();
        let attempts = RetryingConnectionFactory::new(
            transport,
            owner_address.clone(),
            self.location.clone(),
            self.config.retry.clone(),
            Arc::clone(&self.log_target),
        );
        self.start_with_attempt_factory(owner_address, Arc::new(attempts), leader_source, listener)
    }

    /// Like [`start`](Self::start) but with a caller-supplied way of
    /// connecting to job leaders.
    pub fn start_with_attempt_factory(
        &self,
        owner_address: impl Into<String>,
        attempts: Arc<dyn ConnectionAttemptFactory>,
        leader_source: Arc<dyn LeaderSource>,
        listener: Arc<dyn JobLeaderListener>,
    ) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        if !matches!(*lifecycle, Lifecycle::Created) {
            return Err(Error::illegal_state("the job leader service has already been started"));
        }

        log::info!(target: self.log_target(), "Start job leader service.");
        *lifecycle = Lifecycle::Started(Services {
            owner_address: owner_address.into(),
            leader_source,
            trackers: Arc::new(TrackerContext {
                listener,
                attempts,
                log_target: Arc::clone(&self.log_target),
            }),
        });
        Ok(())
    }

    /// Stops monitoring every job. Safe to call in any state and repeatedly.
    ///
    /// All jobs are torn down even if some subscription fails to stop; the
    /// first such failure is returned.
    pub fn stop(&self) -> Result<()> {
        let was_started = {
            let mut lifecycle = self.lifecycle();
            let previous = std::mem::replace(&mut *lifecycle, Lifecycle::Stopped);
            matches!(previous, Lifecycle::Started(_))
        };
        if !was_started {
            return Ok(());
        }

        log::info!(target: self.log_target(), "Stop job leader service.");
        let entries: Vec<_> = self.jobs_mut().drain().collect();
        let mut first_err = None;
        for (job_id, entry) in entries {
            if let Err(err) = self.tear_down(&job_id, entry) {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Starts monitoring `job_id`, replacing any previous monitoring of it.
    ///
    /// The replaced subscription and tracker are stopped before the new
    /// subscription starts. The listener may call back into the service
    /// while the new subscription is starting.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] unless the service is started;
    /// [`Error::Subscription`] if the leader subscription cannot be created
    /// or started, or the replaced one fails to stop.
    pub fn add_job(&self, job_id: JobId, default_target_address: &str) -> Result<()> {
        let (leader_source, trackers) = {
            let lifecycle = self.lifecycle();
            let services = started(&lifecycle)?;
            (
                Arc::clone(&services.leader_source),
                Arc::clone(&services.trackers),
            )
        };

        log::info!(target: self.log_target(), "Add job {job_id} for job leader monitoring.");

        let subscription = leader_source
            .subscription(&job_id, default_target_address)
            .map_err(|err| Error::subscription(&job_id, err))?;
        let subscription: Arc<dyn LeaderSubscription> = Arc::from(subscription);
        let tracker = JobLeaderTracker::with_context(job_id.clone(), trackers);

        let previous = {
            let mut jobs = self.jobs_mut();
            // `stop` drains the map after leaving `Started`; inserting after
            // the drain would leak the entry.
            let running = started(&self.lifecycle()).map(|_| ());
            if let Err(err) = running {
                drop(jobs);
                tracker.stop();
                return Err(err);
            }
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    subscription: Arc::clone(&subscription),
                    tracker: Arc::clone(&tracker),
                },
            )
        };

        let replaced = match previous {
            Some(entry) => self.tear_down(&job_id, entry),
            None => Ok(()),
        };

        let listener: Arc<dyn LeaderListener> = Arc::clone(&tracker) as Arc<dyn LeaderListener>;
        if let Err(err) = subscription.start(listener) {
            log::warn!(
                target: self.log_target(),
                "Could not start leader subscription of job {job_id}: {err:#}"
            );
            self.discard_unstarted(&job_id, &tracker);
            return Err(Error::subscription(&job_id, err));
        }

        // Removed or replaced while starting; its teardown may have run
        // before the subscription was live.
        if !self.is_entry(&job_id, &tracker) {
            if let Err(err) = subscription.stop() {
                log::warn!(
                    target: self.log_target(),
                    "Could not stop leader subscription of job {job_id}: {err:#}"
                );
            }
        }
        replaced
    }

    /// Stops monitoring `job_id`. Unknown jobs are ignored.
    pub fn remove_job(&self, job_id: &JobId) -> Result<()> {
        started(&self.lifecycle())?;

        let removed = self.jobs_mut().remove(job_id);
        match removed {
            Some(entry) => {
                log::info!(
                    target: self.log_target(),
                    "Remove job {job_id} from job leader monitoring."
                );
                self.tear_down(job_id, entry)
            }
            None => Ok(()),
        }
    }

    /// Makes the tracker of `job_id` register again at its last known leader.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::IllegalState`] from [`JobLeaderTracker::reconnect`].
    pub fn reconnect(&self, job_id: &JobId) -> Result<()> {
        let tracker = self.jobs().get(job_id).map(|entry| Arc::clone(&entry.tracker));
        match tracker {
            Some(tracker) => tracker.reconnect(),
            None => {
                log::debug!(
                    target: self.log_target(),
                    "Cannot reconnect to job {job_id} because it is not registered."
                );
                Ok(())
            }
        }
    }

    /// Whether `job_id` is monitored.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalState`] unless the service is started.
    pub fn contains_job(&self, job_id: &JobId) -> Result<bool> {
        started(&self.lifecycle())?;
        Ok(self.jobs().contains_key(job_id))
    }

    pub fn state(&self) -> ServiceState {
        match *self.lifecycle() {
            Lifecycle::Created => ServiceState::Created,
            Lifecycle::Started(_) => ServiceState::Started,
            Lifecycle::Stopped => ServiceState::Stopped,
        }
    }

    /// Address handed to `start`, while the service runs.
    pub fn owner_address(&self) -> Option<String> {
        match &*self.lifecycle() {
            Lifecycle::Started(services) => Some(services.owner_address.clone()),
            _ => None,
        }
    }

    pub fn location(&self) -> &WorkerLocation {
        &self.location
    }

    /// Monitored jobs, sorted.
    pub fn job_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<_> = self.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Fencing token the tracker of `job_id` is currently registering under.
    pub fn current_fencing_token(&self, job_id: &JobId) -> Option<FencingToken> {
        let tracker = self.jobs().get(job_id).map(|entry| Arc::clone(&entry.tracker));
        tracker.and_then(|tracker| tracker.current_fencing_token())
    }

    /// Stops the subscription first so no further notification is produced,
    /// then the tracker, which discards anything still in flight.
    fn tear_down(&self, job_id: &JobId, entry: JobEntry) -> Result<()> {
        let stopped = entry.subscription.stop();
        entry.tracker.stop();
        stopped.map_err(|err| {
            log::warn!(
                target: self.log_target(),
                "Could not stop leader subscription of job {job_id}: {err:#}"
            );
            Error::subscription(job_id, err)
        })
    }

    /// Drops the entry of a subscription that failed to start, unless a newer
    /// entry has replaced it meanwhile.
    fn discard_unstarted(&self, job_id: &JobId, tracker: &Arc<JobLeaderTracker>) {
        let mut jobs = self.jobs_mut();
        if entry_of(&jobs, job_id, tracker) {
            jobs.remove(job_id);
        }
        drop(jobs);
        tracker.stop();
    }

    fn is_entry(&self, job_id: &JobId, tracker: &Arc<JobLeaderTracker>) -> bool {
        entry_of(&self.jobs(), job_id, tracker)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_mut(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_target(&self) -> &str {
        &self.log_target
    }
}

impl Drop for JobLeaderService {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn started(lifecycle: &Lifecycle) -> Result<&Services> {
    match lifecycle {
        Lifecycle::Started(services) => Ok(services),
        _ => Err(Error::illegal_state("the job leader service is not running")),
    }
}

fn entry_of(
    jobs: &HashMap<JobId, JobEntry>,
    job_id: &JobId,
    tracker: &Arc<JobLeaderTracker>,
) -> bool {
    jobs.get(job_id)
        .is_some_and(|entry| Arc::ptr_eq(&entry.tracker, tracker))
}
