//! Scriptable doubles for the collaborators of [`JobLeaderService`].
//!
//! Available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! job-leader = { version = "0.1", features = ["testing"] }
//! ```
//!
//! [`JobLeaderService`]: crate::JobLeaderService

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::ids::{FencingToken, JobId};
use crate::leader::{LeaderListener, LeaderSource, LeaderSubscription};
use crate::listener::JobLeaderListener;
use crate::registration::{
    AttemptState, ConnectionAttempt, ConnectionAttemptFactory, JobMasterGateway,
    RegistrationListener, RegistrationRequest, RegistrationResponse, RegistrationSuccess, RpcError,
    Transport,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Leader observation
// ============================================================================

/// Start and stop calls seen by a [`ScriptedLeaderSource`], in call order.
///
/// `index` counts the subscriptions created for the same job, from zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Started { job_id: JobId, index: usize },
    Stopped { job_id: JobId, index: usize },
}

type Announcement = (String, FencingToken);

/// Hands out [`ScriptedSubscription`]s and keeps a probe for each one.
#[derive(Default)]
pub struct ScriptedLeaderSource {
    probes: Mutex<Vec<Arc<SubscriptionProbe>>>,
    history: Arc<Mutex<Vec<SubscriptionEvent>>>,
    fail_next: AtomicBool,
    fail_next_start: AtomicBool,
    announce_on_start: Mutex<Option<Announcement>>,
}

impl ScriptedLeaderSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `subscription` call fail.
    pub fn fail_next_subscription(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Makes the next created subscription fail in `start`.
    pub fn fail_next_start(&self) {
        self.fail_next_start.store(true, Ordering::SeqCst);
    }

    /// Makes the next created subscription announce `address` from inside
    /// its `start`, before returning.
    pub fn announce_on_start(&self, address: &str, token: FencingToken) {
        *lock(&self.announce_on_start) = Some((address.to_string(), token));
    }

    /// Every subscription created for `job_id`, oldest first.
    pub fn probes(&self, job_id: &JobId) -> Vec<Arc<SubscriptionProbe>> {
        lock(&self.probes)
            .iter()
            .filter(|probe| &probe.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, job_id: &JobId) -> Option<Arc<SubscriptionProbe>> {
        self.probes(job_id).pop()
    }

    /// Every successful start and every stop, across all jobs.
    pub fn history(&self) -> Vec<SubscriptionEvent> {
        lock(&self.history).clone()
    }
}

impl LeaderSource for ScriptedLeaderSource {
    fn subscription(
        &self,
        job_id: &JobId,
        default_target_address: &str,
    ) -> anyhow::Result<Box<dyn LeaderSubscription>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("leader source unavailable");
        }
        let mut probes = lock(&self.probes);
        let index = probes.iter().filter(|probe| &probe.job_id == job_id).count();
        let probe = Arc::new(SubscriptionProbe {
            job_id: job_id.clone(),
            index,
            default_target_address: default_target_address.to_string(),
            listener: Mutex::new(None),
            history: Arc::clone(&self.history),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            fail_start: AtomicBool::new(self.fail_next_start.swap(false, Ordering::SeqCst)),
            announce_on_start: lock(&self.announce_on_start).take(),
        });
        probes.push(Arc::clone(&probe));
        Ok(Box::new(ScriptedSubscription { probe }))
    }
}

/// Test-side view of one subscription.
///
/// The listener stays reachable after `stop`, so tests can deliver a
/// notification that was already in flight during teardown.
pub struct SubscriptionProbe {
    pub job_id: JobId,
    pub index: usize,
    pub default_target_address: String,
    listener: Mutex<Option<Arc<dyn LeaderListener>>>,
    history: Arc<Mutex<Vec<SubscriptionEvent>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
    fail_start: AtomicBool,
    announce_on_start: Option<Announcement>,
}

impl SubscriptionProbe {
    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    /// Announces `address` as leader under `token`.
    pub fn announce(&self, address: &str, token: FencingToken) {
        self.notify(Some(address), Some(token));
    }

    /// Reports that the leader is gone and no successor is known yet.
    pub fn revoke(&self) {
        self.notify(None, None);
    }

    pub fn notify(&self, address: Option<&str>, token: Option<FencingToken>) {
        if let Some(listener) = self.listener() {
            listener.notify_leader_address(address, token);
        }
    }

    pub fn fail(&self, cause: anyhow::Error) {
        if let Some(listener) = self.listener() {
            listener.handle_error(cause);
        }
    }

    fn listener(&self) -> Option<Arc<dyn LeaderListener>> {
        lock(&self.listener).clone()
    }

    fn record(&self, event: SubscriptionEvent) {
        lock(&self.history).push(event);
    }
}

pub struct ScriptedSubscription {
    probe: Arc<SubscriptionProbe>,
}

impl LeaderSubscription for ScriptedSubscription {
    fn start(&self, listener: Arc<dyn LeaderListener>) -> anyhow::Result<()> {
        let probe = &self.probe;
        if probe.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("subscription for job {} failed to start", probe.job_id);
        }
        probe.starts.fetch_add(1, Ordering::SeqCst);
        *lock(&probe.listener) = Some(listener);
        probe.record(SubscriptionEvent::Started {
            job_id: probe.job_id.clone(),
            index: probe.index,
        });
        if let Some((address, token)) = &probe.announce_on_start {
            probe.announce(address, *token);
        }
        Ok(())
    }

    fn stop(&self) -> anyhow::Result<()> {
        let probe = &self.probe;
        probe.stops.fetch_add(1, Ordering::SeqCst);
        probe.record(SubscriptionEvent::Stopped {
            job_id: probe.job_id.clone(),
            index: probe.index,
        });
        Ok(())
    }
}

// ============================================================================
// Job leader listener
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobLeaderEvent {
    Gained {
        job_id: JobId,
        gateway_address: String,
        registration: RegistrationSuccess,
    },
    Lost {
        job_id: JobId,
        token: FencingToken,
    },
    Error(String),
}

type EventHook = Arc<dyn Fn(&JobLeaderEvent) + Send + Sync>;

/// Collects every callback as a [`JobLeaderEvent`].
#[derive(Default)]
pub struct RecordingJobLeaderListener {
    events: Mutex<Vec<JobLeaderEvent>>,
    changed: Condvar,
    hook: Mutex<Option<EventHook>>,
}

impl RecordingJobLeaderListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Runs `hook` inside each callback, after the event is recorded.
    pub fn on_event(&self, hook: impl Fn(&JobLeaderEvent) + Send + Sync + 'static) {
        *lock(&self.hook) = Some(Arc::new(hook));
    }

    pub fn events(&self) -> Vec<JobLeaderEvent> {
        lock(&self.events).clone()
    }

    /// Blocks until at least `count` events were recorded.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = lock(&self.events);
        while events.len() < count {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self
                .changed
                .wait_timeout(events, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    fn record(&self, event: JobLeaderEvent) {
        lock(&self.events).push(event.clone());
        self.changed.notify_all();
        let hook = lock(&self.hook).clone();
        if let Some(hook) = hook {
            hook(&event);
        }
    }
}

impl JobLeaderListener for RecordingJobLeaderListener {
    fn job_manager_gained_leadership(
        &self,
        job_id: &JobId,
        gateway: Arc<dyn JobMasterGateway>,
        registration: RegistrationSuccess,
    ) {
        self.record(JobLeaderEvent::Gained {
            job_id: job_id.clone(),
            gateway_address: gateway.address().to_string(),
            registration,
        });
    }

    fn job_manager_lost_leadership(&self, job_id: &JobId, token: FencingToken) {
        self.record(JobLeaderEvent::Lost {
            job_id: job_id.clone(),
            token,
        });
    }

    fn handle_error(&self, cause: anyhow::Error) {
        self.record(JobLeaderEvent::Error(cause.to_string()));
    }
}

// ============================================================================
// Connection attempts
// ============================================================================

/// Creates [`ManualAttempt`]s that only complete when a test says so.
#[derive(Default)]
pub struct ManualAttemptFactory {
    attempts: Mutex<Vec<Arc<ManualAttempt>>>,
    succeed_on_start: AtomicBool,
}

impl ManualAttemptFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every attempt report success from inside its own `start`.
    pub fn succeed_on_start(&self) {
        self.succeed_on_start.store(true, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> Vec<Arc<ManualAttempt>> {
        lock(&self.attempts).clone()
    }

    pub fn last(&self) -> Option<Arc<ManualAttempt>> {
        lock(&self.attempts).last().cloned()
    }

    pub fn count(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// Attempts that are neither closed nor completed.
    pub fn live(&self) -> Vec<Arc<ManualAttempt>> {
        self.attempts()
            .into_iter()
            .filter(|attempt| attempt.state() == AttemptState::Pending)
            .collect()
    }
}

impl ConnectionAttemptFactory for ManualAttemptFactory {
    fn create(
        &self,
        job_id: &JobId,
        target_address: &str,
        token: FencingToken,
        listener: Arc<dyn RegistrationListener>,
    ) -> Arc<dyn ConnectionAttempt> {
        let attempt = Arc::new(ManualAttempt {
            job_id: job_id.clone(),
            address: target_address.to_string(),
            token,
            listener,
            state: Mutex::new(AttemptState::Pending),
            started: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
            refuse_reconnect: AtomicBool::new(false),
            succeed_on_start: self.succeed_on_start.load(Ordering::SeqCst),
        });
        lock(&self.attempts).push(Arc::clone(&attempt));
        attempt
    }
}

pub struct ManualAttempt {
    pub job_id: JobId,
    address: String,
    token: FencingToken,
    listener: Arc<dyn RegistrationListener>,
    state: Mutex<AttemptState>,
    started: AtomicBool,
    starts: AtomicUsize,
    closes: AtomicUsize,
    reconnects: AtomicUsize,
    refuse_reconnect: AtomicBool,
    succeed_on_start: bool,
}

impl ManualAttempt {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn reconnect_calls(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Makes `try_reconnect` report `false` although the attempt is live.
    pub fn refuse_reconnect(&self) {
        self.refuse_reconnect.store(true, Ordering::SeqCst);
    }

    /// Fires the success callback whatever the current state, the way a
    /// completion already in flight would race a `close`.
    pub fn succeed(&self, leader_resource_id: &str) {
        {
            let mut state = lock(&self.state);
            if *state == AttemptState::Pending {
                *state = AttemptState::Succeeded;
            }
        }
        let gateway: Arc<dyn JobMasterGateway> = ScriptedGateway::new(&self.address);
        self.listener.registration_succeeded(
            self.token,
            gateway,
            RegistrationSuccess {
                leader_resource_id: leader_resource_id.to_string(),
            },
        );
    }

    pub fn fail(&self, cause: anyhow::Error) {
        {
            let mut state = lock(&self.state);
            if *state == AttemptState::Pending {
                *state = AttemptState::Failed;
            }
        }
        self.listener.registration_failed(self.token, cause);
    }
}

impl ConnectionAttempt for ManualAttempt {
    fn target_address(&self) -> &str {
        &self.address
    }

    fn fencing_token(&self) -> FencingToken {
        self.token
    }

    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if *lock(&self.state) == AttemptState::Closed || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.succeed_on_start {
            self.succeed("auto");
        }
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *lock(&self.state) = AttemptState::Closed;
    }

    fn try_reconnect(&self) -> bool {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.refuse_reconnect.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = lock(&self.state);
        if *state == AttemptState::Closed {
            return false;
        }
        *state = AttemptState::Pending;
        true
    }

    fn state(&self) -> AttemptState {
        *lock(&self.state)
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Gateway that answers registrations from a queue of canned responses.
/// An empty queue answers with [`RpcError::Unreachable`].
pub struct ScriptedGateway {
    address: String,
    responses: Mutex<VecDeque<Result<RegistrationResponse, RpcError>>>,
    calls: Mutex<Vec<(RegistrationRequest, Duration)>>,
}

impl ScriptedGateway {
    pub fn new(address: &str) -> Arc<Self> {
        Arc::new(Self {
            address: address.to_string(),
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, response: RegistrationResponse) {
        lock(&self.responses).push_back(Ok(response));
    }

    pub fn push_err(&self, err: RpcError) {
        lock(&self.responses).push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<RegistrationRequest> {
        lock(&self.calls).iter().map(|(request, _)| request.clone()).collect()
    }

    pub fn timeouts(&self) -> Vec<Duration> {
        lock(&self.calls).iter().map(|(_, timeout)| *timeout).collect()
    }
}

impl JobMasterGateway for ScriptedGateway {
    fn address(&self) -> &str {
        &self.address
    }

    fn register_worker(
        &self,
        request: &RegistrationRequest,
        timeout: Duration,
    ) -> Result<RegistrationResponse, RpcError> {
        lock(&self.calls).push((request.clone(), timeout));
        lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| {
                Err(RpcError::Unreachable {
                    address: self.address.clone(),
                    reason: "no scripted response".to_string(),
                })
            })
    }
}

/// Resolves addresses to registered [`ScriptedGateway`]s.
#[derive(Default)]
pub struct StaticTransport {
    gateways: Mutex<HashMap<String, Arc<ScriptedGateway>>>,
    connects: AtomicUsize,
}

impl StaticTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, gateway: Arc<ScriptedGateway>) {
        lock(&self.gateways).insert(gateway.address.clone(), gateway);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Transport for StaticTransport {
    fn connect(&self, address: &str) -> Result<Arc<dyn JobMasterGateway>, RpcError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match lock(&self.gateways).get(address) {
            Some(gateway) => Ok(Arc::clone(gateway) as Arc<dyn JobMasterGateway>),
            None => Err(RpcError::Unreachable {
                address: address.to_string(),
                reason: "unknown address".to_string(),
            }),
        }
    }
}
