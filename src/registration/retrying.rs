//! Thread-backed [`ConnectionAttempt`] with exponential registration timeouts.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::Error;
use crate::ids::{FencingToken, JobId, WorkerLocation};
use crate::registration::{
    AttemptState, ConnectionAttempt, ConnectionAttemptFactory, JobMasterGateway,
    RegistrationListener, RegistrationRequest, RegistrationResponse, RegistrationSuccess, RpcError,
    Transport,
};

/// Creates a [`RetryingConnection`] per announced leader.
pub struct RetryingConnectionFactory {
    transport: Arc<dyn Transport>,
    owner_address: String,
    location: WorkerLocation,
    config: RetryConfig,
    log_target: Arc<str>,
}

impl RetryingConnectionFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        owner_address: impl Into<String>,
        location: WorkerLocation,
        config: RetryConfig,
        log_target: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            transport,
            owner_address: owner_address.into(),
            location,
            config,
            log_target: log_target.into(),
        }
    }
}

impl ConnectionAttemptFactory for RetryingConnectionFactory {
    fn create(
        &self,
        job_id: &JobId,
        target_address: &str,
        token: FencingToken,
        listener: Arc<dyn RegistrationListener>,
    ) -> Arc<dyn ConnectionAttempt> {
        let request = RegistrationRequest {
            job_id: job_id.clone(),
            owner_address: self.owner_address.clone(),
            location: self.location.clone(),
            token,
        };
        Arc::new(RetryingConnection::new(
            target_address,
            request,
            Arc::clone(&self.transport),
            self.config.clone(),
            listener,
            Arc::clone(&self.log_target),
        ))
    }
}

/// Registers at one job leader from a background thread until success, a
/// rejection, or [`close`](ConnectionAttempt::close).
///
/// Every registration round fires exactly one completion. `try_reconnect`
/// aborts the current round (or re-opens a completed one) and starts over
/// with the initial timeout.
pub struct RetryingConnection {
    address: String,
    token: FencingToken,
    shared: Arc<Shared>,
}

struct Shared {
    address: String,
    request: RegistrationRequest,
    transport: Arc<dyn Transport>,
    config: RetryConfig,
    listener: Arc<dyn RegistrationListener>,
    log_target: Arc<str>,
    phase: Mutex<Phase>,
    wake: Condvar,
}

struct Phase {
    state: AttemptState,
    started: bool,
    round: u64,
}

enum Outcome {
    Success(Arc<dyn JobMasterGateway>, RegistrationSuccess),
    Failure(anyhow::Error),
}

enum RoundEnd {
    Completed(Outcome),
    Restarted(u64),
    Closed,
}

impl RetryingConnection {
    pub fn new(
        address: impl Into<String>,
        request: RegistrationRequest,
        transport: Arc<dyn Transport>,
        config: RetryConfig,
        listener: Arc<dyn RegistrationListener>,
        log_target: Arc<str>,
    ) -> Self {
        let address = address.into();
        let token = request.token;
        let shared = Arc::new(Shared {
            address: address.clone(),
            request,
            transport,
            config,
            listener,
            log_target,
            phase: Mutex::new(Phase {
                state: AttemptState::Pending,
                started: false,
                round: 0,
            }),
            wake: Condvar::new(),
        });
        Self {
            address,
            token,
            shared,
        }
    }
}

impl ConnectionAttempt for RetryingConnection {
    fn target_address(&self) -> &str {
        &self.address
    }

    fn fencing_token(&self) -> FencingToken {
        self.token
    }

    fn start(&self) {
        {
            let mut phase = self.shared.lock();
            if phase.started || phase.state == AttemptState::Closed {
                return;
            }
            phase.started = true;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("registration-{}", self.shared.request.job_id))
            .spawn(move || shared.run());
        if let Err(err) = spawned {
            // Nothing will ever complete this round otherwise.
            let mut phase = self.shared.lock();
            if phase.state != AttemptState::Pending {
                return;
            }
            phase.state = AttemptState::Failed;
            drop(phase);
            self.shared
                .listener
                .registration_failed(self.token, anyhow::Error::new(err));
        }
    }

    fn close(&self) {
        let mut phase = self.shared.lock();
        if phase.state != AttemptState::Closed {
            phase.state = AttemptState::Closed;
            self.shared.wake.notify_all();
        }
    }

    fn try_reconnect(&self) -> bool {
        let mut phase = self.shared.lock();
        if phase.state == AttemptState::Closed {
            return false;
        }
        log::debug!(
            target: &*self.shared.log_target,
            "Reconnecting to {} for job {}.",
            self.address,
            self.shared.request.job_id
        );
        phase.round += 1;
        phase.state = AttemptState::Pending;
        self.shared.wake.notify_all();
        true
    }

    fn state(&self) -> AttemptState {
        self.shared.lock().state
    }
}

impl Drop for RetryingConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        let mut round = self.lock().round;
        loop {
            match self.run_round(round) {
                RoundEnd::Closed => return,
                RoundEnd::Restarted(next) => round = next,
                RoundEnd::Completed(outcome) => {
                    if let Some(end) = self.complete(round, outcome) {
                        match end {
                            RoundEnd::Restarted(next) => {
                                round = next;
                                continue;
                            }
                            _ => return,
                        }
                    }
                    match self.wait_for_next_round(round) {
                        Some(next) => round = next,
                        None => return,
                    }
                }
            }
        }
    }

    fn run_round(&self, round: u64) -> RoundEnd {
        let mut timeout = self.config.initial_registration_timeout;
        loop {
            if let Some(end) = self.interrupted(round) {
                return end;
            }

            let gateway = match self.transport.connect(&self.address) {
                Ok(gateway) => gateway,
                Err(err) => {
                    log::debug!(
                        target: &*self.log_target,
                        "Could not resolve job manager {}: {err}. Retrying in {:?}.",
                        self.address,
                        self.config.error_delay
                    );
                    if let Some(end) = self.pause(round, self.config.error_delay) {
                        return end;
                    }
                    continue;
                }
            };

            match gateway.register_worker(&self.request, timeout) {
                Ok(RegistrationResponse::Success(success)) => {
                    return RoundEnd::Completed(Outcome::Success(gateway, success));
                }
                Ok(RegistrationResponse::Decline(reason)) => {
                    log::info!(
                        target: &*self.log_target,
                        "Registration at job manager {} declined: {reason}. Retrying in {:?}.",
                        self.address,
                        self.config.refused_delay
                    );
                    timeout = self.config.initial_registration_timeout;
                    if let Some(end) = self.pause(round, self.config.refused_delay) {
                        return end;
                    }
                }
                Ok(RegistrationResponse::Rejection(reason)) => {
                    let err = Error::Rejected {
                        address: self.address.clone(),
                        reason,
                    };
                    return RoundEnd::Completed(Outcome::Failure(err.into()));
                }
                Err(RpcError::Timeout(elapsed)) => {
                    timeout = self.config.next_timeout(timeout);
                    log::debug!(
                        target: &*self.log_target,
                        "Registration at job manager {} timed out after {elapsed:?}; next timeout {timeout:?}.",
                        self.address
                    );
                }
                Err(err) => {
                    log::warn!(
                        target: &*self.log_target,
                        "Registration at job manager {} failed: {err}. Retrying in {:?}.",
                        self.address,
                        self.config.error_delay
                    );
                    if let Some(end) = self.pause(round, self.config.error_delay) {
                        return end;
                    }
                }
            }
        }
    }

    /// Records the outcome and fires the matching callback unless the round
    /// was superseded or the attempt closed while the call was in flight.
    fn complete(&self, round: u64, outcome: Outcome) -> Option<RoundEnd> {
        {
            let mut phase = self.lock();
            if let Some(end) = check(&phase, round) {
                return Some(end);
            }
            phase.state = match outcome {
                Outcome::Success(..) => AttemptState::Succeeded,
                Outcome::Failure(_) => AttemptState::Failed,
            };
        }

        let token = self.request.token;
        match outcome {
            Outcome::Success(gateway, success) => {
                self.listener.registration_succeeded(token, gateway, success)
            }
            Outcome::Failure(cause) => self.listener.registration_failed(token, cause),
        }
        None
    }

    fn interrupted(&self, round: u64) -> Option<RoundEnd> {
        check(&self.lock(), round)
    }

    fn pause(&self, round: u64, delay: Duration) -> Option<RoundEnd> {
        let phase = self.lock();
        let (phase, _) = self
            .wake
            .wait_timeout_while(phase, delay, |phase| check(phase, round).is_none())
            .unwrap_or_else(PoisonError::into_inner);
        check(&phase, round)
    }

    fn wait_for_next_round(&self, round: u64) -> Option<u64> {
        let phase = self.lock();
        let phase = self
            .wake
            .wait_while(phase, |phase| check(phase, round).is_none())
            .unwrap_or_else(PoisonError::into_inner);
        match check(&phase, round) {
            Some(RoundEnd::Restarted(next)) => Some(next),
            _ => None,
        }
    }
}

fn check(phase: &Phase, round: u64) -> Option<RoundEnd> {
    if phase.state == AttemptState::Closed {
        Some(RoundEnd::Closed)
    } else if phase.round != round {
        Some(RoundEnd::Restarted(phase.round))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedGateway, StaticTransport};
    use std::sync::mpsc;

    enum Completion {
        Success(String, RegistrationSuccess),
        Failure(String),
    }

    struct ChannelListener(Mutex<mpsc::Sender<(FencingToken, Completion)>>);

    impl RegistrationListener for ChannelListener {
        fn registration_succeeded(
            &self,
            token: FencingToken,
            gateway: Arc<dyn JobMasterGateway>,
            success: RegistrationSuccess,
        ) {
            let completion = Completion::Success(gateway.address().to_string(), success);
            let _ = self.0.lock().unwrap().send((token, completion));
        }

        fn registration_failed(&self, token: FencingToken, cause: anyhow::Error) {
            let _ = self
                .0
                .lock()
                .unwrap()
                .send((token, Completion::Failure(cause.to_string())));
        }
    }

    const TOKEN: FencingToken = FencingToken::from_u128(7);

    fn fast_config() -> RetryConfig {
        RetryConfig::default()
            .initial_registration_timeout(Duration::from_millis(10))
            .max_registration_timeout(Duration::from_millis(40))
            .error_delay(Duration::from_millis(5))
            .refused_delay(Duration::from_millis(5))
    }

    fn connection(
        transport: Arc<StaticTransport>,
        config: RetryConfig,
    ) -> (RetryingConnection, mpsc::Receiver<(FencingToken, Completion)>) {
        let (tx, rx) = mpsc::channel();
        let request = RegistrationRequest {
            job_id: JobId::from("job-1"),
            owner_address: "worker-1".to_string(),
            location: WorkerLocation::new("tm-1", "localhost", 6121),
            token: TOKEN,
        };
        let connection = RetryingConnection::new(
            "jm-1",
            request,
            transport,
            config,
            Arc::new(ChannelListener(Mutex::new(tx))),
            Arc::from("job_leader::test"),
        );
        (connection, rx)
    }

    fn success(id: &str) -> RegistrationResponse {
        RegistrationResponse::Success(RegistrationSuccess {
            leader_resource_id: id.to_string(),
        })
    }

    #[test]
    fn timeouts_double_until_registration_succeeds() {
        let gateway = ScriptedGateway::new("jm-1");
        gateway.push_err(RpcError::Timeout(Duration::from_millis(10)));
        gateway.push_err(RpcError::Timeout(Duration::from_millis(20)));
        gateway.push(success("rm-a"));
        let transport = StaticTransport::new();
        transport.add(Arc::clone(&gateway));

        let (connection, rx) = connection(transport, fast_config());
        connection.start();

        let (token, completion) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token, TOKEN);
        match completion {
            Completion::Success(address, success) => {
                assert_eq!(address, "jm-1");
                assert_eq!(success.leader_resource_id, "rm-a");
            }
            Completion::Failure(cause) => panic!("unexpected failure: {cause}"),
        }
        assert_eq!(
            gateway.timeouts(),
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
        assert_eq!(connection.state(), AttemptState::Succeeded);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn request_carries_owner_and_token() {
        let gateway = ScriptedGateway::new("jm-1");
        gateway.push(success("rm-a"));
        let transport = StaticTransport::new();
        transport.add(Arc::clone(&gateway));

        let (connection, rx) = connection(transport, fast_config());
        connection.start();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let requests = gateway.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].owner_address, "worker-1");
        assert_eq!(requests[0].token, TOKEN);
        assert_eq!(requests[0].job_id, JobId::from("job-1"));
    }

    #[test]
    fn decline_is_retried_after_refused_delay() {
        let gateway = ScriptedGateway::new("jm-1");
        gateway.push(RegistrationResponse::Decline("not ready".to_string()));
        gateway.push(success("rm-a"));
        let transport = StaticTransport::new();
        transport.add(Arc::clone(&gateway));

        let (connection, rx) = connection(transport, fast_config());
        connection.start();

        let (_, completion) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(completion, Completion::Success(..)));
        assert_eq!(gateway.requests().len(), 2);
    }

    #[test]
    fn rejection_fails_once_and_stops_retrying() {
        let gateway = ScriptedGateway::new("jm-1");
        gateway.push(RegistrationResponse::Rejection("unknown job".to_string()));
        let transport = StaticTransport::new();
        transport.add(Arc::clone(&gateway));

        let (connection, rx) = connection(transport, fast_config());
        connection.start();

        let (token, completion) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(token, TOKEN);
        match completion {
            Completion::Failure(cause) => assert!(cause.contains("unknown job")),
            Completion::Success(..) => panic!("expected failure"),
        }
        assert_eq!(connection.state(), AttemptState::Failed);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(gateway.requests().len(), 1);
    }

    #[test]
    fn unreachable_target_retries_after_error_delay() {
        let transport = StaticTransport::new();
        let (connection, rx) = connection(Arc::clone(&transport), fast_config());
        connection.start();

        thread::sleep(Duration::from_millis(50));
        assert!(transport.connect_count() >= 2);

        let gateway = ScriptedGateway::new("jm-1");
        gateway.push(success("rm-a"));
        transport.add(gateway);

        let (_, completion) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(completion, Completion::Success(..)));
    }

    #[test]
    fn close_cancels_pending_retry() {
        let transport = StaticTransport::new();
        let config = fast_config().error_delay(Duration::from_secs(30));
        let (connection, rx) = connection(Arc::clone(&transport), config);
        connection.start();

        thread::sleep(Duration::from_millis(20));
        connection.close();
        connection.close();
        assert_eq!(connection.state(), AttemptState::Closed);

        let gateway = ScriptedGateway::new("jm-1");
        gateway.push(success("rm-a"));
        transport.add(gateway);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(transport.connect_count() <= 1);
        assert!(!connection.try_reconnect());
    }

    #[test]
    fn start_after_close_does_nothing() {
        let transport = StaticTransport::new();
        let (connection, rx) = connection(Arc::clone(&transport), fast_config());
        connection.close();
        connection.start();

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(transport.connect_count(), 0);
    }

    #[test]
    fn reconnect_registers_again_after_success() {
        let gateway = ScriptedGateway::new("jm-1");
        gateway.push(success("rm-a"));
        gateway.push(success("rm-b"));
        let transport = StaticTransport::new();
        transport.add(Arc::clone(&gateway));

        let (connection, rx) = connection(transport, fast_config());
        connection.start();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(connection.try_reconnect());
        let (_, completion) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match completion {
            Completion::Success(_, success) => assert_eq!(success.leader_resource_id, "rm-b"),
            Completion::Failure(cause) => panic!("unexpected failure: {cause}"),
        }
        assert_eq!(gateway.requests().len(), 2);
    }

    #[test]
    fn reconnect_cuts_error_delay_short() {
        let transport = StaticTransport::new();
        let config = fast_config().error_delay(Duration::from_secs(30));
        let (connection, rx) = connection(Arc::clone(&transport), config);
        connection.start();
        thread::sleep(Duration::from_millis(20));

        let gateway = ScriptedGateway::new("jm-1");
        gateway.push(success("rm-a"));
        transport.add(gateway);
        assert!(connection.try_reconnect());

        let (_, completion) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(completion, Completion::Success(..)));
    }
}
