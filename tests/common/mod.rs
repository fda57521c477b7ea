#![allow(dead_code)]

use std::sync::Arc;

use job_leader::testing::{ManualAttemptFactory, RecordingJobLeaderListener, ScriptedLeaderSource};
use job_leader::{
    ConnectionAttemptFactory, JobLeaderListener, JobLeaderService, LeaderSource, ServiceConfig,
    WorkerLocation,
};

pub struct Harness {
    pub service: Arc<JobLeaderService>,
    pub source: Arc<ScriptedLeaderSource>,
    pub attempts: Arc<ManualAttemptFactory>,
    pub listener: Arc<RecordingJobLeaderListener>,
}

pub fn started() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let service = Arc::new(JobLeaderService::new(
        WorkerLocation::new("tm-1", "localhost", 6121),
        ServiceConfig::default(),
    ));
    let source = ScriptedLeaderSource::new();
    let attempts = ManualAttemptFactory::new();
    let listener = RecordingJobLeaderListener::new();
    service
        .start_with_attempt_factory(
            "worker-1",
            Arc::clone(&attempts) as Arc<dyn ConnectionAttemptFactory>,
            Arc::clone(&source) as Arc<dyn LeaderSource>,
            Arc::clone(&listener) as Arc<dyn JobLeaderListener>,
        )
        .unwrap();
    Harness {
        service,
        source,
        attempts,
        listener,
    }
}
