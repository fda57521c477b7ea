mod common;

use job_leader::testing::JobLeaderEvent;
use job_leader::{AttemptState, ConnectionAttempt, FencingToken, JobId};

const T1: FencingToken = FencingToken::from_u128(0x11);

#[test]
fn loss_closes_attempt_and_reports_lost_token() {
    let h = common::started();
    let job = JobId::from("job-1");
    h.service.add_job(job.clone(), "addr0").unwrap();
    let subscription = h.source.latest(&job).unwrap();

    subscription.announce("addr1", T1);
    let attempt = h.attempts.last().unwrap();

    subscription.notify(Some(""), None);

    assert_eq!(attempt.state(), AttemptState::Closed);
    assert_eq!(h.service.current_fencing_token(&job), None);
    assert_eq!(
        h.listener.events(),
        vec![JobLeaderEvent::Lost {
            job_id: job.clone(),
            token: T1
        }]
    );

    // Nothing left to lose.
    subscription.revoke();
    assert_eq!(h.listener.events().len(), 1);
}

#[test]
fn loss_without_known_leader_is_silent() {
    let h = common::started();
    let job = JobId::from("job-1");
    h.service.add_job(job.clone(), "addr0").unwrap();

    h.source.latest(&job).unwrap().revoke();

    assert!(h.listener.events().is_empty());
    assert_eq!(h.attempts.count(), 0);
}

#[test]
fn subscription_errors_reach_the_listener() {
    let h = common::started();
    let job = JobId::from("job-1");
    h.service.add_job(job.clone(), "addr0").unwrap();

    h.source
        .latest(&job)
        .unwrap()
        .fail(anyhow::anyhow!("lost session"));

    assert_eq!(
        h.listener.events(),
        vec![JobLeaderEvent::Error("lost session".to_string())]
    );
}
