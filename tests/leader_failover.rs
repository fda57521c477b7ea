mod common;

use job_leader::testing::JobLeaderEvent;
use job_leader::{AttemptState, ConnectionAttempt, FencingToken, JobId, RegistrationSuccess};

const T1: FencingToken = FencingToken::from_u128(0x11);
const T2: FencingToken = FencingToken::from_u128(0x22);

#[test]
fn newer_leader_wins_over_late_success() {
    let h = common::started();
    let job = JobId::from("job-1");
    h.service.add_job(job.clone(), "addr0").unwrap();
    let subscription = h.source.latest(&job).unwrap();
    assert_eq!(subscription.default_target_address, "addr0");

    subscription.announce("addr1", T1);
    let first = h.attempts.last().unwrap();
    assert_eq!(first.target_address(), "addr1");
    assert_eq!(h.service.current_fencing_token(&job), Some(T1));

    subscription.announce("addr2", T2);
    let second = h.attempts.last().unwrap();
    assert_eq!(first.state(), AttemptState::Closed);
    assert_eq!(second.target_address(), "addr2");
    assert_eq!(second.fencing_token(), T2);
    assert_eq!(h.service.current_fencing_token(&job), Some(T2));

    first.succeed("rm-1");
    assert!(h.listener.events().is_empty());

    second.succeed("rm-2");
    assert_eq!(
        h.listener.events(),
        vec![JobLeaderEvent::Gained {
            job_id: job,
            gateway_address: "addr2".to_string(),
            registration: RegistrationSuccess {
                leader_resource_id: "rm-2".to_string(),
            },
        }]
    );
}

#[test]
fn late_failure_of_superseded_attempt_is_dropped() {
    let h = common::started();
    let job = JobId::from("job-1");
    h.service.add_job(job.clone(), "addr0").unwrap();
    let subscription = h.source.latest(&job).unwrap();

    subscription.announce("addr1", T1);
    subscription.announce("addr2", T2);
    h.attempts.attempts()[0].fail(anyhow::anyhow!("registration rejected"));

    assert!(h.listener.events().is_empty());
    assert_eq!(h.attempts.live().len(), 1);
}

#[test]
fn jobs_are_tracked_independently() {
    let h = common::started();
    let a = JobId::from("job-a");
    let b = JobId::from("job-b");
    h.service.add_job(a.clone(), "addr0").unwrap();
    h.service.add_job(b.clone(), "addr0").unwrap();

    h.source.latest(&a).unwrap().announce("addr-a", T1);
    h.source.latest(&b).unwrap().announce("addr-b", T1);

    assert_eq!(h.attempts.live().len(), 2);
    h.source.latest(&a).unwrap().revoke();

    assert_eq!(h.service.current_fencing_token(&a), None);
    assert_eq!(h.service.current_fencing_token(&b), Some(T1));
    assert_eq!(h.service.job_ids(), vec![a, b]);
}
