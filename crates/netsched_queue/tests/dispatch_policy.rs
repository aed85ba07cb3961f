//! Integration tests for dispatch policy: affinity flags, preferred sets,
//! groups, and session-reset side effects.

use chrono::{DateTime, Utc};
use netsched_protocol::command::DispatchFlags;
use netsched_protocol::{ConsumerRole, JobStatus, QueueParams};
use netsched_queue::queue::{ConsumeOutcome, DispatchedJob};
use netsched_queue::{ClientId, ConsumeRequest, Datagram, Queue, QueueContext, SubmitSpec};
use std::sync::mpsc::{self, Receiver};

fn make_queue() -> (Queue, Receiver<Datagram>) {
    let (tx, rx) = mpsc::channel();
    let ctx = QueueContext {
        node_id: "test-node".to_string(),
        host: "127.0.0.1".to_string(),
        port: 9100,
    };
    (Queue::new_detached("q1", QueueParams::default(), ctx, tx), rx)
}

fn client(node: &str) -> ClientId {
    ClientId::new(node, format!("{}-sess", node), "127.0.0.1")
}

fn submit_aff(queue: &Queue, who: &ClientId, input: &[u8], aff: &str, now: DateTime<Utc>) -> String {
    queue
        .submit(
            who,
            SubmitSpec {
                input: input.to_vec(),
                affinity: if aff.is_empty() { None } else { Some(aff.to_string()) },
                ..SubmitSpec::default()
            },
            now,
        )
        .unwrap()
        .to_string()
}

fn get_with(
    queue: &Queue,
    who: &ClientId,
    affs: &[&str],
    flags: DispatchFlags,
    now: DateTime<Utc>,
) -> Option<(Box<DispatchedJob>, Option<String>)> {
    let req = ConsumeRequest {
        explicit_affinities: affs.iter().map(|s| s.to_string()).collect(),
        flags,
        ..ConsumeRequest::default()
    };
    match queue.get_job_or_wait(who, &req, now).unwrap() {
        ConsumeOutcome::Dispatched {
            job,
            added_preferred,
        } => Some((job, added_preferred)),
        ConsumeOutcome::NoJob { .. } => None,
    }
}

#[test]
fn test_exclusive_new_affinity_is_claimed_once() {
    let (queue, _rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");
    let wn1 = client("wn1");
    let wn2 = client("wn2");

    submit_aff(&queue, &subm, b"one", "A", now);

    let flags = DispatchFlags {
        exclusive_new_affinity: true,
        ..DispatchFlags::default()
    };
    let (job, added) = get_with(&queue, &wn1, &[], flags, now).expect("wn1 claims the new affinity");
    assert_eq!(job.affinity, "A");
    assert_eq!(added.as_deref(), Some("A"));

    // A second job with the now-claimed affinity is invisible to wn2's
    // exclusive request.
    submit_aff(&queue, &subm, b"two", "A", now);
    assert!(
        get_with(&queue, &wn2, &[], flags, now).is_none(),
        "A is owned by wn1; wn2 must get nothing"
    );

    // wn1 sees it through its preferred set.
    let pref_flags = DispatchFlags {
        use_preferred: true,
        ..DispatchFlags::default()
    };
    let (second, added) = get_with(&queue, &wn1, &[], pref_flags, now).expect("preferred set matches");
    assert_eq!(second.affinity, "A");
    assert!(added.is_none());
}

#[test]
fn test_prioritized_affinity_scenario() {
    let (queue, _rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");
    let wn = client("wn1");

    submit_aff(&queue, &subm, b"b-job", "B", now);
    submit_aff(&queue, &subm, b"c-job", "C", now);

    let flags = DispatchFlags {
        prioritized_affinity: true,
        ..DispatchFlags::default()
    };
    let (first, _) = get_with(&queue, &wn, &["A", "B", "C"], flags, now).unwrap();
    assert_eq!(first.affinity, "B", "B precedes C in the priority list");
    let (second, _) = get_with(&queue, &wn, &["A", "B", "C"], flags, now).unwrap();
    assert_eq!(second.affinity, "C");
    assert!(get_with(&queue, &wn, &["A", "B", "C"], flags, now).is_none());
}

#[test]
fn test_explicit_affinity_list_is_a_filter() {
    let (queue, _rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");
    let wn = client("wn1");

    submit_aff(&queue, &subm, b"x", "X", now);
    assert!(get_with(&queue, &wn, &["Y"], DispatchFlags::default(), now).is_none());
    let (job, _) = get_with(&queue, &wn, &["X", "Y"], DispatchFlags::default(), now).unwrap();
    assert_eq!(job.affinity, "X");
}

#[test]
fn test_change_affinity_feeds_preferred_dispatch() {
    let (queue, _rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");
    let wn = client("wn1");
    queue.touch_client(&wn, netsched_protocol::ClientRoles::WORKER, now);

    queue
        .change_affinity(&wn, ConsumerRole::Worker, &["A".to_string()], &[], now)
        .unwrap();
    submit_aff(&queue, &subm, b"a-job", "A", now);

    let flags = DispatchFlags {
        use_preferred: true,
        ..DispatchFlags::default()
    };
    let (job, _) = get_with(&queue, &wn, &[], flags, now).expect("preferred affinity matches");
    assert_eq!(job.affinity, "A");
}

#[test]
fn test_session_reset_drops_preferences_and_waiters() {
    let (queue, rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");
    queue.touch_client(&client("wn1"), netsched_protocol::ClientRoles::WORKER, now);
    queue
        .change_affinity(&client("wn1"), ConsumerRole::Worker, &["A".to_string()], &[], now)
        .unwrap();

    // Park a waiter under the old session.
    let req = ConsumeRequest {
        flags: DispatchFlags {
            use_preferred: true,
            ..DispatchFlags::default()
        },
        notif_port: 9870,
        wait_timeout: 60,
        ..ConsumeRequest::default()
    };
    match queue.get_job_or_wait(&client("wn1"), &req, now).unwrap() {
        ConsumeOutcome::NoJob { parked, .. } => assert!(parked),
        other => panic!("Unexpected outcome: {:?}", other),
    }

    // Same node, new session: preferences and waiters are gone.
    let reborn = ClientId::new("wn1", "wn1-sess-2", "127.0.0.1");
    let outcome = queue.touch_client(&reborn, netsched_protocol::ClientRoles::WORKER, now);
    assert!(outcome.session_reset);
    assert!(outcome.had_preferences);

    submit_aff(&queue, &subm, b"a-job", "A", now);
    assert!(
        rx.try_iter().all(|d| d.port != 9870),
        "waiter parked under the old session must not be woken"
    );

    let flags = DispatchFlags {
        use_preferred: true,
        ..DispatchFlags::default()
    };
    assert!(
        get_with(&queue, &reborn, &[], flags, now).is_none(),
        "preferred set was reset with the session"
    );
}

#[test]
fn test_group_restricts_dispatch() {
    let (queue, _rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");
    let wn = client("wn1");

    queue
        .submit(
            &subm,
            SubmitSpec {
                input: b"grouped".to_vec(),
                group: Some("batch7".to_string()),
                ..SubmitSpec::default()
            },
            now,
        )
        .unwrap();

    let req = ConsumeRequest {
        groups: vec!["other".to_string()],
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        ..ConsumeRequest::default()
    };
    assert!(matches!(
        queue.get_job_or_wait(&wn, &req, now).unwrap(),
        ConsumeOutcome::NoJob { .. }
    ));

    let req = ConsumeRequest {
        groups: vec!["batch7".to_string()],
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        ..ConsumeRequest::default()
    };
    match queue.get_job_or_wait(&wn, &req, now).unwrap() {
        ConsumeOutcome::Dispatched { job, .. } => assert_eq!(job.group, "batch7"),
        other => panic!("Unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_batch_submit_reserves_contiguous_ids() {
    let (queue, _rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");

    let specs = vec![
        netsched_protocol::command::BatchJobSpec {
            input: b"one".to_vec(),
            affinity: None,
            mask: 0,
        },
        netsched_protocol::command::BatchJobSpec {
            input: b"two".to_vec(),
            affinity: Some("A".to_string()),
            mask: 0,
        },
    ];
    let (first, count) = queue
        .submit_batch(&subm, specs, Some("grp".to_string()), 0, 0, now)
        .unwrap();
    assert_eq!(first.as_u32(), 1);
    assert_eq!(count, 2);

    // Both dispatchable, ascending id order.
    let wn = client("wn1");
    let flags = DispatchFlags {
        any_affinity: true,
        ..DispatchFlags::default()
    };
    let (a, _) = get_with(&queue, &wn, &[], flags, now).unwrap();
    let (b, _) = get_with(&queue, &wn, &[], flags, now).unwrap();
    assert_eq!(a.input, b"one".to_vec());
    assert_eq!(b.input, b"two".to_vec());
    assert_eq!(b.group, "grp");
}

#[test]
fn test_clear_worker_node_requeues_claims() {
    let (queue, _rx) = make_queue();
    let now = Utc::now();
    let subm = client("subm");
    let wn = client("wn1");

    let key = submit_aff(&queue, &subm, b"in", "", now);
    let flags = DispatchFlags {
        any_affinity: true,
        ..DispatchFlags::default()
    };
    assert!(get_with(&queue, &wn, &[], flags, now).is_some());
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Running);

    queue.clear_worker_node(&wn, now).unwrap();
    let info = queue.job_info(&key, false, now).unwrap();
    assert_eq!(info.status, JobStatus::Pending);
    // The cleared claim did not consume a retry.
    assert_eq!(info.run_attempts, 0);
}
