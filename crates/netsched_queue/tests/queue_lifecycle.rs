//! Integration tests for the queue engine: job lifecycle, retry policy,
//! authorization, pause semantics, and recovery.

use chrono::{DateTime, Duration, Utc};
use netsched_protocol::command::DispatchFlags;
use netsched_protocol::{ErrKind, JobStatus, PauseStatus, QueueParams, WarnKind};
use netsched_queue::queue::{ConsumeOutcome, DispatchedJob, OpOutcome};
use netsched_queue::{
    ClientId, ConsumeRequest, Datagram, Journal, MemoryJournal, Queue, QueueContext, SubmitSpec,
};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

fn test_ctx() -> QueueContext {
    QueueContext {
        node_id: "test-node".to_string(),
        host: "127.0.0.1".to_string(),
        port: 9100,
    }
}

fn make_queue(params: QueueParams) -> (Queue, Receiver<Datagram>) {
    let (tx, rx) = mpsc::channel();
    let queue = Queue::new_detached("q1", params, test_ctx(), tx);
    (queue, rx)
}

fn worker(node: &str) -> ClientId {
    ClientId::new(node, format!("{}-sess", node), "127.0.0.1")
}

fn submit_simple(queue: &Queue, client: &ClientId, input: &[u8], now: DateTime<Utc>) -> String {
    queue
        .submit(
            client,
            SubmitSpec {
                input: input.to_vec(),
                ..SubmitSpec::default()
            },
            now,
        )
        .unwrap()
        .to_string()
}

fn get_any(queue: &Queue, client: &ClientId, now: DateTime<Utc>) -> Option<Box<DispatchedJob>> {
    let req = ConsumeRequest {
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        ..ConsumeRequest::default()
    };
    match queue.get_job_or_wait(client, &req, now).unwrap() {
        ConsumeOutcome::Dispatched { job, .. } => Some(job),
        ConsumeOutcome::NoJob { .. } => None,
    }
}

fn read_any(queue: &Queue, client: &ClientId, now: DateTime<Utc>) -> Option<Box<DispatchedJob>> {
    let req = ConsumeRequest {
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        ..ConsumeRequest::default()
    };
    match queue.get_job_for_reading_or_wait(client, &req, now).unwrap() {
        ConsumeOutcome::Dispatched { job, .. } => Some(job),
        ConsumeOutcome::NoJob { .. } => None,
    }
}

#[test]
fn test_basic_lifecycle_round_trip() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let submitter = worker("subm1");
    let wn = worker("wn1");
    let reader = worker("rd1");

    let key = submit_simple(&queue, &submitter, b"x", now);
    assert!(key.starts_with("NSID_1_9100_"));
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Pending);

    // Worker leg.
    let job = get_any(&queue, &wn, now).expect("job should dispatch");
    assert_eq!(job.key.to_string(), key);
    assert_eq!(job.input, b"x".to_vec());
    assert!(!job.auth_token.is_empty());
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Running);

    queue
        .put_result(&wn, &key, Some(&job.auth_token), 0, b"y".to_vec(), now)
        .unwrap();
    let info = queue.job_info(&key, false, now).unwrap();
    assert_eq!(info.status, JobStatus::Done);
    assert_eq!(info.output, b"y".to_vec());
    assert_eq!(info.input, b"x".to_vec());

    // Reader leg.
    let read = read_any(&queue, &reader, now).expect("done job should be readable");
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Reading);
    queue.confirm_reading(&reader, &key, &read.auth_token, now).unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Confirmed);

    // A second confirm is rejected with an invalid-status error.
    let err = queue
        .confirm_reading(&reader, &key, &read.auth_token, now)
        .unwrap_err();
    assert_eq!(err.kind, ErrKind::InvalidJobStatus);
}

#[test]
fn test_cancel_is_idempotent_with_warning() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let client = worker("c1");

    let key = submit_simple(&queue, &client, b"in", now);
    assert_eq!(queue.cancel_job(&client, &key, now).unwrap(), OpOutcome::Done);
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Canceled);

    match queue.cancel_job(&client, &key, now).unwrap() {
        OpOutcome::Warned(kind, _) => assert_eq!(kind, WarnKind::JobAlreadyCanceled),
        other => panic!("Unexpected outcome: {:?}", other),
    }
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Canceled);
}

#[test]
fn test_auth_token_rotates_per_dispatch() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let wn = worker("wn1");

    let key = submit_simple(&queue, &wn, b"in", now);
    let first = get_any(&queue, &wn, now).unwrap();
    let token1 = first.auth_token.clone();

    queue
        .return_job(&wn, &key, Some(&token1), false, now)
        .unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Pending);

    let second = get_any(&queue, &wn, now).unwrap();
    let token2 = second.auth_token.clone();
    assert_ne!(token1, token2);

    // The stale token no longer authorizes a PUT.
    let err = queue
        .put_result(&wn, &key, Some(&token1), 0, b"out".to_vec(), now)
        .unwrap_err();
    assert_eq!(err.kind, ErrKind::InvalidAuthToken);
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Running);

    queue
        .put_result(&wn, &key, Some(&token2), 0, b"out".to_vec(), now)
        .unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Done);
}

#[test]
fn test_run_timeout_retries_then_blacklists() {
    let params = QueueParams {
        run_timeout: 1,
        failed_retries: 1,
        blacklist_time: 3600,
        ..QueueParams::default()
    };
    let (queue, _rx) = make_queue(params);
    let now = Utc::now();
    let wn1 = worker("wn1");
    let wn2 = worker("wn2");

    let key = submit_simple(&queue, &wn1, b"in", now);
    assert!(get_any(&queue, &wn1, now).is_some());

    // Watcher tick past the run deadline: back to Pending, wn1 blacklisted.
    let after = now + Duration::seconds(2);
    assert!(queue.check_timeline(after) > 0);
    assert_eq!(queue.job_info(&key, false, after).unwrap().status, JobStatus::Pending);

    assert!(get_any(&queue, &wn1, after).is_none(), "blacklisted worker must not re-claim");
    assert!(get_any(&queue, &wn2, after).is_some(), "other workers are unaffected");

    // Second timeout exhausts the retry budget.
    let later = after + Duration::seconds(2);
    queue.check_timeline(later);
    assert_eq!(queue.job_info(&key, false, later).unwrap().status, JobStatus::Failed);
}

#[test]
fn test_pause_with_pullback() {
    let params = QueueParams {
        run_timeout: 5,
        ..QueueParams::default()
    };
    let (queue, rx) = make_queue(params);
    let now = Utc::now();
    let wn = worker("wn1");

    submit_simple(&queue, &wn, b"a", now);
    submit_simple(&queue, &wn, b"b", now);
    let running = get_any(&queue, &wn, now).unwrap();

    assert_eq!(queue.pause(true), OpOutcome::Done);
    assert_eq!(queue.pause_status(), PauseStatus::PauseWithPullback);

    // GET during the pause: no job, resume target registered.
    let req = ConsumeRequest {
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        notif_port: 9933,
        wait_timeout: 10,
        ..ConsumeRequest::default()
    };
    match queue.get_job_or_wait(&wn, &req, now).unwrap() {
        ConsumeOutcome::NoJob { paused, parked } => {
            assert!(paused);
            assert!(!parked);
        }
        other => panic!("Unexpected outcome: {:?}", other),
    }

    // Watcher tick pulls the running job back without a retry charge.
    queue.check_timeline(now + Duration::seconds(1));
    assert_eq!(
        queue
            .job_info(&running.key.to_string(), false, now)
            .unwrap()
            .status,
        JobStatus::Pending
    );

    // Resume notifies the registered target.
    assert_eq!(queue.resume(now), OpOutcome::Done);
    let notices: Vec<Datagram> = rx.try_iter().collect();
    assert!(
        notices
            .iter()
            .any(|d| d.port == 9933 && d.payload.contains("reason=queue_resumed")),
        "resume target must be woken: {:?}",
        notices
    );
}

#[test]
fn test_paused_queue_warns_on_double_pause_and_resume() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    assert_eq!(queue.resume(now), OpOutcome::warned(WarnKind::QueueNotPaused, "The queue is not paused"));
    assert_eq!(queue.pause(false), OpOutcome::Done);
    match queue.pause(true) {
        OpOutcome::Warned(kind, _) => assert_eq!(kind, WarnKind::QueueAlreadyPaused),
        other => panic!("Unexpected outcome: {:?}", other),
    }
    // The pullback mode switch still took effect.
    assert_eq!(queue.pause_status(), PauseStatus::PauseWithPullback);
}

#[test]
fn test_refuse_submits_gate() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let client = worker("c1");

    queue.set_refuse_submits(true);
    let err = queue
        .submit(
            &client,
            SubmitSpec {
                input: b"in".to_vec(),
                ..SubmitSpec::default()
            },
            now,
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrKind::SubmitsDisabled);

    queue.set_refuse_submits(false);
    assert!(!submit_simple(&queue, &client, b"in", now).is_empty());
}

#[test]
fn test_input_size_cap() {
    let params = QueueParams {
        max_input_size: 4,
        ..QueueParams::default()
    };
    let (queue, _rx) = make_queue(params);
    let err = queue
        .submit(
            &worker("c1"),
            SubmitSpec {
                input: b"too big".to_vec(),
                ..SubmitSpec::default()
            },
            Utc::now(),
        )
        .unwrap_err();
    assert_eq!(err.kind, ErrKind::InvalidParameter);
}

#[test]
fn test_fail_with_retry_requeues_then_finalizes() {
    let params = QueueParams {
        failed_retries: 1,
        blacklist_time: 0,
        ..QueueParams::default()
    };
    let (queue, _rx) = make_queue(params);
    let now = Utc::now();
    let wn = worker("wn1");

    let key = submit_simple(&queue, &wn, b"in", now);

    // First failure: budget not exhausted, job requeues.
    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_failure(&wn, &key, Some(&job.auth_token), "boom", Vec::new(), 1, false, now)
        .unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Pending);

    // Second failure: budget spent, job fails for good.
    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_failure(&wn, &key, Some(&job.auth_token), "boom", Vec::new(), 1, false, now)
        .unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Failed);
}

#[test]
fn test_no_retries_flag_fails_immediately() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let wn = worker("wn1");

    let key = submit_simple(&queue, &wn, b"in", now);
    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_failure(&wn, &key, Some(&job.auth_token), "fatal", Vec::new(), 1, true, now)
        .unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Failed);
}

#[test]
fn test_reader_retry_and_rollback() {
    let params = QueueParams {
        read_failed_retries: 1,
        ..QueueParams::default()
    };
    let (queue, _rx) = make_queue(params);
    let now = Utc::now();
    let wn = worker("wn1");
    let rd = worker("rd1");

    let key = submit_simple(&queue, &wn, b"in", now);
    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_result(&wn, &key, Some(&job.auth_token), 0, b"out".to_vec(), now)
        .unwrap();

    // Rollback does not charge the read budget.
    let read = read_any(&queue, &rd, now).unwrap();
    queue
        .return_reading(&rd, &key, &read.auth_token, false, now)
        .unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Done);

    // Two charged failures exhaust the budget of 1.
    let read = read_any(&queue, &rd, now).unwrap();
    queue
        .fail_reading(&rd, &key, &read.auth_token, "bad", false, false, now)
        .unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Done);

    let read = read_any(&queue, &rd, now).unwrap();
    queue
        .fail_reading(&rd, &key, &read.auth_token, "bad", false, false, now)
        .unwrap();
    assert_eq!(
        queue.job_info(&key, false, now).unwrap().status,
        JobStatus::ReadFailed
    );
}

#[test]
fn test_reread_restores_done() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let wn = worker("wn1");
    let rd = worker("rd1");

    let key = submit_simple(&queue, &wn, b"in", now);
    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_result(&wn, &key, Some(&job.auth_token), 0, b"out".to_vec(), now)
        .unwrap();

    // Not read yet: warning, no change.
    match queue.reread_job(&rd, &key, now).unwrap() {
        OpOutcome::Warned(kind, _) => assert_eq!(kind, WarnKind::JobNotRead),
        other => panic!("Unexpected outcome: {:?}", other),
    }

    let read = read_any(&queue, &rd, now).unwrap();
    queue.confirm_reading(&rd, &key, &read.auth_token, now).unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Confirmed);

    queue.reread_job(&rd, &key, now).unwrap();
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Done);
    assert!(read_any(&queue, &rd, now).is_some());
}

#[test]
fn test_delay_expiration_invalidates_old_deadline() {
    let params = QueueParams {
        run_timeout: 1,
        ..QueueParams::default()
    };
    let (queue, _rx) = make_queue(params);
    let now = Utc::now();
    let wn = worker("wn1");

    let key = submit_simple(&queue, &wn, b"in", now);
    assert!(get_any(&queue, &wn, now).is_some());
    queue.delay_expiration(&key, 100, now).unwrap();

    // The original 1s deadline fires as a stale generation and is ignored.
    queue.check_timeline(now + Duration::seconds(2));
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Running);

    // The extended deadline is honored.
    queue.check_timeline(now + Duration::seconds(101));
    assert_eq!(queue.job_info(&key, false, now).unwrap().status, JobStatus::Pending);
}

#[test]
fn test_waiter_woken_by_submit() {
    let (queue, rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let wn = worker("wn1");

    let req = ConsumeRequest {
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        notif_port: 9755,
        wait_timeout: 30,
        ..ConsumeRequest::default()
    };
    match queue.get_job_or_wait(&wn, &req, now).unwrap() {
        ConsumeOutcome::NoJob { parked, .. } => assert!(parked),
        other => panic!("Unexpected outcome: {:?}", other),
    }

    submit_simple(&queue, &worker("subm"), b"in", now);
    let wakeups: Vec<Datagram> = rx.try_iter().collect();
    assert!(
        wakeups
            .iter()
            .any(|d| d.port == 9755 && d.payload.contains("reason=get") && d.payload.contains("queue=q1")),
        "parked worker must be woken: {:?}",
        wakeups
    );
}

#[test]
fn test_zero_timeout_wait_is_not_parked() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let req = ConsumeRequest {
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        notif_port: 9755,
        wait_timeout: 0,
        ..ConsumeRequest::default()
    };
    match queue.get_job_or_wait(&worker("wn1"), &req, now).unwrap() {
        ConsumeOutcome::NoJob { parked, .. } => assert!(!parked),
        other => panic!("Unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_waiter_expires_on_timeline() {
    let (queue, rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let wn = worker("wn1");
    let req = ConsumeRequest {
        flags: DispatchFlags {
            any_affinity: true,
            ..DispatchFlags::default()
        },
        notif_port: 9755,
        wait_timeout: 5,
        ..ConsumeRequest::default()
    };
    queue.get_job_or_wait(&wn, &req, now).unwrap();
    assert!(queue.check_timeline(now + Duration::seconds(6)) > 0);

    // The waiter is gone: a matching submit wakes nobody.
    submit_simple(&queue, &worker("subm"), b"in", now + Duration::seconds(7));
    assert!(
        rx.try_iter().all(|d| !d.payload.contains("reason=get")),
        "expired waiter must not be woken"
    );
}

#[test]
fn test_no_affinity_tokens_normalize() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let client = worker("c1");

    let key_dash = queue
        .submit(
            &client,
            SubmitSpec {
                input: b"a".to_vec(),
                affinity: Some("-".to_string()),
                ..SubmitSpec::default()
            },
            now,
        )
        .unwrap()
        .to_string();
    let key_empty = queue
        .submit(
            &client,
            SubmitSpec {
                input: b"b".to_vec(),
                affinity: None,
                ..SubmitSpec::default()
            },
            now,
        )
        .unwrap()
        .to_string();

    assert_eq!(queue.job_info(&key_dash, false, now).unwrap().affinity, "");
    assert_eq!(queue.job_info(&key_empty, false, now).unwrap().affinity, "");
}

#[test]
fn test_journal_replay_restores_state() {
    let journal = Arc::new(MemoryJournal::new());
    let (tx, _rx) = mpsc::channel();
    let queue = Queue::new("q1", QueueParams::default(), test_ctx(), tx, journal.clone());
    let now = Utc::now();
    let wn = worker("wn1");

    let key1 = submit_simple(&queue, &wn, b"first", now);
    let key2 = submit_simple(&queue, &wn, b"second", now);
    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_result(&wn, &key1, Some(&job.auth_token), 0, b"out".to_vec(), now)
        .unwrap();

    // A fresh queue replays the same journal.
    let (tx2, _rx2) = mpsc::channel();
    let restored = Queue::new("q1", QueueParams::default(), test_ctx(), tx2, journal.clone());
    let events = journal.recover("q1").unwrap();
    restored.replay(&events, now);

    assert_eq!(
        restored.job_info(&key1, false, now).unwrap().status,
        JobStatus::Done
    );
    assert_eq!(
        restored.job_info(&key2, false, now).unwrap().status,
        JobStatus::Pending
    );
    // The id counter resumes past the replayed jobs.
    let key3 = submit_simple(&restored, &wn, b"third", now);
    assert!(key3.starts_with("NSID_3_"));
}

#[test]
fn test_purge_two_phase_removal() {
    let params = QueueParams {
        timeout: 10,
        deleted_grace: 5,
        ..QueueParams::default()
    };
    let (queue, _rx) = make_queue(params);
    let now = Utc::now();
    let client = worker("c1");

    let key = submit_simple(&queue, &client, b"in", now);
    queue.cancel_job(&client, &key, now).unwrap();

    // Before expiration: untouched.
    let stats = queue.purge(now + Duration::seconds(5), 100);
    assert_eq!(stats.marked_deleted, 0);

    // After expiration: marked deleted, record retained.
    let stats = queue.purge(now + Duration::seconds(11), 100);
    assert_eq!(stats.marked_deleted, 1);
    assert_eq!(stats.removed, 0);
    assert_eq!(
        queue.job_info(&key, false, now).unwrap().status,
        JobStatus::Deleted
    );

    // After the grace period: physically gone.
    let stats = queue.purge(now + Duration::seconds(17), 100);
    assert_eq!(stats.removed, 1);
    assert_eq!(
        queue.job_info(&key, false, now).unwrap_err().kind,
        ErrKind::JobNotFound
    );
}

#[test]
fn test_progress_message_round_trip() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let wn = worker("wn1");
    let key = submit_simple(&queue, &wn, b"in", now);

    assert_eq!(queue.get_progress_msg(&key).unwrap(), "");
    queue.put_progress_msg(&key, "50% done").unwrap();
    assert_eq!(queue.get_progress_msg(&key).unwrap(), "50% done");
}

#[test]
fn test_foreign_key_rejected() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let err = queue
        .job_info("NSID_1_9999_10.0.0.9", false, now)
        .unwrap_err();
    assert_eq!(err.kind, ErrKind::IncorrectRouting);
}

#[test]
fn test_listener_receives_state_changes() {
    let (queue, rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let subm = worker("subm1");
    let wn = worker("wn1");
    let watcher = ClientId::new("watch1", "wsess", "10.0.0.8");

    let key = submit_simple(&queue, &subm, b"in", now);
    queue.set_listener(&watcher, &key, 9601, 600, now).unwrap();

    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_result(&wn, &key, Some(&job.auth_token), 0, b"out".to_vec(), now)
        .unwrap();

    let notices: Vec<Datagram> = rx.try_iter().collect();
    let to_listener: Vec<&Datagram> = notices
        .iter()
        .filter(|d| d.host == "10.0.0.8" && d.port == 9601)
        .collect();
    assert!(
        to_listener.len() >= 2,
        "listener must see the Running and Done changes: {:?}",
        notices
    );
    assert!(to_listener
        .iter()
        .any(|d| d.payload.contains("job_status=Done")));
    assert!(to_listener
        .iter()
        .all(|d| d.payload.contains(&format!("job_key={}", key))));
}

#[test]
fn test_expired_listener_is_not_notified() {
    let (queue, rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let subm = worker("subm1");
    let wn = worker("wn1");
    let watcher = ClientId::new("watch1", "wsess", "10.0.0.8");

    let key = submit_simple(&queue, &subm, b"in", now);
    queue.set_listener(&watcher, &key, 9602, 1, now).unwrap();

    let later = now + Duration::seconds(5);
    let job = get_any(&queue, &wn, later).unwrap();
    queue
        .put_result(&wn, &key, Some(&job.auth_token), 0, b"out".to_vec(), later)
        .unwrap();

    assert!(
        rx.try_iter().all(|d| d.port != 9602),
        "listener past its deadline must stay silent"
    );
}

#[test]
fn test_submitter_notified_on_completion() {
    let (queue, rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let subm = ClientId::new("subm1", "ssess", "10.0.0.4");
    let wn = worker("wn1");

    let key = queue
        .submit(
            &subm,
            SubmitSpec {
                input: b"in".to_vec(),
                notif_port: 9501,
                notif_timeout: 300,
                ..SubmitSpec::default()
            },
            now,
        )
        .unwrap()
        .to_string();

    let job = get_any(&queue, &wn, now).unwrap();
    queue
        .put_result(&wn, &key, Some(&job.auth_token), 0, b"out".to_vec(), now)
        .unwrap();

    let notice = rx
        .try_iter()
        .find(|d| d.host == "10.0.0.4" && d.port == 9501)
        .expect("submitter push on Done");
    assert!(notice.payload.contains("job_status=Done"), "{}", notice.payload);
}

#[test]
fn test_marked_deleted_job_still_answers_status() {
    let params = QueueParams {
        timeout: 1,
        deleted_grace: 600,
        ..QueueParams::default()
    };
    let (queue, _rx) = make_queue(params);
    let now = Utc::now();
    let client = worker("c1");

    let key = submit_simple(&queue, &client, b"in", now);
    queue.cancel_job(&client, &key, now).unwrap();
    queue.purge(now + Duration::seconds(2), 100);

    // The record is retained through the grace period for idempotent
    // queries, reporting Deleted.
    let info = queue.job_info(&key, false, now).unwrap();
    assert_eq!(info.status, JobStatus::Deleted);
    // Mutations treat it as gone.
    match queue.cancel_job(&client, &key, now).unwrap() {
        OpOutcome::Warned(kind, _) => assert_eq!(kind, WarnKind::JobNotFound),
        other => panic!("Unexpected outcome: {:?}", other),
    }
}

#[test]
fn test_consistency_holds_across_lifecycle() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let subm = worker("subm1");
    let wn = worker("wn1");
    let rd = worker("rd1");

    assert!(queue.verify_consistency().is_empty());

    let key = submit_simple(&queue, &subm, b"x", now);
    submit_simple(&queue, &subm, b"y", now);
    assert!(queue.verify_consistency().is_empty());

    let job = get_any(&queue, &wn, now).unwrap();
    assert!(queue.verify_consistency().is_empty());

    queue
        .put_result(&wn, &key, Some(&job.auth_token), 0, b"out".to_vec(), now)
        .unwrap();
    assert!(queue.verify_consistency().is_empty());

    let read = read_any(&queue, &rd, now).unwrap();
    queue.confirm_reading(&rd, &key, &read.auth_token, now).unwrap();
    queue.cancel_all_jobs(&subm, now).unwrap();
    let problems = queue.verify_consistency();
    assert!(problems.is_empty(), "{:?}", problems);
}

#[test]
fn test_cancel_all_jobs_counts() {
    let (queue, _rx) = make_queue(QueueParams::default());
    let now = Utc::now();
    let wn = worker("wn1");

    submit_simple(&queue, &wn, b"a", now);
    submit_simple(&queue, &wn, b"b", now);
    let key = submit_simple(&queue, &wn, b"c", now);
    let job = get_any(&queue, &wn, now).unwrap();
    assert_eq!(job.key.to_string(), "NSID_1_9100_127.0.0.1");

    let canceled = queue.cancel_all_jobs(&wn, now).unwrap();
    assert_eq!(canceled, 3);
    assert_eq!(
        queue.job_info(&key, false, now).unwrap().status,
        JobStatus::Canceled
    );
}
