mod test_harness;

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use hrm_qm::config::{DispatchConfig, InFlightPolicy, MalformedPolicy};
use hrm_qm::engine::ExecutionState;
use hrm_qm::error::QmError;
use hrm_qm::scheduler::{Dispatcher, JobOutcome, QueueSet};
use hrm_qm::spool::{EventHandler, SpoolDir};
use test_harness::{
    assert_eventually, jobfile, terminated, typed_jobfile, ScriptedEngine, TestSpool,
};

fn fast() -> DispatchConfig {
    DispatchConfig::default().with_poll_interval(Duration::from_millis(10))
}

/// Queue `uids` through the spool handler and build a dispatcher over them.
async fn setup(
    spool: &TestSpool,
    engine: ScriptedEngine,
    config: DispatchConfig,
    uids: &[&str],
) -> (Dispatcher<ScriptedEngine>, EventHandler) {
    let (producer, consumer) = QueueSet::new(["hucore"]).split(None);
    let handler = EventHandler::new(spool.spooler(), producer, MalformedPolicy::Quarantine);
    for uid in uids {
        let path = spool.write_jobfile(uid, &jobfile("alice", "deconv.tcl", &["a.tif"]));
        assert!(handler.handle(&path).await.is_queued());
    }
    let dispatcher = match Dispatcher::new(engine, consumer, spool.spooler(), config).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => panic!("dispatcher should start: {}", e),
    };
    (dispatcher, handler)
}

#[tokio::test]
async fn test_job_runs_to_completion_then_next_is_popped() {
    let spool = TestSpool::new();
    let engine = ScriptedEngine::new();
    let log = engine.log();
    let (mut dispatcher, _handler) = setup(&spool, engine, fast(), &["job1", "job2"]).await;
    let token = CancellationToken::new();

    let (uid, outcome) = dispatcher.dispatch_next(&token).await.unwrap();
    assert_eq!(uid, "job1");
    match outcome {
        JobOutcome::Completed { termination, polls } => {
            assert_eq!(polls, 3);
            assert_eq!(termination.exit_code, Some(0));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(spool.files(SpoolDir::Done), vec!["job1.cfg"]);
    assert_eq!(spool.files(SpoolDir::Cur), vec!["job2.cfg"]);
    assert_eq!(dispatcher.queues().len().await, 1);

    let (uid, outcome) = dispatcher.dispatch_next(&token).await.unwrap();
    assert_eq!(uid, "job2");
    assert!(outcome.succeeded());
    assert!(dispatcher.dispatch_next(&token).await.is_none());

    let log = log.lock().unwrap();
    assert_eq!(log.submitted, vec!["job1", "job2"]);
    assert_eq!(log.advances, 6);
    assert!(log.killed.is_empty());
}

#[tokio::test]
async fn test_nonzero_exit_moves_job_to_error() {
    let spool = TestSpool::new();
    let engine = ScriptedEngine::new().with_script("job1", vec![ExecutionState::Running, terminated(165)]);
    let (mut dispatcher, _handler) = setup(&spool, engine, fast(), &["job1"]).await;

    let (_, outcome) = dispatcher.dispatch_next(&CancellationToken::new()).await.unwrap();

    assert!(matches!(outcome, JobOutcome::Completed { polls: 2, .. }));
    assert!(!outcome.succeeded());
    assert_eq!(spool.files(SpoolDir::Error), vec!["job1.cfg"]);
    assert!(spool.files(SpoolDir::Cur).is_empty());
}

#[tokio::test]
async fn test_submission_failure_does_not_block_queue() {
    let spool = TestSpool::new();
    let engine = ScriptedEngine::new().with_failing("job1");
    let log = engine.log();
    let (mut dispatcher, _handler) = setup(&spool, engine, fast(), &["job1", "job2"]).await;
    let token = CancellationToken::new();

    let (uid, outcome) = dispatcher.dispatch_next(&token).await.unwrap();
    assert_eq!(uid, "job1");
    match outcome {
        JobOutcome::SubmissionFailed { reason } => assert!(reason.contains("scripted failure")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(spool.files(SpoolDir::Error), vec!["job1.cfg"]);
    assert_eq!(dispatcher.queues().len().await, 1);

    let (uid, outcome) = dispatcher.dispatch_next(&token).await.unwrap();
    assert_eq!(uid, "job2");
    assert!(outcome.succeeded());
    assert_eq!(spool.files(SpoolDir::Done), vec!["job2.cfg"]);
    assert_eq!(log.lock().unwrap().submitted, vec!["job1", "job2"]);
}

#[tokio::test]
async fn test_hung_job_times_out_and_is_killed() {
    let spool = TestSpool::new();
    let engine = ScriptedEngine::new().with_hung("job1");
    let log = engine.log();
    let config = fast().with_max_wait(Duration::from_millis(60));
    let (mut dispatcher, _handler) = setup(&spool, engine, config, &["job1"]).await;

    let (_, outcome) = dispatcher.dispatch_next(&CancellationToken::new()).await.unwrap();

    match outcome {
        JobOutcome::TimedOut { waited, polls } => {
            assert!(waited >= Duration::from_millis(60));
            assert!(polls > 1);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(log.lock().unwrap().killed, vec!["job1"]);
    assert_eq!(spool.files(SpoolDir::Error), vec!["job1.cfg"]);
}

#[tokio::test]
async fn test_finish_policy_completes_running_job_after_cancel() {
    let spool = TestSpool::new();
    let (mut dispatcher, _handler) = setup(&spool, ScriptedEngine::new(), fast(), &["job1"]).await;
    let token = CancellationToken::new();
    token.cancel();

    let (_, outcome) = dispatcher.dispatch_next(&token).await.unwrap();

    assert!(outcome.succeeded());
    assert_eq!(spool.files(SpoolDir::Done), vec!["job1.cfg"]);
}

#[tokio::test]
async fn test_abandon_policy_kills_job_and_keeps_file() {
    let spool = TestSpool::new();
    let engine = ScriptedEngine::new().with_hung("job1");
    let log = engine.log();
    let config = fast().with_in_flight(InFlightPolicy::Abandon);
    let (mut dispatcher, _handler) = setup(&spool, engine, config, &["job1"]).await;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let (_, outcome) = dispatcher.dispatch_next(&token).await.unwrap();

    assert!(matches!(outcome, JobOutcome::Abandoned { .. }));
    assert_eq!(log.lock().unwrap().killed, vec!["job1"]);
    assert_eq!(spool.files(SpoolDir::Cur), vec!["job1.cfg"]);
    assert!(spool.files(SpoolDir::Done).is_empty());
    assert!(spool.files(SpoolDir::Error).is_empty());
}

#[tokio::test]
async fn test_run_drains_queue_until_cancelled() {
    let spool = TestSpool::new();
    let engine = ScriptedEngine::new().with_failing("job2");
    let (mut dispatcher, _handler) = setup(&spool, engine, fast(), &["job1", "job2", "job3"]).await;

    let token = CancellationToken::new();
    let run_token = token.clone();
    let task = tokio::spawn(async move { dispatcher.run(&run_token).await });

    let spool_ref = &spool;
    assert_eventually(
        || async move {
            spool_ref.files(SpoolDir::Done).len() == 2 && spool_ref.files(SpoolDir::Error).len() == 1
        },
        Duration::from_secs(5),
        "All three jobs should be retired",
    )
    .await;

    token.cancel();
    let report = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("dispatcher should stop after cancel")
        .unwrap();
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.abandoned, 0);
}

#[tokio::test]
async fn test_idle_dispatcher_stops_promptly() {
    let spool = TestSpool::new();
    let config = DispatchConfig::default().with_poll_interval(Duration::from_secs(60));
    let (mut dispatcher, _handler) = setup(&spool, ScriptedEngine::new(), config, &[]).await;

    let token = CancellationToken::new();
    let run_token = token.clone();
    let task = tokio::spawn(async move { dispatcher.run(&run_token).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let report = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("cancel should interrupt the idle wait")
        .unwrap();
    assert_eq!(report.total(), 0);
}

#[tokio::test]
async fn test_dispatcher_requires_a_queue_for_its_type() {
    let spool = TestSpool::new();
    let (_producer, consumer) = QueueSet::new(["hucore"]).split(None);
    let config = DispatchConfig {
        job_type: "snr".to_string(),
        ..fast()
    };

    let result = Dispatcher::new(ScriptedEngine::new(), consumer, spool.spooler(), config).await;

    assert!(matches!(result, Err(QmError::UnknownQueueType(ref t)) if t == "snr"));
}

#[tokio::test]
async fn test_every_queue_is_served_in_turn() {
    let spool = TestSpool::new();
    let (producer, consumer) = QueueSet::new(["hucore", "snr"]).split(None);
    let handler = EventHandler::new(spool.spooler(), producer, MalformedPolicy::Quarantine);
    for (uid, job_type) in [("h1", "hucore"), ("h2", "hucore"), ("s1", "snr"), ("s2", "snr"), ("h3", "hucore")] {
        let path = spool.write_jobfile(uid, &typed_jobfile(job_type, &["a.tif"]));
        assert!(handler.handle(&path).await.is_queued());
    }
    let engine = ScriptedEngine::new();
    let log = engine.log();
    let mut dispatcher = match Dispatcher::new(engine, consumer, spool.spooler(), fast()).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => panic!("dispatcher should start: {}", e),
    };

    let token = CancellationToken::new();
    let mut order = Vec::new();
    while let Some((uid, outcome)) = dispatcher.dispatch_next(&token).await {
        assert!(outcome.succeeded());
        assert!(log.lock().unwrap().killed.is_empty());
        order.push(uid);
    }

    assert_eq!(order, vec!["h1", "s1", "h2", "s2", "h3"]);
    assert_eq!(log.lock().unwrap().submitted, order);
    assert_eq!(spool.files(SpoolDir::Done).len(), 5);
    assert!(spool.files(SpoolDir::Cur).is_empty());
}

#[tokio::test]
async fn test_configured_type_gets_the_first_turn() {
    let spool = TestSpool::new();
    let (producer, consumer) = QueueSet::new(["hucore", "snr"]).split(None);
    let handler = EventHandler::new(spool.spooler(), producer, MalformedPolicy::Quarantine);
    for (uid, job_type) in [("h1", "hucore"), ("s1", "snr")] {
        let path = spool.write_jobfile(uid, &typed_jobfile(job_type, &["a.tif"]));
        assert!(handler.handle(&path).await.is_queued());
    }
    let config = DispatchConfig {
        job_type: "snr".to_string(),
        ..fast()
    };
    let mut dispatcher = match Dispatcher::new(ScriptedEngine::new(), consumer, spool.spooler(), config).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => panic!("dispatcher should start: {}", e),
    };

    let token = CancellationToken::new();
    assert_eq!(dispatcher.dispatch_next(&token).await.unwrap().0, "s1");
    assert_eq!(dispatcher.dispatch_next(&token).await.unwrap().0, "h1");
    assert!(dispatcher.dispatch_next(&token).await.is_none());
}
