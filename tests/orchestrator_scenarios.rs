mod common;

use std::sync::Arc;
use std::time::Duration;

use archivd::core::{
    CaptureMethod, CrawlError, CrawlRecord, FailureKind, LogStore, OutcomeKind, Scheduler,
    StartOutcome, TargetId, TargetStatus, TargetStore,
};
use archivd::db::MemoryStore;
use async_trait::async_trait;
use chrono::Utc;
use common::{
    HANG, Harness, SINGLE_PAGE_OK, WGET_TIMED_OUT, next_started, wait_finished, wait_for_status,
    wait_started, write_script,
};

/// Log storage that takes its time.
struct SlowLogs {
    inner: Arc<MemoryStore>,
    delay: Duration,
}

#[async_trait]
impl LogStore for SlowLogs {
    async fn append(&self, record: &CrawlRecord) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.append(record).await
    }

    async fn latest(&self, target_id: TargetId) -> anyhow::Result<Option<CrawlRecord>> {
        self.inner.latest(target_id).await
    }
}

#[tokio::test]
async fn network_timeout_on_mirror_schedules_first_retry() {
    let h = Harness::with_tool(WGET_TIMED_OUT);
    let target = h.add(CaptureMethod::Mirror).await;
    let mut events = h.orchestrator.subscribe();

    let before = Utc::now();
    let outcome = h.orchestrator.request_start(target.id).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));

    let (status, kind) = wait_finished(&mut events, target.id).await;
    let after = Utc::now();
    assert_eq!(status, TargetStatus::RetryPending);
    assert_eq!(kind, OutcomeKind::Failure(FailureKind::Recoverable));

    let target = h.target(target.id).await;
    assert_eq!(target.status, TargetStatus::RetryPending);
    assert_eq!(target.retry_count, 1);
    let next = target.next_run_at.unwrap();
    assert!(next >= before + chrono::Duration::minutes(5));
    assert!(next <= after + chrono::Duration::minutes(5));
    let error = target.last_error.unwrap();
    assert!(error.contains("network failure"), "{}", error);
    assert!(error.contains("timed_out"), "{}", error);

    let records = h.store.records(target.id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, "error");
    assert_eq!(records[0].attempt, 1);
    assert_eq!(records[0].exit_code, Some(4));
    assert!(records[0].log.contains("Connection timed out"));
}

#[tokio::test]
async fn empty_channel_is_dead_without_spending_retries() {
    let h = Harness::with_tool("echo '[youtube:tab] Downloading 0 items'\nexit 0");
    let target = h.add(CaptureMethod::Channel).await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(target.id).await.unwrap();
    let (status, kind) = wait_finished(&mut events, target.id).await;

    assert_eq!(status, TargetStatus::Dead);
    assert_eq!(kind, OutcomeKind::Failure(FailureKind::Permanent));
    let target = h.target(target.id).await;
    assert_eq!(target.retry_count, 0);
    assert!(target.next_run_at.is_none());
    assert!(target.last_error.unwrap().contains("zero_content"));
}

#[tokio::test]
async fn silent_job_is_cancelled_by_stuck_sweep_and_retried() {
    let h = Harness::new(|dir, config| {
        config.mirror.tool.program = write_script(dir, "wget.sh", HANG).display().to_string();
        config.mirror.tool.stuck_threshold_secs = 1;
    });
    let scheduler = Scheduler::new(h.orchestrator.clone());
    let target = h.add(CaptureMethod::Mirror).await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(target.id).await.unwrap();
    wait_started(&mut events, target.id).await;

    // Under the threshold nothing happens.
    let report = scheduler.stuck_sweep().await.unwrap();
    assert_eq!(report.acted, 0);

    let mut cancelled = 0;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        cancelled += scheduler.stuck_sweep().await.unwrap().acted;
        if cancelled > 0 {
            break;
        }
    }
    assert_eq!(cancelled, 1);

    let (status, kind) = wait_finished(&mut events, target.id).await;
    assert_eq!(status, TargetStatus::RetryPending);
    assert_eq!(kind, OutcomeKind::Failure(FailureKind::Recoverable));

    let target = h.target(target.id).await;
    assert_eq!(target.retry_count, 1);
    assert!(target.last_error.unwrap().contains("timeout"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_admit_a_single_job() {
    let h = Harness::with_tool(HANG);
    let target = h.add(CaptureMethod::Mirror).await;
    let mut events = h.orchestrator.subscribe();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.request_start(target.id).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) if outcome.admitted() => admitted += 1,
            Ok(StartOutcome::AlreadyActive { .. }) | Err(CrawlError::AlreadyActive(_)) => {}
            other => panic!("unexpected start result: {:?}", other),
        }
    }
    assert_eq!(admitted, 1);

    wait_started(&mut events, target.id).await;
    assert_eq!(h.orchestrator.counts().running, 1);
    assert_eq!(h.orchestrator.list_active(0).len(), 1);
    assert_eq!(h.target(target.id).await.status, TargetStatus::Crawling);

    assert!(h.orchestrator.request_cancel(target.id).await.unwrap());
    wait_finished(&mut events, target.id).await;
    assert_eq!(h.orchestrator.counts().running, 0);
}

#[tokio::test]
async fn cancellation_is_terminal_and_keeps_retry_count() {
    let h = Harness::with_tool(HANG);
    let target = h
        .add_in(CaptureMethod::Mirror, TargetStatus::RetryPending, 2)
        .await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(target.id).await.unwrap();
    wait_started(&mut events, target.id).await;

    assert!(h.orchestrator.request_cancel(target.id).await.unwrap());
    // Second request finds the job already cancelling.
    assert!(!h.orchestrator.request_cancel(target.id).await.unwrap());

    let (status, kind) = wait_finished(&mut events, target.id).await;
    assert_eq!(status, TargetStatus::Cancelled);
    assert_eq!(kind, OutcomeKind::Cancelled);

    let target = h.target(target.id).await;
    assert_eq!(target.retry_count, 2);
    assert!(target.next_run_at.is_none());
    assert_eq!(h.store.records(target.id)[0].status, "cancelled");

    // Nothing left to cancel.
    assert!(!h.orchestrator.request_cancel(target.id).await.unwrap());
}

#[tokio::test]
async fn cancel_of_unknown_target_is_an_error() {
    let h = Harness::with_tool(HANG);
    let err = h.orchestrator.request_cancel(404).await.unwrap_err();
    assert!(matches!(err, CrawlError::TargetNotFound(404)));
}

#[tokio::test]
async fn waiting_jobs_are_admitted_in_request_order() {
    let h = Harness::new(|dir, config| {
        let tool = write_script(dir, "wget.sh", HANG);
        config.mirror.tool.program = tool.display().to_string();
        config.max_concurrent_jobs = 1;
    });
    let a = h.add(CaptureMethod::Mirror).await;
    let b = h.add(CaptureMethod::Mirror).await;
    let c = h.add(CaptureMethod::Mirror).await;
    let mut events = h.orchestrator.subscribe();

    assert!(matches!(
        h.orchestrator.request_start(a.id).await.unwrap(),
        StartOutcome::Started { .. }
    ));
    assert!(matches!(
        h.orchestrator.request_start(b.id).await.unwrap(),
        StartOutcome::Queued { position: 1, .. }
    ));
    assert!(matches!(
        h.orchestrator.request_start(c.id).await.unwrap(),
        StartOutcome::Queued { position: 2, .. }
    ));
    assert_eq!(next_started(&mut events).await, a.id);
    assert_eq!(h.target(b.id).await.status, TargetStatus::Queued);

    h.orchestrator.request_cancel(a.id).await.unwrap();
    assert_eq!(next_started(&mut events).await, b.id);
    assert_eq!(h.target(c.id).await.status, TargetStatus::Queued);

    h.orchestrator.request_cancel(b.id).await.unwrap();
    assert_eq!(next_started(&mut events).await, c.id);

    h.orchestrator.request_cancel(c.id).await.unwrap();
    wait_finished(&mut events, c.id).await;
}

#[tokio::test]
async fn cancelling_a_queued_job_never_starts_it() {
    let h = Harness::new(|dir, config| {
        config.mirror.tool.program = write_script(dir, "wget.sh", HANG).display().to_string();
        config.max_concurrent_jobs = 1;
    });
    let a = h.add(CaptureMethod::Mirror).await;
    let b = h.add(CaptureMethod::Mirror).await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(a.id).await.unwrap();
    h.orchestrator.request_start(b.id).await.unwrap();
    assert!(h.orchestrator.request_cancel(b.id).await.unwrap());

    let (status, _) = wait_finished(&mut events, b.id).await;
    assert_eq!(status, TargetStatus::Cancelled);
    assert!(h.store.records(b.id)[0].summary.contains("queued"));

    h.orchestrator.request_cancel(a.id).await.unwrap();
    wait_finished(&mut events, a.id).await;
    h.orchestrator.wait_idle().await;
    assert_eq!(h.target(b.id).await.status, TargetStatus::Cancelled);
}

#[tokio::test]
async fn full_queue_reports_overload() {
    let h = Harness::new(|dir, config| {
        config.mirror.tool.program = write_script(dir, "wget.sh", HANG).display().to_string();
        config.max_concurrent_jobs = 1;
        config.max_queued_jobs = Some(1);
    });
    let a = h.add(CaptureMethod::Mirror).await;
    let b = h.add(CaptureMethod::Mirror).await;
    let c = h.add(CaptureMethod::Mirror).await;

    h.orchestrator.request_start(a.id).await.unwrap();
    h.orchestrator.request_start(b.id).await.unwrap();
    let err = h.orchestrator.request_start(c.id).await.unwrap_err();
    assert!(matches!(err, CrawlError::Overloaded { waiting: 1 }));
    assert_eq!(h.target(c.id).await.status, TargetStatus::Pending);

    h.orchestrator.shutdown(Duration::from_secs(10)).await;
}

#[tokio::test]
async fn dead_targets_need_a_reset() {
    let h = Harness::with_tool(SINGLE_PAGE_OK);
    let target = h
        .add_in(CaptureMethod::SinglePage, TargetStatus::Dead, 4)
        .await;
    let mut events = h.orchestrator.subscribe();

    let err = h.orchestrator.request_start(target.id).await.unwrap_err();
    assert!(matches!(
        err,
        CrawlError::NotStartable {
            status: TargetStatus::Dead,
            ..
        }
    ));
    assert_eq!(h.target(target.id).await.status, TargetStatus::Dead);

    h.orchestrator.request_reset(target.id).await.unwrap();
    let (status, kind) = wait_finished(&mut events, target.id).await;
    assert_eq!(status, TargetStatus::Ready);
    assert_eq!(kind, OutcomeKind::Success);

    let target = h.target(target.id).await;
    assert_eq!(target.retry_count, 0);
    assert_eq!(target.item_count, 1);
    assert!(target.size_bytes > 0);
    assert!(target.last_error.is_none());
    assert!(target.last_success_at.is_some());
    assert_eq!(h.store.records(target.id)[0].attempt, 1);
}

#[tokio::test]
async fn exhausted_retries_end_in_dead() {
    let h = Harness::with_tool(WGET_TIMED_OUT);
    let target = h
        .add_in(CaptureMethod::Mirror, TargetStatus::RetryPending, 3)
        .await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(target.id).await.unwrap();
    let (status, _) = wait_finished(&mut events, target.id).await;

    assert_eq!(status, TargetStatus::Dead);
    let target = h.target(target.id).await;
    assert_eq!(target.retry_count, 4);
    assert!(target.next_run_at.is_none());
    assert_eq!(h.store.records(target.id)[0].attempt, 4);
}

#[tokio::test]
async fn missing_tool_is_a_recoverable_failure() {
    let h = Harness::new(|dir, config| {
        config.single_page.program = dir.join("no-such-tool").display().to_string();
    });
    let target = h.add(CaptureMethod::SinglePage).await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(target.id).await.unwrap();
    let (status, _) = wait_finished(&mut events, target.id).await;

    assert_eq!(status, TargetStatus::RetryPending);
    let target = h.target(target.id).await;
    assert_eq!(target.retry_count, 1);
    assert!(target.last_error.unwrap().contains("no-such-tool"));
}

#[tokio::test]
async fn orphans_are_recovered() {
    let h = Harness::with_tool(SINGLE_PAGE_OK);
    let crawling = h
        .add_in(CaptureMethod::SinglePage, TargetStatus::Crawling, 0)
        .await;
    let queued = h
        .add_in(CaptureMethod::SinglePage, TargetStatus::Queued, 0)
        .await;
    let mut events = h.orchestrator.subscribe();

    let report = h.orchestrator.recover_orphans().await.unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.requeued, 1);

    let crawling = h.target(crawling.id).await;
    assert_eq!(crawling.status, TargetStatus::RetryPending);
    assert_eq!(crawling.retry_count, 1);
    assert_eq!(
        crawling.last_error.as_deref(),
        Some("interrupted: process handle lost")
    );

    let (status, _) = wait_finished(&mut events, queued.id).await;
    assert_eq!(status, TargetStatus::Ready);

    // Nothing left to recover.
    let report = h.orchestrator.recover_orphans().await.unwrap();
    assert_eq!(report.interrupted + report.requeued, 0);
}

#[tokio::test]
async fn status_serves_live_then_stored_log() {
    let h = Harness::with_tool("echo one\necho two >&2\nexec sleep 30");
    let target = h.add(CaptureMethod::Mirror).await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(target.id).await.unwrap();
    wait_started(&mut events, target.id).await;

    let mut report = h.orchestrator.query_status(target.id, 50).await.unwrap();
    for _ in 0..40 {
        if report.log_tail.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        report = h.orchestrator.query_status(target.id, 50).await.unwrap();
    }
    assert_eq!(report.status, TargetStatus::Crawling);
    assert!(report.job.is_some());
    assert_eq!(report.log_tail.len(), 2);
    assert!(report.log_tail.contains(&"one".to_string()));

    h.orchestrator.request_cancel(target.id).await.unwrap();
    wait_finished(&mut events, target.id).await;

    let report = h.orchestrator.query_status(target.id, 1).await.unwrap();
    assert_eq!(report.status, TargetStatus::Cancelled);
    assert!(report.job.is_none());
    assert_eq!(report.log_tail.len(), 1);
}

#[tokio::test]
async fn shutdown_interrupts_running_and_leaves_queued() {
    let h = Harness::new(|dir, config| {
        config.mirror.tool.program = write_script(dir, "wget.sh", HANG).display().to_string();
        config.max_concurrent_jobs = 1;
    });
    let running = h.add(CaptureMethod::Mirror).await;
    let waiting = h.add(CaptureMethod::Mirror).await;
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.request_start(running.id).await.unwrap();
    h.orchestrator.request_start(waiting.id).await.unwrap();
    wait_started(&mut events, running.id).await;

    assert!(h.orchestrator.shutdown(Duration::from_secs(10)).await);

    let running = h.target(running.id).await;
    assert_eq!(running.status, TargetStatus::RetryPending);
    assert_eq!(running.retry_count, 1);
    assert_eq!(h.target(waiting.id).await.status, TargetStatus::Queued);
    assert!(h.orchestrator.list_active(0).is_empty());
}

#[tokio::test]
async fn invalid_urls_are_rejected() {
    let h = Harness::with_tool(HANG);
    for url in ["not a url", "ftp://example.org/"] {
        let err = h
            .orchestrator
            .add_target(archivd::core::NewTarget::new(url, CaptureMethod::Mirror))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::InvalidTarget(_)), "{}", url);
    }
}

#[tokio::test]
async fn recorded_outcome_is_not_reported_active() {
    let h = Harness::with_stores(
        |dir, config| {
            config.mirror.tool.program =
                write_script(dir, "wget.sh", WGET_TIMED_OUT).display().to_string();
        },
        |store| store as Arc<dyn TargetStore>,
        |store| {
            Arc::new(SlowLogs {
                inner: store,
                delay: Duration::from_millis(800),
            }) as Arc<dyn LogStore>
        },
    );
    let target = h.add(CaptureMethod::Mirror).await;

    h.orchestrator.request_start(target.id).await.unwrap();
    wait_for_status(&h.store, target.id, TargetStatus::RetryPending).await;

    // The crawl log is still being written, but the outcome is recorded.
    let report = h.orchestrator.query_status(target.id, 10).await.unwrap();
    assert_eq!(report.status, TargetStatus::RetryPending);
    assert!(report.job.is_none());
    assert!(h.orchestrator.list_active(0).is_empty());
    assert!(!h.orchestrator.request_cancel(target.id).await.unwrap());

    let restart = h.orchestrator.request_start(target.id).await.unwrap();
    assert!(matches!(restart, StartOutcome::Started { .. }), "{:?}", restart);

    h.orchestrator.wait_idle().await;
    let records = h.store.records(target.id);
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].attempt, 2);
    assert_eq!(h.target(target.id).await.retry_count, 2);
}

#[tokio::test]
async fn lifecycle_conflict_forces_error_for_that_target_only() {
    let h = Harness::with_tool("echo started\nsleep 2\necho '<html>ok</html>' > \"$2\"");
    let scheduler = Scheduler::new(h.orchestrator.clone());
    let conflicted = h.add(CaptureMethod::SinglePage).await;
    let bystander = h.add(CaptureMethod::SinglePage).await;
    let mut conflicted_events = h.orchestrator.subscribe();
    let mut bystander_events = h.orchestrator.subscribe();

    h.orchestrator.request_start(conflicted.id).await.unwrap();
    h.orchestrator.request_start(bystander.id).await.unwrap();
    wait_started(&mut conflicted_events, conflicted.id).await;

    // An outside write moves the record while the capture is running.
    let mut moved = h.target(conflicted.id).await;
    moved.status = TargetStatus::Queued;
    h.store.put(moved);

    let (status, kind) = wait_finished(&mut conflicted_events, conflicted.id).await;
    assert_eq!(status, TargetStatus::Error);
    assert_eq!(kind, OutcomeKind::Success);
    let stranded = h.target(conflicted.id).await;
    assert_eq!(stranded.status, TargetStatus::Error);
    assert_eq!(stranded.retry_count, 0);
    let error = stranded.last_error.unwrap();
    assert!(error.starts_with("internal:"), "{}", error);

    let (status, _) = wait_finished(&mut bystander_events, bystander.id).await;
    assert_eq!(status, TargetStatus::Ready);
    assert_eq!(h.target(bystander.id).await.status, TargetStatus::Ready);

    // Sweeps leave `error` alone; an explicit start moves it on.
    let report = scheduler
        .retry_sweep(Utc::now() + chrono::Duration::days(1))
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);

    let outcome = h.orchestrator.request_start(conflicted.id).await.unwrap();
    assert!(outcome.admitted());
    let (status, _) = wait_finished(&mut conflicted_events, conflicted.id).await;
    assert_eq!(status, TargetStatus::Ready);
}
