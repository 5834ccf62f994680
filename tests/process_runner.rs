mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use archivd::core::job::{CancelReason, CancelSignal, JobLog};
use archivd::core::runner::{Invocation, ProcessRunner, Termination};
use common::write_script;
use tempfile::TempDir;

fn invocation(dir: &TempDir, body: &str, timeout: Duration) -> Invocation {
    let script = write_script(dir.path(), "tool.sh", body);
    Invocation {
        program: script.display().to_string(),
        args: vec!["https://example.org/".to_string()],
        working_dir: Some(dir.path().to_path_buf()),
        timeout,
    }
}

fn runner() -> ProcessRunner {
    ProcessRunner::new(Duration::from_secs(1), 20)
}

#[tokio::test]
async fn captures_both_streams_and_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let inv = invocation(
        &dir,
        "echo \"fetching $1\"\nprintf 'progress 10%%\\rprogress 90%%\\n'\necho 'ERROR 404: Not Found.' >&2\nexit 8",
        Duration::from_secs(10),
    );
    let log = Arc::new(JobLog::new(100));

    let exit = runner()
        .run(&inv, &log, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(exit.termination, Termination::Exited { code: 8 });
    assert_eq!(exit.termination.exit_code(), Some(8));
    let lines = log.tail(10);
    assert!(lines.contains(&"fetching https://example.org/".to_string()));
    assert!(lines.contains(&"progress 10%".to_string()));
    assert!(lines.contains(&"progress 90%".to_string()));
    assert!(lines.contains(&"ERROR 404: Not Found.".to_string()));
    assert_eq!(exit.tail.len(), 4);
}

#[tokio::test]
async fn timeout_kills_the_process() {
    let dir = tempfile::tempdir().unwrap();
    let inv = invocation(&dir, "exec sleep 30", Duration::from_millis(300));
    let log = Arc::new(JobLog::new(100));

    let cancel = CancelSignal::new();

    let started = Instant::now();
    let exit = runner().run(&inv, &log, &cancel).await.unwrap();

    assert_eq!(exit.termination, Termination::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(10));
    // The timeout is delivered as a cancellation of the job.
    assert!(cancel.is_cancelled());
    assert_eq!(cancel.reason(), Some(CancelReason::Timeout));
}

#[tokio::test]
async fn operator_cancel_before_timeout_keeps_its_reason() {
    let dir = tempfile::tempdir().unwrap();
    let inv = invocation(&dir, "exec sleep 30", Duration::from_millis(300));
    let log = Arc::new(JobLog::new(100));
    let cancel = CancelSignal::new();
    cancel.cancel(CancelReason::Operator);

    let exit = runner().run(&inv, &log, &cancel).await.unwrap();
    assert_eq!(exit.termination, Termination::Cancelled);
    assert_eq!(cancel.reason(), Some(CancelReason::Operator));
}

#[tokio::test]
async fn cancellation_reason_is_reported() {
    for (reason, expected) in [
        (CancelReason::Operator, Termination::Cancelled),
        (CancelReason::Stuck, Termination::Stuck),
        (CancelReason::Shutdown, Termination::Interrupted),
        (CancelReason::Timeout, Termination::TimedOut),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let inv = invocation(&dir, "echo ready\nexec sleep 30", Duration::from_secs(30));
        let log = Arc::new(JobLog::new(100));
        let cancel = Arc::new(CancelSignal::new());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel(reason);
        });

        let exit = runner().run(&inv, &log, &cancel).await.unwrap();
        assert_eq!(exit.termination, expected, "{:?}", reason);
        assert_eq!(exit.termination.is_cancelled(), reason == CancelReason::Operator);
    }
}

#[tokio::test]
async fn processes_ignoring_sigterm_are_killed() {
    let dir = tempfile::tempdir().unwrap();
    let inv = invocation(
        &dir,
        "trap '' TERM\necho ready\nwhile :; do sleep 1; done",
        Duration::from_millis(300),
    );
    let log = Arc::new(JobLog::new(100));

    let started = Instant::now();
    let exit = runner()
        .run(&inv, &log, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(exit.termination, Termination::TimedOut);
    // Timeout, then the 1s grace, then SIGKILL.
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn external_signal_is_not_a_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let inv = invocation(&dir, "kill -KILL $$", Duration::from_secs(10));
    let log = Arc::new(JobLog::new(100));

    let exit = runner()
        .run(&inv, &log, &CancelSignal::new())
        .await
        .unwrap();

    assert_eq!(exit.termination, Termination::Signaled { signal: 9 });
    assert_eq!(exit.termination.signal(), Some(9));
    assert!(!exit.termination.is_cancelled());
}

#[tokio::test]
async fn missing_program_fails_to_launch() {
    let dir = tempfile::tempdir().unwrap();
    let inv = Invocation {
        program: dir.path().join("missing").display().to_string(),
        args: Vec::new(),
        working_dir: None,
        timeout: Duration::from_secs(1),
    };
    let log = Arc::new(JobLog::new(100));

    let err = runner()
        .run(&inv, &log, &CancelSignal::new())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("missing"));
}
