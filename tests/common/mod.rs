#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use archivd::config::AppConfig;
use archivd::core::{
    CaptureMethod, CrawlEvent, LogStore, NewTarget, Orchestrator, OutcomeKind, Target, TargetId,
    TargetStatus, TargetStore,
};
use archivd::db::MemoryStore;
use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::time::timeout;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Fake wget that fails the way an unreachable host does.
pub const WGET_TIMED_OUT: &str = r#"echo "Connecting to example.org|93.184.216.34|:443... failed: Connection timed out." >&2
exit 4"#;

/// Fake capture tool that runs until it is killed.
pub const HANG: &str = "echo started\nexec sleep 30";

/// Fake single-file: second argument is the output path.
pub const SINGLE_PAGE_OK: &str = r#"echo "<html><body>archived</body></html>" > "$2""#;

/// Write an executable `/bin/sh` script into `dir`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn test_config(dir: &Path) -> AppConfig {
    AppConfig {
        database_path: dir.join("archivd.db"),
        archive_root: dir.join("archive"),
        kill_grace_secs: 1,
        ..AppConfig::default()
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    /// Build an orchestrator over a `MemoryStore`. `configure` can write
    /// fake tools into the temp dir and point the config at them.
    pub fn new(configure: impl FnOnce(&Path, &mut AppConfig)) -> Self {
        Self::with_stores(
            configure,
            |store| store as Arc<dyn TargetStore>,
            |store| store as Arc<dyn LogStore>,
        )
    }

    /// Like `new`, but the orchestrator sees the `MemoryStore` through
    /// wrappers, e.g. to inject delays or concurrent writes.
    pub fn with_stores(
        configure: impl FnOnce(&Path, &mut AppConfig),
        targets: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn TargetStore>,
        logs: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn LogStore>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        configure(dir.path(), &mut config);

        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            targets(store.clone()),
            logs(store.clone()),
        );
        Self {
            dir,
            store,
            orchestrator,
        }
    }

    /// Every method runs the same script.
    pub fn with_tool(body: &str) -> Self {
        Self::new(|dir, config| {
            let tool = write_script(dir, "tool.sh", body);
            for method in [
                CaptureMethod::Mirror,
                CaptureMethod::Channel,
                CaptureMethod::SinglePage,
            ] {
                config.method_mut(method).program = tool.display().to_string();
            }
        })
    }

    pub async fn add(&self, method: CaptureMethod) -> Target {
        self.orchestrator
            .add_target(NewTarget::new("https://example.org/", method))
            .await
            .unwrap()
    }

    /// Place a target in an arbitrary persisted state.
    pub async fn add_in(&self, method: CaptureMethod, status: TargetStatus, retry_count: u32) -> Target {
        let mut target = self.add(method).await;
        target.status = status;
        target.retry_count = retry_count;
        target.updated_at = Utc::now();
        self.store.put(target.clone());
        target
    }

    pub async fn target(&self, id: TargetId) -> Target {
        self.store.get(id).await.unwrap().unwrap()
    }
}

/// Poll the store until `target_id` reaches `status`.
pub async fn wait_for_status(store: &MemoryStore, target_id: TargetId, status: TargetStatus) -> Target {
    timeout(EVENT_TIMEOUT, async {
        loop {
            if let Some(target) = store.get(target_id).await.unwrap() {
                if target.status == status {
                    return target;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for target status")
}

/// Wait for the next `Started` event for `target_id`.
pub async fn wait_started(events: &mut broadcast::Receiver<CrawlEvent>, target_id: TargetId) {
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(CrawlEvent::Started { target_id: t, .. }) if t == target_id => return,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timeout waiting for Started event")
}

/// Wait for the `Finished` event for `target_id`.
pub async fn wait_finished(
    events: &mut broadcast::Receiver<CrawlEvent>,
    target_id: TargetId,
) -> (TargetStatus, OutcomeKind) {
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(CrawlEvent::Finished {
                    target_id: t,
                    status,
                    outcome,
                    ..
                }) if t == target_id => return (status, outcome),
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timeout waiting for Finished event")
}

/// Next `Started` event for any target.
pub async fn next_started(events: &mut broadcast::Receiver<CrawlEvent>) -> TargetId {
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(CrawlEvent::Started { target_id, .. }) => return target_id,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("timeout waiting for Started event")
}
