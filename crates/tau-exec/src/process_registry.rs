//! Live-process registry used to cancel in-flight runs when the host stops.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
/// Public struct `ActiveRunSnapshot` used across Tau exec components.
pub struct ActiveRunSnapshot {
    pub run_id: u64,
    pub handler: String,
    pub program: String,
    pub pid: Option<u32>,
    pub started_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
/// Public struct `ProcessShutdownReport` used across Tau exec components.
pub struct ProcessShutdownReport {
    pub cancelled_runs: usize,
    pub remaining_runs: usize,
}

#[derive(Debug, Default)]
struct ProcessRegistryInner {
    root: CancellationToken,
    next_run_id: AtomicU64,
    runs: Mutex<BTreeMap<u64, ActiveRunSnapshot>>,
    idle: Notify,
}

#[derive(Debug, Clone, Default)]
/// Tracks every spawned process and owns the root cancellation scope.
///
/// Trigger scopes are children of the root token, so [`ProcessRegistry::shutdown`]
/// reaches every run regardless of which handler started it.
pub struct ProcessRegistry {
    inner: Arc<ProcessRegistryInner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the cancellation scope for one trigger.
    pub fn trigger_scope(&self) -> CancellationToken {
        self.inner.root.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    pub fn register(&self, handler: &str, program: &str, pid: Option<u32>) -> RunRegistration {
        let run_id = self.inner.next_run_id.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = ActiveRunSnapshot {
            run_id,
            handler: handler.to_string(),
            program: program.to_string(),
            pid,
            started_unix_ms: current_unix_timestamp_ms(),
        };
        if let Ok(mut runs) = self.inner.runs.lock() {
            runs.insert(run_id, snapshot);
        }
        RunRegistration {
            registry: self.clone(),
            run_id,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.runs.lock().map(|runs| runs.len()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<ActiveRunSnapshot> {
        self.inner
            .runs
            .lock()
            .map(|runs| runs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Cancels every live run and waits up to `grace` for them to be reaped.
    pub async fn shutdown(&self, grace: Duration) -> ProcessShutdownReport {
        self.inner.root.cancel();
        let cancelled_runs = self.active_count();
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.inner.idle.notified();
            if self.active_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }
        let report = ProcessShutdownReport {
            cancelled_runs,
            remaining_runs: self.active_count(),
        };
        if report.remaining_runs > 0 {
            tracing::warn!(
                cancelled_runs = report.cancelled_runs,
                remaining_runs = report.remaining_runs,
                "exec runs still active after shutdown grace period"
            );
        }
        report
    }

    fn release(&self, run_id: u64) {
        if let Ok(mut runs) = self.inner.runs.lock() {
            runs.remove(&run_id);
        }
        self.inner.idle.notify_waiters();
    }
}

#[derive(Debug)]
/// Removes its run from the registry when dropped.
pub struct RunRegistration {
    registry: ProcessRegistry,
    run_id: u64,
}

impl RunRegistration {
    pub fn run_id(&self) -> u64 {
        self.run_id
    }
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        self.registry.release(self.run_id);
    }
}

fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
