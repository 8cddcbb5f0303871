//! Per-task control loop
//!
//! A worker owns its task's only session and cycles
//! `Connecting -> Ready -> Scanning -> Watching -> Ready -> ...`. Any failure
//! from an active state discards the session without LOGOUT, returns to
//! `Disconnected` and sleeps for the backoff before reconnecting. The loop
//! only ends when the shutdown token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::counter::TicketCounter;
use crate::errors::{AppError, AppResult};
use crate::mailbox::Connector;
use crate::models::{TaskConfig, TaskRuntime, WatchOutcome};
use crate::race::{Raced, race_with_timeout};
use crate::relay::Relay;
use crate::scanner::{ScanContext, scan};
use crate::watcher::watch;

/// Lifecycle state of a [`TaskWorker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Disconnected,
    Connecting,
    Ready,
    Scanning,
    Watching,
}

pub struct TaskWorker<K: Connector> {
    task: TaskConfig,
    runtime: TaskRuntime<K::Connection>,
    connector: K,
    counter: Option<TicketCounter>,
    relay: Option<Arc<dyn Relay>>,
    settings: Settings,
    state: WorkerState,
}

impl<K: Connector> TaskWorker<K> {
    pub fn new(
        task: TaskConfig,
        connector: K,
        counter: Option<TicketCounter>,
        relay: Option<Arc<dyn Relay>>,
        settings: Settings,
    ) -> Self {
        Self {
            runtime: TaskRuntime::new(task.name.clone()),
            task,
            connector,
            counter,
            relay,
            settings,
            state: WorkerState::Disconnected,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Cancellation drops whatever operation is in flight, including a
    /// half-processed message; it is picked up again on the next start.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            endpoint = %self.connector.endpoint(),
            folder = %self.task.watch_folder,
            "worker started"
        );
        loop {
            let result = tokio::select! {
                biased;
                () = shutdown.cancelled() => None,
                result = self.step() => Some(result),
            };
            let Some(result) = result else { break };
            if let Err(error) = result {
                self.fail(&error);
                if !backoff(self.settings.backoff, &shutdown).await {
                    break;
                }
            }
        }
        if self.runtime.abort_connection() {
            debug!("session dropped on shutdown");
        }
        self.transition(WorkerState::Disconnected);
        info!("worker stopped");
    }

    /// One cycle: connect if needed, scan, then watch
    pub async fn step(&mut self) -> AppResult<()> {
        if self.runtime.connection.is_none() {
            self.transition(WorkerState::Connecting);
            let conn = self.connector.connect().await?;
            self.runtime.connection = Some(conn);
            info!(endpoint = %self.connector.endpoint(), "connected");
            self.transition(WorkerState::Ready);
        }

        self.transition(WorkerState::Scanning);
        let scan_timeout = self.settings.scan_timeout;
        let ctx = ScanContext {
            task: &self.task,
            counter: self.counter.as_ref(),
            relay: self.relay.as_deref(),
            batch: self.settings.scan_batch,
        };
        let conn = self
            .runtime
            .connection
            .as_mut()
            .ok_or_else(|| AppError::Internal("scan without a live session".to_owned()))?;
        let report = match race_with_timeout(scan_timeout, scan(conn, &ctx)).await {
            Raced::Finished(report) => report?,
            Raced::TimedOut => {
                return Err(AppError::Timeout(format!(
                    "scan exceeded {}s",
                    scan_timeout.as_secs()
                )));
            }
        };
        if report.processed > 0 || report.failed > 0 {
            info!(
                fetched = report.fetched,
                processed = report.processed,
                seen = report.already_processed,
                skipped = report.not_selected,
                failed = report.failed,
                "scan complete"
            );
        } else {
            debug!(fetched = report.fetched, "scan complete, nothing new");
        }

        self.transition(WorkerState::Watching);
        let watch_timeout = self.settings.watch_timeout;
        let guard = watch_timeout + self.settings.socket_timeout;
        let conn = self
            .runtime
            .connection
            .as_mut()
            .ok_or_else(|| AppError::Internal("watch without a live session".to_owned()))?;
        let watching = watch(conn, &self.task.watch_folder, &report.folder, watch_timeout);
        let outcome = match race_with_timeout(guard, watching).await {
            Raced::Finished(outcome) => outcome?,
            Raced::TimedOut => {
                return Err(AppError::Timeout(format!(
                    "watch did not return within {}s",
                    guard.as_secs()
                )));
            }
        };
        if outcome == WatchOutcome::TimedOut {
            debug!("watch timed out, rescanning");
        }
        self.transition(WorkerState::Ready);
        Ok(())
    }

    fn fail(&mut self, error: &AppError) {
        let dropped = self.runtime.abort_connection();
        warn!(
            task = %self.runtime.name,
            error = %error,
            state = ?self.state,
            session_dropped = dropped,
            backoff_secs = self.settings.backoff.as_secs(),
            "task interrupted, reconnecting after backoff"
        );
        self.transition(WorkerState::Disconnected);
    }

    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "state change");
            self.state = next;
        }
    }
}

/// Sleep for `delay`; `false` when shutdown arrived first
async fn backoff(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
