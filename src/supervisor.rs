//! Task supervision and process shutdown
//!
//! Starts one [`TaskWorker`] per configured task on a [`JoinSet`]. Workers
//! share nothing except the shutdown token. On shutdown the supervisor
//! gives them a grace period to return, then aborts whatever is left.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::{AppConfig, ImapAccount, Settings};
use crate::counter::TicketCounter;
use crate::errors::{AppError, AppResult};
use crate::imap::ImapConnector;
use crate::mailbox::Connector;
use crate::models::{EditMode, TaskConfig};
use crate::relay::{Relay, SmtpRelay};
use crate::worker::TaskWorker;

pub struct TaskSupervisor {
    config: AppConfig,
    settings: Settings,
}

impl TaskSupervisor {
    pub fn new(config: AppConfig, settings: Settings) -> Self {
        Self { config, settings }
    }

    /// Run every startable task against the real IMAP and SMTP servers
    pub async fn run(self, shutdown: CancellationToken) -> AppResult<()> {
        let settings = self.settings.clone();
        self.run_with(shutdown, move |account: &ImapAccount| {
            ImapConnector::new(account.clone(), settings.clone())
        })
        .await
    }

    /// Run every startable task, opening sessions through `make_connector`
    ///
    /// # Errors
    ///
    /// `Config` when no task could be started. Rejected tasks are logged and
    /// the rest run.
    pub async fn run_with<K, F>(self, shutdown: CancellationToken, make_connector: F) -> AppResult<()>
    where
        K: Connector + 'static,
        F: Fn(&ImapAccount) -> K + Send,
    {
        let mut workers = JoinSet::new();
        for (name, task) in &self.config.tasks {
            match self.build_worker(task, &make_connector) {
                Ok(worker) => {
                    workers.spawn(
                        worker
                            .run(shutdown.clone())
                            .instrument(info_span!("task", task = %name)),
                    );
                }
                Err(e) => error!(task = %name, error = %e, "task not started"),
            }
        }
        if workers.is_empty() {
            return Err(AppError::config("no task could be started"));
        }
        info!(tasks = workers.len(), "all startable tasks running");

        shutdown.cancelled().await;
        info!(
            grace_secs = self.settings.shutdown_grace.as_secs(),
            "shutdown requested, waiting for workers"
        );
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "worker ended abnormally");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = workers.len(), "grace period elapsed, aborting workers");
            workers.abort_all();
        }
        info!("supervisor stopped");
        Ok(())
    }

    fn build_worker<K, F>(&self, task: &TaskConfig, make_connector: &F) -> AppResult<TaskWorker<K>>
    where
        K: Connector,
        F: Fn(&ImapAccount) -> K,
    {
        let account = self.config.imap_account(&task.imap_account)?;
        let counter = match task.edit {
            EditMode::RtTag => {
                let counter = TicketCounter::new(&self.config.state_dir, &task.name);
                counter.current()?;
                Some(counter)
            }
            EditMode::UnSpam | EditMode::No => None,
        };
        let relay = match (&task.forward_to, &task.smtp_account) {
            (Some(_), Some(name)) => {
                let smtp = self.config.smtp_account(name)?;
                let relay: Arc<dyn Relay> =
                    Arc::new(SmtpRelay::new(smtp, self.settings.socket_timeout)?);
                Some(relay)
            }
            (Some(_), None) => {
                return Err(AppError::Config(format!(
                    "task '{}' forwards but has no smtpAccount",
                    task.name
                )));
            }
            (None, _) => None,
        };
        Ok(TaskWorker::new(
            task.clone(),
            make_connector(account),
            counter,
            relay,
            self.settings.clone(),
        ))
    }
}

/// Check the ticket counter of every `rt-tag` task
///
/// Returns the tasks that cannot start, with the reason.
pub fn check_tasks(config: &AppConfig) -> Vec<(String, AppError)> {
    config
        .tasks
        .values()
        .filter(|task| task.edit == EditMode::RtTag)
        .filter_map(|task| {
            TicketCounter::new(&config.state_dir, &task.name)
                .current()
                .err()
                .map(|e| (task.name.clone(), e))
        })
        .collect()
}

/// Cancel `token` on Ctrl-C or SIGTERM
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "cannot listen for SIGTERM, only Ctrl-C stops the agent");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
