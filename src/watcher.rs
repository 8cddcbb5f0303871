//! Change notification on the watch folder

use std::time::Duration;

use tracing::debug;

use crate::errors::AppResult;
use crate::mailbox::MailboxConnection;
use crate::models::{FolderInfo, WatchOutcome};

/// Select `folder` and block until it changes or `limit` elapses
///
/// `scanned` is the folder state the last scan worked from. Servers only
/// notify about changes made after the wait starts, so if the folder has
/// already moved on from it this returns `Changed` without waiting.
///
/// Both outcomes send the worker back to scanning; a timeout only means
/// nothing was reported, not that nothing changed.
///
/// # Errors
///
/// Returns the connection's error if the folder cannot be selected or the
/// wait cannot be established.
pub async fn watch<C>(
    conn: &mut C,
    folder: &str,
    scanned: &FolderInfo,
    limit: Duration,
) -> AppResult<WatchOutcome>
where
    C: MailboxConnection + ?Sized,
{
    let info = conn.select_folder(folder).await?;
    if info.moved_on_from(scanned) {
        debug!(
            folder,
            exists = info.exists,
            uid_next = ?info.uid_next,
            "folder changed since scan"
        );
        return Ok(WatchOutcome::Changed);
    }
    debug!(
        folder,
        exists = info.exists,
        uid_validity = ?info.uid_validity,
        timeout_secs = limit.as_secs(),
        "waiting for changes"
    );
    let outcome = conn.wait_for_change(limit).await?;
    match outcome {
        WatchOutcome::Changed => debug!(folder, "change reported"),
        WatchOutcome::TimedOut => debug!(folder, "watch timed out without change"),
    }
    Ok(outcome)
}
