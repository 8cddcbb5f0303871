//! Bounded scan of the watch folder
//!
//! Fetches the most recent window of messages and runs each through the
//! pipeline in fetch order. A message-level failure skips that message; a
//! failure that leaves the session in an unknown state aborts the scan and
//! is returned to the worker.

use tracing::{debug, info, warn};

use crate::counter::TicketCounter;
use crate::errors::{AppError, AppResult};
use crate::mailbox::MailboxConnection;
use crate::mime::{MailMessage, truncate_chars};
use crate::models::{FolderInfo, Message, TaskConfig};
use crate::pipeline::{
    EditOutcome, Routing, archive_flags, carried_flags, edit_copy, is_processed, needs_ticket,
    selects, take_return_path,
};
use crate::relay::Relay;

/// Subject length kept in log lines
const LOG_SUBJECT_CHARS: usize = 80;

/// Everything a scan needs besides the connection
#[derive(Clone, Copy)]
pub struct ScanContext<'a> {
    pub task: &'a TaskConfig,
    /// Present for `rt-tag` tasks
    pub counter: Option<&'a TicketCounter>,
    /// Present for forwarding tasks
    pub relay: Option<&'a dyn Relay>,
    /// Fetch window size
    pub batch: u32,
}

/// Per-scan tallies, logged by the worker
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Folder state the window was fetched at
    pub folder: FolderInfo,
    pub fetched: usize,
    pub already_processed: usize,
    pub not_selected: usize,
    pub processed: usize,
    pub failed: usize,
}

enum Disposition {
    AlreadyProcessed,
    NotSelected,
    Processed,
}

/// Fetch the recent window of the watch folder and process it
///
/// # Errors
///
/// Returns the first connection-fatal error (select, fetch, protocol
/// timeouts). Message, counter and relay failures are logged and counted.
pub async fn scan<C>(conn: &mut C, ctx: &ScanContext<'_>) -> AppResult<ScanReport>
where
    C: MailboxConnection + ?Sized,
{
    let folder = ctx.task.watch_folder.as_str();
    let recent = conn.fetch_recent(folder, ctx.batch).await?;
    let mut report = ScanReport {
        folder: recent.folder,
        fetched: recent.messages.len(),
        ..ScanReport::default()
    };
    debug!(folder, fetched = report.fetched, "fetched recent messages");

    for message in recent.messages {
        let uid = message.uid;
        match process_message(conn, ctx, message).await {
            Ok(Disposition::AlreadyProcessed) => report.already_processed += 1,
            Ok(Disposition::NotSelected) => report.not_selected += 1,
            Ok(Disposition::Processed) => report.processed += 1,
            Err(e) if e.is_connection_fatal() => return Err(e),
            Err(e) => {
                report.failed += 1;
                warn!(uid, error = %e, "message skipped after failure");
            }
        }
    }
    Ok(report)
}

async fn process_message<C>(
    conn: &mut C,
    ctx: &ScanContext<'_>,
    message: Message,
) -> AppResult<Disposition>
where
    C: MailboxConnection + ?Sized,
{
    let task = ctx.task;
    let uid = message.uid;
    if is_processed(&message, task) {
        debug!(uid, "already processed, skipping");
        return Ok(Disposition::AlreadyProcessed);
    }

    let own_flag = task.processed_flag();
    let carried = carried_flags(&message.flags, &own_flag);
    let mut mail = MailMessage::parse(&message.raw)?;
    let subject = truncate_chars(mail.subject().unwrap_or_default(), LOG_SUBJECT_CHARS);

    if !selects(task.select, &mail) {
        info!(uid, %subject, filter = ?task.select, "not selected, skipping");
        return Ok(Disposition::NotSelected);
    }

    let minted = if needs_ticket(task.edit, task.ticket_tag(), &mail) {
        let counter = ctx.counter.ok_or_else(|| {
            AppError::Counter(format!("task '{}' has no ticket counter", task.name))
        })?;
        Some(counter.mint().await?)
    } else {
        None
    };
    let outcome = edit_copy(task.edit, task.ticket_tag(), &mut mail, || {
        minted.ok_or_else(|| AppError::Internal("ticket requested but not minted".to_owned()))
    })?;
    match &outcome {
        EditOutcome::Tagged(ticket) => info!(uid, %subject, %ticket, "ticket assigned"),
        EditOutcome::AlreadyTagged => debug!(uid, %subject, "subject already tagged"),
        EditOutcome::Blessed => info!(uid, %subject, "spam markers removed"),
        EditOutcome::Unchanged => {}
    }

    conn.set_flag(uid, &own_flag).await?;

    let routing = Routing::for_task(task);
    if let Some(recipient) = routing.forward_to {
        let relay = ctx.relay.ok_or_else(|| {
            AppError::Relay(format!("task '{}' has no relay account", task.name))
        })?;
        let mut copy = mail.clone();
        let sender = take_return_path(&mut copy);
        relay
            .submit(sender.as_deref(), recipient, &copy.to_bytes())
            .await?;
        info!(uid, recipient, sender = sender.as_deref().unwrap_or("<>"), "forwarded");
    }

    if let Some(archive) = routing.archive_folder {
        conn.append_message(archive, &archive_flags(task, &carried), &mail.to_bytes())
            .await?;
        info!(uid, folder = archive, "archived");
    }

    if routing.delete_original {
        conn.mark_deleted_and_expunge(uid).await?;
        info!(uid, "original deleted");
    }

    Ok(Disposition::Processed)
}
