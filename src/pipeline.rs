//! Per-message decisions and transforms
//!
//! Everything here is free of IO: idempotency checks, spam/ham selection,
//! the edit-copy transforms and routing. The scanner supplies the ticket
//! minting as a closure so the counter is only touched when a subject
//! actually needs a new ticket.

use crate::counter::TicketId;
use crate::errors::AppResult;
use crate::mime::MailMessage;
use crate::models::{EditMode, Message, PROCESSED_FLAG_PREFIX, SelectFilter, TaskConfig};

/// Header set by the spam classifier on flagged messages
pub const SPAM_FLAG_HEADER: &str = "X-Spam-Flag";
/// Header holding the subject before the classifier rewrote it
pub const SPAM_PREV_SUBJECT_HEADER: &str = "X-Spam-Prev-Subject";
/// Header added to messages restored by `un-spam`
pub const BLESSING_HEADER: &str = "X-Unspammer-Blessing";

/// Classifier headers removed by `un-spam`
pub const SPAM_HEADERS: [&str; 8] = [
    SPAM_PREV_SUBJECT_HEADER,
    SPAM_FLAG_HEADER,
    "X-Spam-Status",
    "X-Spam-Level",
    "X-Spam-Score",
    "X-Spam-Tests",
    "X-Spam-Report",
    "X-Spam-Checker-Version",
];

/// Whether this task already processed the message
pub fn is_processed(message: &Message, task: &TaskConfig) -> bool {
    message.has_flag(&task.processed_flag())
}

/// Other tasks' processed-flags, preserved on archive copies
pub fn carried_flags(flags: &[String], own_flag: &str) -> Vec<String> {
    flags
        .iter()
        .filter(|f| f.starts_with(PROCESSED_FLAG_PREFIX) && f.as_str() != own_flag)
        .cloned()
        .collect()
}

/// Flags for the archive copy: own processed-flag first, then carried ones
pub fn archive_flags(task: &TaskConfig, carried: &[String]) -> Vec<String> {
    let mut flags = Vec::with_capacity(carried.len() + 1);
    flags.push(task.processed_flag());
    flags.extend(carried.iter().cloned());
    flags
}

/// Whether the spam classifier flagged the message
pub fn is_spam(mail: &MailMessage) -> bool {
    mail.header(SPAM_FLAG_HEADER).is_some_and(|v| {
        let v = v.trim();
        v.eq_ignore_ascii_case("yes") || v.eq_ignore_ascii_case("true")
    })
}

/// Apply the spam/ham/all gate
pub fn selects(filter: SelectFilter, mail: &MailMessage) -> bool {
    match filter {
        SelectFilter::Spam => is_spam(mail),
        SelectFilter::Ham => !is_spam(mail),
        SelectFilter::All => true,
    }
}

/// What the edit-copy step did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// `no` mode
    Unchanged,
    /// Subject already carried this task's tag, no ticket minted
    AlreadyTagged,
    /// Subject was prefixed with a fresh ticket
    Tagged(TicketId),
    /// Classifier headers stripped and the original subject restored
    Blessed,
}

/// Apply the task's edit-copy mode to `mail`
///
/// `mint` is called at most once, only when a ticket is needed. A minting
/// failure leaves `mail` untouched.
pub fn edit_copy<F>(mode: EditMode, tag: &str, mail: &mut MailMessage, mint: F) -> AppResult<EditOutcome>
where
    F: FnOnce() -> AppResult<TicketId>,
{
    match mode {
        EditMode::RtTag => {
            let subject = mail.subject().unwrap_or_default().to_owned();
            if has_ticket_tag(&subject, tag) {
                return Ok(EditOutcome::AlreadyTagged);
            }
            let ticket = mint()?;
            mail.set_header("Subject", &tagged_subject(tag, &ticket, &subject));
            Ok(EditOutcome::Tagged(ticket))
        }
        EditMode::UnSpam => {
            unspam(mail);
            Ok(EditOutcome::Blessed)
        }
        EditMode::No => Ok(EditOutcome::Unchanged),
    }
}

/// Whether [`edit_copy`] will call its `mint` closure for this message
pub fn needs_ticket(mode: EditMode, tag: &str, mail: &MailMessage) -> bool {
    mode == EditMode::RtTag && !has_ticket_tag(mail.subject().unwrap_or_default(), tag)
}

/// Whether `subject` already carries a ticket for `tag`
pub fn has_ticket_tag(subject: &str, tag: &str) -> bool {
    subject.contains(&format!("[{tag} -"))
}

/// `[<tag> - <ticket>] <subject>`
pub fn tagged_subject(tag: &str, ticket: &TicketId, subject: &str) -> String {
    format!("[{tag} - {ticket}] {subject}")
}

/// Restore the pre-classifier subject and strip classifier headers
///
/// When the classifier did not preserve a subject, the current one stays.
pub fn unspam(mail: &mut MailMessage) {
    if let Some(previous) = mail.header(SPAM_PREV_SUBJECT_HEADER).map(str::to_owned) {
        mail.set_header("Subject", &previous);
    }
    for header in SPAM_HEADERS {
        mail.remove_header(header);
    }
    mail.set_header(BLESSING_HEADER, "BLESSED");
}

/// Remove `Return-Path` and return the envelope sender it named
///
/// `<>` and a missing header both mean the null sender.
pub fn take_return_path(mail: &mut MailMessage) -> Option<String> {
    let value = mail.header("Return-Path").map(str::to_owned);
    mail.remove_header("Return-Path");
    let address = value?
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_owned();
    (!address.is_empty()).then_some(address)
}

/// Side effects configured for a task, in execution order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing<'a> {
    pub forward_to: Option<&'a str>,
    pub archive_folder: Option<&'a str>,
    pub delete_original: bool,
}

impl<'a> Routing<'a> {
    pub fn for_task(task: &'a TaskConfig) -> Self {
        Self {
            forward_to: task.forward_to.as_deref(),
            archive_folder: task.archive_folder.as_deref(),
            delete_original: task.delete_original,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BLESSING_HEADER, EditOutcome, SPAM_HEADERS, archive_flags, carried_flags, edit_copy,
        is_processed, needs_ticket, selects, take_return_path,
    };
    use crate::counter::TicketId;
    use crate::errors::AppError;
    use crate::mime::MailMessage;
    use crate::models::{EditMode, Message, SelectFilter, TaskConfig};

    fn task(name: &str) -> TaskConfig {
        TaskConfig {
            name: name.to_owned(),
            imap_account: "main".to_owned(),
            smtp_account: None,
            watch_folder: "INBOX".to_owned(),
            select: SelectFilter::All,
            edit: EditMode::No,
            archive_folder: None,
            forward_to: None,
            delete_original: false,
            tag: None,
        }
    }

    fn mail(headers: &str) -> MailMessage {
        MailMessage::parse(format!("{headers}\r\nbody\r\n").as_bytes()).expect("valid message")
    }

    #[test]
    fn processed_flag_is_task_specific() {
        let msg = Message {
            uid: 1,
            flags: vec!["\\Seen".to_owned(), "usp-other".to_owned()],
            raw: Vec::new(),
        };
        assert!(!is_processed(&msg, &task("helpdesk")));
        assert!(is_processed(&msg, &task("other")));
    }

    #[test]
    fn carries_only_other_tasks_flags() {
        let flags = vec![
            "\\Seen".to_owned(),
            "usp-helpdesk".to_owned(),
            "usp-cleaner".to_owned(),
            "Important".to_owned(),
        ];
        let carried = carried_flags(&flags, "usp-helpdesk");
        assert_eq!(carried, vec!["usp-cleaner".to_owned()]);
        assert_eq!(
            archive_flags(&task("helpdesk"), &carried),
            vec!["usp-helpdesk".to_owned(), "usp-cleaner".to_owned()]
        );
    }

    #[test]
    fn selection_follows_spam_flag() {
        let spam = mail("Subject: A\r\nX-Spam-Flag: YES\r\n");
        let ham = mail("Subject: B\r\nX-Spam-Flag: NO\r\n");
        let unflagged = mail("Subject: C\r\n");

        assert!(selects(SelectFilter::Spam, &spam));
        assert!(!selects(SelectFilter::Spam, &ham));
        assert!(!selects(SelectFilter::Spam, &unflagged));

        assert!(!selects(SelectFilter::Ham, &spam));
        assert!(selects(SelectFilter::Ham, &ham));
        assert!(selects(SelectFilter::Ham, &unflagged));

        assert!(selects(SelectFilter::All, &spam));
        assert!(selects(SelectFilter::All, &ham));
    }

    #[test]
    fn rt_tag_prefixes_subject_with_ticket() {
        let mut m = mail("Subject: Printer broken\r\n");
        let out = edit_copy(EditMode::RtTag, "HELP", &mut m, || {
            Ok(TicketId { year: 24, seq: 7 })
        })
        .expect("edit succeeds");
        assert_eq!(out, EditOutcome::Tagged(TicketId { year: 24, seq: 7 }));
        assert_eq!(m.subject(), Some("[HELP - 24-7] Printer broken"));
    }

    #[test]
    fn rt_tag_skips_minting_when_already_tagged() {
        let mut m = mail("Subject: Re: [HELP - 24-3] Printer broken\r\n");
        let out = edit_copy(EditMode::RtTag, "HELP", &mut m, || {
            panic!("must not mint a ticket")
        })
        .expect("edit succeeds");
        assert_eq!(out, EditOutcome::AlreadyTagged);
        assert_eq!(m.subject(), Some("Re: [HELP - 24-3] Printer broken"));
    }

    #[test]
    fn rt_tag_minting_failure_leaves_message_untouched() {
        let mut m = mail("Subject: Printer broken\r\n");
        let before = m.clone();
        let err = edit_copy(EditMode::RtTag, "HELP", &mut m, || {
            Err(AppError::Counter("corrupt".to_owned()))
        })
        .expect_err("must fail");
        assert!(matches!(err, AppError::Counter(_)));
        assert_eq!(m, before);
    }

    #[test]
    fn only_untagged_rt_tag_messages_need_a_ticket() {
        let fresh = mail("Subject: Printer broken\r\n");
        let tagged = mail("Subject: Re: [HELP - 24-3] Printer broken\r\n");
        assert!(needs_ticket(EditMode::RtTag, "HELP", &fresh));
        assert!(!needs_ticket(EditMode::RtTag, "HELP", &tagged));
        assert!(needs_ticket(EditMode::RtTag, "OPS", &tagged));
        assert!(!needs_ticket(EditMode::UnSpam, "HELP", &fresh));
        assert!(!needs_ticket(EditMode::No, "HELP", &fresh));
    }

    #[test]
    fn unspam_restores_subject_and_strips_headers() {
        let mut m = mail(
            "Subject: *****SPAM***** Buy now\r\nX-Spam-Prev-Subject: Buy now\r\nX-Spam-Flag: YES\r\nX-Spam-Status: Yes, score=9.1\r\nX-Spam-Level: *********\r\n",
        );
        let out = edit_copy(EditMode::UnSpam, "unused", &mut m, || unreachable!())
            .expect("edit succeeds");
        assert_eq!(out, EditOutcome::Blessed);
        assert_eq!(m.subject(), Some("Buy now"));
        for header in SPAM_HEADERS {
            assert!(m.header(header).is_none(), "{header} must be stripped");
        }
        assert_eq!(m.header(BLESSING_HEADER), Some("BLESSED"));
    }

    #[test]
    fn no_mode_leaves_message_alone() {
        let mut m = mail("Subject: Hello\r\nX-Spam-Flag: YES\r\n");
        let before = m.clone();
        let out = edit_copy(EditMode::No, "unused", &mut m, || unreachable!()).expect("ok");
        assert_eq!(out, EditOutcome::Unchanged);
        assert_eq!(m, before);
    }

    #[test]
    fn return_path_is_stripped_and_returned() {
        let mut m = mail("Return-Path: <bounce@example.com>\r\nSubject: x\r\n");
        assert_eq!(take_return_path(&mut m).as_deref(), Some("bounce@example.com"));
        assert!(m.header("Return-Path").is_none());

        let mut null = mail("Return-Path: <>\r\nSubject: x\r\n");
        assert_eq!(take_return_path(&mut null), None);
        assert!(null.header("Return-Path").is_none());

        let mut missing = mail("Subject: x\r\n");
        assert_eq!(take_return_path(&mut missing), None);
    }
}
