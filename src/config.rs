//! Configuration module for accounts, tasks and runtime settings
//!
//! The task document is loaded from a TOML or JSON file. Runtime knobs
//! (timeouts, backoff, batch size) come from environment variables following
//! the pattern `MAIL_TRIAGE_<KEY>`. Counter files are kept in the directory
//! that holds the configuration file.

use std::collections::BTreeMap;
use std::env;
use std::env::VarError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use schemars::JsonSchema;
use secrecy::SecretString;
use serde::Deserialize;

use crate::errors::{AppError, AppResult};
use crate::models::{EditMode, SelectFilter, TaskConfig};

const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_SMTP_PORT: u16 = 25;

/// Raw configuration document, as written by the operator
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigDocument {
    /// Mail-receiving accounts keyed by name
    #[serde(default)]
    pub imap_accounts: BTreeMap<String, ImapAccountEntry>,
    /// Relay accounts keyed by name
    #[serde(default)]
    pub smtp_accounts: BTreeMap<String, SmtpAccountEntry>,
    /// Tasks keyed by name
    pub tasks: BTreeMap<String, TaskEntry>,
}

/// IMAP account entry
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ImapAccountEntry {
    pub username: String,
    pub password: String,
    /// `host[:port]`, implicit TLS, port defaults to 993
    pub server: String,
}

/// SMTP relay entry
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SmtpAccountEntry {
    /// `host[:port]`, port defaults to 25
    pub server: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Task entry
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TaskEntry {
    pub imap_account: String,
    #[serde(default)]
    pub smtp_account: Option<String>,
    pub watch_folder: String,
    pub select_message: SelectFilter,
    pub edit_copy: EditMode,
    #[serde(default)]
    pub store_copy_in: Option<String>,
    #[serde(default)]
    pub forward_copy_to: Option<String>,
    #[serde(default)]
    pub delete_message: bool,
    #[serde(default)]
    pub rt_tag: Option<String>,
}

/// IMAP account configuration
///
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct ImapAccount {
    /// Account name from the document
    pub name: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
}

/// SMTP relay configuration
#[derive(Debug, Clone)]
pub struct SmtpAccount {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<SecretString>,
}

/// Runtime settings shared by all workers
#[derive(Debug, Clone)]
pub struct Settings {
    /// Delay between a disconnect and the next connect attempt
    pub backoff: Duration,
    /// Upper bound for one scan of the watch folder
    pub scan_timeout: Duration,
    /// Upper bound for one change-notification wait
    pub watch_timeout: Duration,
    /// Maximum number of most recent messages fetched per scan
    pub scan_batch: u32,
    /// Poll interval when the server lacks IDLE
    pub poll_interval: Duration,
    /// TCP connection timeout
    pub connect_timeout: Duration,
    /// TLS handshake, greeting and LOGIN timeout
    pub greeting_timeout: Duration,
    /// Per-command socket timeout
    pub socket_timeout: Duration,
    /// How long shutdown waits for workers to return
    pub shutdown_grace: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(15),
            scan_timeout: Duration::from_secs(60),
            watch_timeout: Duration::from_secs(60 * 60),
            scan_batch: 10,
            poll_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_millis(30_000),
            greeting_timeout: Duration::from_millis(15_000),
            socket_timeout: Duration::from_millis(300_000),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl Settings {
    /// Load runtime settings from environment variables
    ///
    /// # Errors
    ///
    /// Returns `Config` if a variable is set but malformed, or if the scan
    /// batch is zero.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_TRIAGE_BACKOFF_SECONDS=15
    /// MAIL_TRIAGE_SCAN_TIMEOUT_SECONDS=60
    /// MAIL_TRIAGE_WATCH_TIMEOUT_SECONDS=3600
    /// MAIL_TRIAGE_SCAN_BATCH=10
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let defaults = Self::default();
        let settings = Self {
            backoff: secs_env("MAIL_TRIAGE_BACKOFF_SECONDS", defaults.backoff)?,
            scan_timeout: secs_env("MAIL_TRIAGE_SCAN_TIMEOUT_SECONDS", defaults.scan_timeout)?,
            watch_timeout: secs_env("MAIL_TRIAGE_WATCH_TIMEOUT_SECONDS", defaults.watch_timeout)?,
            scan_batch: parse_u32_env("MAIL_TRIAGE_SCAN_BATCH", defaults.scan_batch)?,
            poll_interval: secs_env("MAIL_TRIAGE_POLL_INTERVAL_SECONDS", defaults.poll_interval)?,
            connect_timeout: Duration::from_millis(parse_u64_env(
                "MAIL_TRIAGE_CONNECT_TIMEOUT_MS",
                30_000,
            )?),
            greeting_timeout: Duration::from_millis(parse_u64_env(
                "MAIL_TRIAGE_GREETING_TIMEOUT_MS",
                15_000,
            )?),
            socket_timeout: Duration::from_millis(parse_u64_env(
                "MAIL_TRIAGE_SOCKET_TIMEOUT_MS",
                300_000,
            )?),
            shutdown_grace: secs_env("MAIL_TRIAGE_SHUTDOWN_GRACE_SECONDS", defaults.shutdown_grace)?,
        };
        if settings.scan_batch == 0 {
            return Err(AppError::config("MAIL_TRIAGE_SCAN_BATCH must be at least 1"));
        }
        Ok(settings)
    }
}

/// Fully validated configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Receiving accounts keyed by name
    pub imap_accounts: BTreeMap<String, ImapAccount>,
    /// Relay accounts keyed by name
    pub smtp_accounts: BTreeMap<String, SmtpAccount>,
    /// Tasks keyed by name
    pub tasks: BTreeMap<String, TaskConfig>,
    /// Directory holding the per-task counter files
    pub state_dir: PathBuf,
}

impl AppConfig {
    /// Read, parse and validate the configuration file
    ///
    /// The format follows the file extension: `.toml` or `.json`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unreadable files, unknown extensions, parse
    /// failures and semantic validation failures.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        let document = parse_document(path, &text)?;
        let state_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_document(document, state_dir)
    }

    /// Validate a parsed document and resolve account references
    pub fn from_document(document: ConfigDocument, state_dir: PathBuf) -> AppResult<Self> {
        let mut imap_accounts = BTreeMap::new();
        for (name, entry) in document.imap_accounts {
            let (host, port) = split_server(&entry.server, DEFAULT_IMAP_PORT)
                .map_err(|e| AppError::Config(format!("imap account '{name}': {e}")))?;
            required(&entry.username, &format!("imap account '{name}' username"))?;
            imap_accounts.insert(
                name.clone(),
                ImapAccount {
                    name,
                    host,
                    port,
                    user: entry.username,
                    pass: SecretString::new(entry.password.into()),
                },
            );
        }

        let mut smtp_accounts = BTreeMap::new();
        for (name, entry) in document.smtp_accounts {
            let (host, port) = split_server(&entry.server, DEFAULT_SMTP_PORT)
                .map_err(|e| AppError::Config(format!("smtp account '{name}': {e}")))?;
            if entry.username.is_some() != entry.password.is_some() {
                return Err(AppError::Config(format!(
                    "smtp account '{name}': username and password must be set together"
                )));
            }
            smtp_accounts.insert(
                name.clone(),
                SmtpAccount {
                    name,
                    host,
                    port,
                    user: entry.username,
                    pass: entry.password.map(|p| SecretString::new(p.into())),
                },
            );
        }

        if document.tasks.is_empty() {
            return Err(AppError::config("no tasks configured"));
        }

        let mut tasks = BTreeMap::new();
        for (name, entry) in document.tasks {
            let task = resolve_task(name.clone(), entry, &imap_accounts, &smtp_accounts)?;
            tasks.insert(name, task);
        }

        Ok(Self {
            imap_accounts,
            smtp_accounts,
            tasks,
            state_dir,
        })
    }

    /// Get receiving account by name
    ///
    /// # Errors
    ///
    /// Returns `Config` if the account is not configured.
    pub fn imap_account(&self, name: &str) -> AppResult<&ImapAccount> {
        self.imap_accounts
            .get(name)
            .ok_or_else(|| AppError::Config(format!("imap account '{name}' is not configured")))
    }

    /// Get relay account by name
    pub fn smtp_account(&self, name: &str) -> AppResult<&SmtpAccount> {
        self.smtp_accounts
            .get(name)
            .ok_or_else(|| AppError::Config(format!("smtp account '{name}' is not configured")))
    }
}

/// Parse the document according to the file extension
pub fn parse_document(path: &Path, text: &str) -> AppResult<ConfigDocument> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(text)
            .map_err(|e| AppError::Config(format!("failed to parse {}: {e}", path.display()))),
        Some("json") => serde_json::from_str(text)
            .map_err(|e| AppError::Config(format!("failed to parse {}: {e}", path.display()))),
        _ => Err(AppError::Config(format!(
            "unsupported config format for {}; use .toml or .json",
            path.display()
        ))),
    }
}

/// JSON Schema of the configuration document
pub fn document_schema() -> AppResult<String> {
    let schema = schemars::schema_for!(ConfigDocument);
    serde_json::to_string_pretty(&schema)
        .map_err(|e| AppError::Internal(format!("schema serialization failure: {e}")))
}

/// Validate one task entry against the account tables
fn resolve_task(
    name: String,
    entry: TaskEntry,
    imap_accounts: &BTreeMap<String, ImapAccount>,
    smtp_accounts: &BTreeMap<String, SmtpAccount>,
) -> AppResult<TaskConfig> {
    validate_task_name(&name)?;
    let ctx = |msg: String| AppError::Config(format!("task '{name}': {msg}"));

    if !imap_accounts.contains_key(&entry.imap_account) {
        return Err(ctx(format!(
            "unknown imapAccount '{}'",
            entry.imap_account
        )));
    }
    if let Some(smtp) = &entry.smtp_account
        && !smtp_accounts.contains_key(smtp)
    {
        return Err(ctx(format!("unknown smtpAccount '{smtp}'")));
    }

    validate_mailbox(&entry.watch_folder).map_err(|e| ctx(format!("watchFolder: {e}")))?;
    if let Some(folder) = &entry.store_copy_in {
        validate_mailbox(folder).map_err(|e| ctx(format!("storeCopyIn: {e}")))?;
    }

    if let Some(address) = &entry.forward_copy_to {
        if entry.smtp_account.is_none() {
            return Err(ctx("forwardCopyTo requires smtpAccount".to_owned()));
        }
        address
            .parse::<lettre::Address>()
            .map_err(|e| ctx(format!("invalid forwardCopyTo '{address}': {e}")))?;
    }

    if let Some(tag) = &entry.rt_tag {
        if tag.trim().is_empty() {
            return Err(ctx("rtTag must not be empty".to_owned()));
        }
        validate_no_controls(tag, "rtTag").map_err(|e| ctx(e.to_string()))?;
    }

    Ok(TaskConfig {
        name,
        imap_account: entry.imap_account,
        smtp_account: entry.smtp_account,
        watch_folder: entry.watch_folder,
        select: entry.select_message,
        edit: entry.edit_copy,
        archive_folder: entry.store_copy_in,
        forward_to: entry.forward_copy_to,
        delete_original: entry.delete_message,
        tag: entry.rt_tag,
    })
}

/// Split `host[:port]`, accepting bracketed IPv6 literals
fn split_server(server: &str, default_port: u16) -> AppResult<(String, u16)> {
    let server = server.trim();
    if server.is_empty() {
        return Err(AppError::config("server must not be empty"));
    }

    let (host, port) = if let Some(rest) = server.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| AppError::Config(format!("unterminated IPv6 literal in '{server}'")))?;
        (host, tail.strip_prefix(':'))
    } else {
        match server.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => (host, Some(port)),
            _ => (server, None),
        }
    };

    if host.is_empty() {
        return Err(AppError::Config(format!("missing host in '{server}'")));
    }
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| AppError::Config(format!("invalid port in '{server}'")))?,
        None => default_port,
    };
    Ok((host.to_owned(), port))
}

/// Task names become IMAP keyword flags, so they must be valid atoms
fn validate_task_name(name: &str) -> AppResult<()> {
    if name.is_empty() || name.len() > 59 {
        return Err(AppError::Config(format!(
            "task name '{name}' must be 1..59 characters"
        )));
    }
    if name.chars().any(|ch| {
        !ch.is_ascii()
            || ch.is_ascii_control()
            || ch.is_ascii_whitespace()
            || matches!(ch, '"' | '(' | ')' | '{' | '}' | '\\' | '%' | '*' | ']' | '/')
    }) {
        return Err(AppError::Config(format!(
            "task name '{name}' must not contain whitespace, control chars, quotes, wildcards, slashes, parentheses, or braces"
        )));
    }
    Ok(())
}

/// Validate mailbox name format
fn validate_mailbox(mailbox: &str) -> AppResult<()> {
    if mailbox.is_empty() || mailbox.len() > 256 {
        return Err(AppError::config("mailbox must be 1..256 characters"));
    }
    validate_no_controls(mailbox, "mailbox")?;
    if mailbox.contains(['"', '\\']) {
        return Err(AppError::config("mailbox must not contain quotes or backslashes"));
    }
    Ok(())
}

/// Reject control characters in operator-provided values
fn validate_no_controls(value: &str, field: &str) -> AppResult<()> {
    if value.chars().any(|ch| ch.is_control()) {
        return Err(AppError::Config(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(())
}

fn required(value: &str, field: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::Config(format!("{field} must not be empty")));
    }
    Ok(())
}

fn secs_env(key: &str, default: Duration) -> AppResult<Duration> {
    parse_u64_env(key, default.as_secs()).map(Duration::from_secs)
}

/// Parse a `u64` environment variable with default fallback
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<u64>().map_err(|_| {
            AppError::Config(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u32` environment variable with default fallback
fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    match env::var(key) {
        Ok(v) => v.trim().parse::<u32>().map_err(|_| {
            AppError::Config(format!("invalid u32 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}
