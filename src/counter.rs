//! Durable per-task ticket counter
//!
//! One small file per task, `<task>.cnt`, holding `<YY>-<N>`. Updates write a
//! uniquely named sibling file, flush it, and rename it over the counter, so a
//! reader sees either the previous record or the new one, never a torn value.

use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Datelike;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

/// Ticket identifier
///
/// # Format
///
/// `<year>-<sequence>`, where `year` is the two-digit year.
///
/// # Example
///
/// ```text
/// 24-7
/// 25-1
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketId {
    /// Two-digit year
    pub year: u32,
    /// Sequence within the year, starting at 1
    pub seq: u64,
}

impl TicketId {
    /// Parse a stored counter record
    ///
    /// Surrounding whitespace is ignored. Returns error if the record has no
    /// `-` separator or either side is not a non-negative integer.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let (year, seq) = raw
            .trim()
            .split_once('-')
            .ok_or_else(|| AppError::Counter(format!("malformed counter record '{raw}'")))?;
        let year = year
            .trim()
            .parse::<u32>()
            .map_err(|_| AppError::Counter(format!("invalid year in counter record '{raw}'")))?;
        let seq = seq
            .trim()
            .parse::<u64>()
            .map_err(|_| AppError::Counter(format!("invalid sequence in counter record '{raw}'")))?;
        Ok(Self { year, seq })
    }

    /// Encode to the stored/displayed form
    pub fn encode(&self) -> String {
        format!("{:02}-{}", self.year, self.seq)
    }

    /// The ticket that follows this one in `year`
    ///
    /// Increments within the same year, restarts at 1 otherwise. Returns
    /// error if the sequence is exhausted.
    pub fn next_in(&self, year: u32) -> AppResult<Self> {
        if self.year != year {
            return Ok(Self { year, seq: 1 });
        }
        let seq = self.seq.checked_add(1).ok_or_else(|| {
            AppError::Counter(format!("ticket sequence exhausted at '{self}'"))
        })?;
        Ok(Self { year, seq })
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Current two-digit year in local time
pub fn current_year() -> u32 {
    chrono::Local::now().year().rem_euclid(100) as u32
}

/// Counter file for one task
///
/// The owning worker is the only writer, and messages are processed
/// sequentially, so no locking is needed.
#[derive(Debug, Clone)]
pub struct TicketCounter {
    path: PathBuf,
    year: fn() -> u32,
}

impl TicketCounter {
    /// Counter for `task_name`, stored in `state_dir`
    pub fn new(state_dir: &Path, task_name: &str) -> Self {
        Self {
            path: state_dir.join(format!("{task_name}.cnt")),
            year: current_year,
        }
    }

    /// Replace the clock used by [`Self::next_ticket`]
    pub fn with_year_source(mut self, year: fn() -> u32) -> Self {
        self.year = year;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the stored record
    ///
    /// # Errors
    ///
    /// `Counter` if the file is missing, unreadable or malformed.
    pub fn current(&self) -> AppResult<TicketId> {
        let raw = fs::read_to_string(&self.path).map_err(|e| {
            AppError::Counter(format!("cannot read {}: {e}", self.path.display()))
        })?;
        TicketId::parse(&raw)
    }

    /// Mint the next ticket for the current year and persist it
    pub fn next_ticket(&self) -> AppResult<TicketId> {
        self.next_ticket_in((self.year)())
    }

    /// [`Self::next_ticket`] on the blocking pool
    pub async fn mint(&self) -> AppResult<TicketId> {
        let counter = self.clone();
        tokio::task::spawn_blocking(move || counter.next_ticket())
            .await
            .map_err(|e| AppError::Counter(format!("ticket counter task failed: {e}")))?
    }

    /// Mint the next ticket for `year` and persist it
    pub fn next_ticket_in(&self, year: u32) -> AppResult<TicketId> {
        let next = self.current()?.next_in(year)?;
        self.stage(next)?.commit()?;
        Ok(next)
    }

    /// Write `ticket` to a fresh temporary file next to the counter
    ///
    /// The counter itself is untouched until [`StagedTicket::commit`].
    pub fn stage(&self, ticket: TicketId) -> AppResult<StagedTicket> {
        let temp = self
            .path
            .with_file_name(format!("{}.{}", self.file_name(), Uuid::new_v4().simple()));
        let written = File::create(&temp).and_then(|mut file| {
            file.write_all(ticket.encode().as_bytes())?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(AppError::Counter(format!(
                "cannot write {}: {e}",
                temp.display()
            )));
        }
        Ok(StagedTicket {
            temp,
            target: self.path.clone(),
        })
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// A ticket written to its temporary file but not yet visible
#[derive(Debug)]
#[must_use = "a staged ticket is not persisted until committed"]
pub struct StagedTicket {
    temp: PathBuf,
    target: PathBuf,
}

impl StagedTicket {
    /// Atomically replace the counter file with the staged record
    ///
    /// The containing directory is flushed afterwards so the rename itself
    /// survives a power loss.
    pub fn commit(self) -> AppResult<()> {
        fs::rename(&self.temp, &self.target).map_err(|e| {
            let _ = fs::remove_file(&self.temp);
            AppError::Counter(format!(
                "cannot replace {}: {e}",
                self.target.display()
            ))
        })?;
        sync_parent(&self.target)
    }

    #[cfg(test)]
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> AppResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|e| AppError::Counter(format!("cannot flush {}: {e}", dir.display())))
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> AppResult<()> {
    Ok(())
}
