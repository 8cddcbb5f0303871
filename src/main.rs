//! mail-triage: unattended IMAP mail-triage agent
//!
//! Each configured task keeps one session to its mailbox, waits for new mail
//! with IDLE, and runs every new message through a per-task pipeline
//! (select, tag or un-spam, forward, archive, delete) at most once.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI and signal wiring
//! - [`config`]: Configuration document, validation and runtime settings
//! - [`errors`]: Application error model
//! - [`models`]: Task settings, per-task runtime and message types
//! - [`mailbox`]: Mailbox capability traits used by the core
//! - [`imap`]: IMAP implementation of the mailbox capability
//! - [`mime`]: Header parsing, editing and serialization
//! - [`pipeline`]: Pure per-message decisions and transforms
//! - [`counter`]: Durable per-task ticket counter
//! - [`relay`]: Forwarding capability over SMTP
//! - [`race`]: Race-with-timeout primitive
//! - [`scanner`]: Bounded scan of the watch folder
//! - [`watcher`]: Change notification on the watch folder
//! - [`worker`]: Per-task connection lifecycle
//! - [`supervisor`]: Task startup and process shutdown

mod config;
mod counter;
mod errors;
mod imap;
mod mailbox;
mod mime;
mod models;
mod pipeline;
mod race;
mod relay;
mod scanner;
mod supervisor;
#[cfg(test)]
mod testing;
mod watcher;
mod worker;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use config::{AppConfig, Settings};
use supervisor::TaskSupervisor;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mail-triage", version, about = "Unattended IMAP mail-triage agent")]
struct Cli {
    /// Configuration file (.toml or .json); counter files live next to it
    #[arg(long, default_value = "/etc/mail-triage/config.toml")]
    config: PathBuf,

    /// Validate configuration and ticket counters, then exit
    #[arg(long)]
    check: bool,

    /// Print the configuration JSON Schema, then exit
    #[arg(long)]
    print_schema: bool,

    /// Override MAIL_TRIAGE_WATCH_TIMEOUT_SECONDS
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    watch_timeout_secs: Option<u64>,
}

/// Application entry point
///
/// # Environment Variables
///
/// See [`Settings::load_from_env`] for runtime knobs. `RUST_LOG` controls
/// log filtering (default `info`).
///
/// # Example
///
/// ```no_run
/// RUST_LOG=mail_triage=debug cargo run -- --config ./config.toml
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if cli.print_schema {
        println!("{}", config::document_schema()?);
        return Ok(());
    }

    let mut settings = Settings::load_from_env()?;
    if let Some(secs) = cli.watch_timeout_secs {
        settings.watch_timeout = Duration::from_secs(secs);
    }
    let config = AppConfig::load(&cli.config)?;

    if cli.check {
        let rejected = supervisor::check_tasks(&config);
        for (name, task) in &config.tasks {
            let status = rejected
                .iter()
                .find(|(rejected_name, _)| rejected_name == name)
                .map_or_else(|| "ok".to_owned(), |(_, e)| e.to_string());
            println!(
                "{name}: {}/{} {:?} {:?} -> {status}",
                task.imap_account, task.watch_folder, task.select, task.edit
            );
        }
        if rejected.len() == config.tasks.len() {
            return Err(errors::AppError::config("no task could be started").into());
        }
        return Ok(());
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let shutdown = CancellationToken::new();
    supervisor::cancel_on_signal(shutdown.clone());
    TaskSupervisor::new(config, settings).run(shutdown).await?;
    Ok(())
}
