//! Console and file logging.
//!
//! Operator-facing messages go to the terminal with a colored level tag;
//! every message is also appended to the engine log file once `init` has
//! been called. Logging is best-effort: a failed file write never breaks
//! the operation that produced the message.

use owo_colors::OwoColorize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use time::macros::format_description;
use time::OffsetDateTime;

const LOG_FILE_NAME: &str = "hammer-updater.log";

static LOG_FILE: OnceLock<PathBuf> = OnceLock::new();

pub struct Logger;

impl Logger {
    /// Point the file sink at `<log_dir>/hammer-updater.log`, creating the
    /// directory if needed. Before this is called, messages are console-only.
    pub fn init(log_dir: &Path) -> anyhow::Result<()> {
        fs::create_dir_all(log_dir)?;
        let _ = LOG_FILE.set(log_dir.join(LOG_FILE_NAME));
        Ok(())
    }

    /// Append a timestamped line to the log file, if one is configured.
    pub fn log(message: &str) {
        let Some(path) = LOG_FILE.get() else {
            return;
        };
        let line = format!("[{}] {}\n", timestamp(), message);
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn info(message: &str) {
        println!("{} {}", "INFO".blue().bold(), message);
        Self::log(&format!("INFO: {message}"));
    }

    pub fn success(message: &str) {
        println!("{} {}", "SUCCESS".green().bold(), message);
        Self::log(&format!("SUCCESS: {message}"));
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", "ERROR".red().bold(), message);
        Self::log(&format!("ERROR: {message}"));
    }
}

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    now.format(&fmt).unwrap_or_default()
}
