use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use log::LevelFilter;
use std::cmp::Reverse;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const LOG_PREFIX: &str = "server_relay_";

/// Log files of earlier runs kept next to the current one.
const KEEP_PREVIOUS: usize = 1;

/// Logs to stdout and to a fresh file under `log_dir`.
pub fn setup_logging(log_dir: &Path, level: LevelFilter) -> Result<()> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("cannot create log directory {}", log_dir.display()))?;

    // Stdout is not wired up yet, so the outcome is reported after apply().
    let pruned = prune_logs(log_dir, KEEP_PREVIOUS);

    let log_path = log_dir.join(log_file_name(Local::now()));
    let log_file = fern::log_file(&log_path)
        .with_context(|| format!("cannot open log file {}", log_path.display()))?;

    dispatch(level)
        .chain(io::stdout())
        .chain(log_file)
        .apply()
        .context("logger already installed")?;

    match pruned {
        Ok(0) => {}
        Ok(removed) => log::debug!("Removed {} old log files from {}", removed, log_dir.display()),
        Err(e) => log::warn!("Could not prune old logs in {}: {}", log_dir.display(), e),
    }
    log::info!("Logging at {} to {}", level, log_path.display());
    Ok(())
}

/// Formatting and per-target levels shared by every output.
fn dispatch(level: LevelFilter) -> fern::Dispatch {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        // Frame-level chatter from the WebSocket stack
        .level_for("tungstenite", LevelFilter::Warn)
        .level_for("tokio_tungstenite", LevelFilter::Warn)
}

fn log_file_name(started: DateTime<Local>) -> String {
    format!("{}{}.log", LOG_PREFIX, started.format("%Y-%m-%d_%H-%M-%S"))
}

/// Deletes relay log files in `log_dir` except the `keep` newest. Returns how
/// many were removed.
fn prune_logs(log_dir: &Path, keep: usize) -> io::Result<usize> {
    let mut logs: Vec<(std::time::SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(LOG_PREFIX) && name.ends_with(".log")
        })
        .filter_map(|entry| {
            let modified = entry.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, entry.path()))
        })
        .collect();

    logs.sort_by_key(|(modified, _)| Reverse(*modified));

    let mut removed = 0;
    for (_, path) in logs.iter().skip(keep) {
        if fs::remove_file(path).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}
