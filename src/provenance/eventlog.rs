//! KN-015: Append-only JSONL provenance event log.

use crate::core::error::{Error, Result};
use crate::core::types::{ProvenanceEvent, TimestampedEvent};
use crate::core::urn::Urn;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Generate an ISO 8601 timestamp.
pub fn now_iso8601() -> String {
    // Manual implementation, no chrono dependency
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

fn format_utc(secs: u64) -> String {
    let days = secs / 86400;
    let time_secs = secs % 86400;
    let (hours, minutes, seconds) = (time_secs / 3600, (time_secs % 3600) / 60, time_secs % 60);

    let mut year = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(year) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        year += 1;
    }
    let february = if is_leap(year) { 29 } else { 28 };
    let month_days = [31, february, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut month = 12;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md {
            month = i + 1;
            break;
        }
        remaining -= md;
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        remaining + 1,
        hours,
        minutes,
        seconds
    )
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

/// Generate a run ID.
pub fn generate_run_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("r-{}", &id[..12])
}

/// Derive the event log path for an application environment.
pub fn event_log_path(state_dir: &Path, app_urn: &Urn) -> PathBuf {
    state_dir.join(app_urn.path()).join("events.jsonl")
}

/// Append an event to the application's event log.
pub fn append_event(state_dir: &Path, app_urn: &Urn, event: ProvenanceEvent) -> Result<()> {
    let path = event_log_path(state_dir, app_urn);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("cannot create {}", parent.display()), e))?;
    }

    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te)?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| Error::io(format!("cannot open event log {}", path.display()), e))?;
    writeln!(file, "{}", json)
        .map_err(|e| Error::io(format!("cannot write {}", path.display()), e))?;

    Ok(())
}

/// Read every event back, skipping lines that do not parse.
pub fn read_events(state_dir: &Path, app_urn: &Urn) -> Result<Vec<TimestampedEvent>> {
    let path = event_log_path(state_dir, app_urn);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|e| Error::io(format!("cannot read {}", path.display()), e))?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
