//! JSONL event files.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::backend::BackendNotification;
use crate::domain::{Event, IngestError};

/// One non-blank line of an event file
#[derive(Debug)]
pub struct EventLine {
    /// 1-based line number
    pub line: usize,
    pub result: Result<Event, IngestError>,
}

/// Parse a typed event or a backend notification.
///
/// Lines with a `category` are typed events; lines with only an
/// `event_type` are backend notifications.
pub fn parse_line(line: &str, source: &str) -> Result<Event, IngestError> {
    let value: Value = serde_json::from_str(line)?;
    let is_notification = value.get("category").is_none() && value.get("event_type").is_some();

    if is_notification {
        let notification: BackendNotification = serde_json::from_value(value)?;
        return notification.into_event(source);
    }

    let mut event = Event::from_json(line)?;
    if event.source == "unknown" {
        event.source = source.to_string();
    }
    Ok(event)
}

/// Read every event of a JSONL file, keeping per-line failures
pub async fn read_events(path: &Path) -> Result<Vec<EventLine>> {
    let file = File::open(path)
        .await
        .with_context(|| format!("Failed to open event file: {}", path.display()))?;
    let source = format!("file:{}", path.display());

    let mut lines = BufReader::new(file).lines();
    let mut events = Vec::new();
    let mut number = 0;

    while let Some(line) = lines
        .next_line()
        .await
        .with_context(|| format!("Failed to read event file: {}", path.display()))?
    {
        number += 1;
        if line.trim().is_empty() {
            continue;
        }
        events.push(EventLine {
            line: number,
            result: parse_line(&line, &source),
        });
    }

    Ok(events)
}
