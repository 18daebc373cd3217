use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, FixedOffset};
use log::{debug, warn};
use serde_json::{Map, Value};

use crate::utils::normalize_key;

/// On-disk layout of a history file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryFormat {
    /// One plain identifier per line.
    Lines,
    /// A JSON array of strings, rewritten on every append and trimmed to `cap`.
    JsonArray { cap: Option<usize> },
    /// One `{"<field>": "...", "time": "<rfc3339>"}` object per line.
    JsonLines { field: &'static str },
}

/// How far back an entry still blocks reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Days(i64),
    Last(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub key: String,
    pub time: Option<DateTime<FixedOffset>>,
}

/// Append-only log of what was already published.
///
/// Read once when a run starts, appended once when it ends. Entries are kept in
/// file order, oldest first.
#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    format: HistoryFormat,
    entries: Vec<HistoryEntry>,
}

impl HistoryLog {
    pub fn load(path: impl Into<PathBuf>, format: HistoryFormat) -> Result<Self> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read history {}", path.display()))?;
            parse_entries(&raw, format, &path)
        } else {
            Vec::new()
        };
        debug!("Loaded {} history entries from {}", entries.len(), path.display());
        Ok(HistoryLog { path, format, entries })
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// The `n` most recent raw keys, oldest first. Used to show the model what to avoid.
    pub fn last_keys(&self, n: usize) -> Vec<String> {
        let start = self.entries.len().saturating_sub(n);
        self.entries[start..].iter().map(|e| e.key.clone()).collect()
    }

    fn in_window<'a>(
        &'a self,
        window: Window,
        now: DateTime<FixedOffset>,
    ) -> Box<dyn Iterator<Item = &'a HistoryEntry> + 'a> {
        match window {
            Window::Last(n) => {
                let start = self.entries.len().saturating_sub(n);
                Box::new(self.entries[start..].iter())
            }
            Window::Days(days) => {
                // no cutoff when the window reaches past chrono's range
                let cutoff = Duration::try_days(days).and_then(|d| now.checked_sub_signed(d));
                // an entry without a timestamp cannot age out
                Box::new(self.entries.iter().filter(move |e| match (e.time, cutoff) {
                    (Some(t), Some(cutoff)) => t >= cutoff,
                    _ => true,
                }))
            }
        }
    }

    /// Normalized keys still inside the window.
    pub fn recent_keys(&self, window: Window, now: DateTime<FixedOffset>) -> HashSet<String> {
        self.in_window(window, now)
            .map(|e| normalize_key(&e.key))
            .filter(|k| !k.is_empty())
            .collect()
    }

    pub fn is_recent(&self, candidate: &str, window: Window, now: DateTime<FixedOffset>) -> bool {
        let wanted = normalize_key(candidate);
        self.in_window(window, now)
            .any(|e| normalize_key(&e.key) == wanted)
    }

    /// Remember `key` in memory and on disk.
    pub fn record(&mut self, key: &str, now: DateTime<FixedOffset>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Could not create {}", parent.display()))?;
            }
        }

        self.entries.push(HistoryEntry {
            key: key.to_string(),
            time: Some(now),
        });

        match self.format {
            HistoryFormat::Lines => self.append_line(key)?,
            HistoryFormat::JsonLines { field } => {
                let mut obj = Map::new();
                obj.insert(field.to_string(), Value::String(key.to_string()));
                obj.insert("time".to_string(), Value::String(now.to_rfc3339()));
                self.append_line(&Value::Object(obj).to_string())?;
            }
            HistoryFormat::JsonArray { cap } => {
                if let Some(cap) = cap {
                    let excess = self.entries.len().saturating_sub(cap);
                    self.entries.drain(..excess);
                }
                let keys: Vec<&str> = self.entries.iter().map(|e| e.key.as_str()).collect();
                let body = serde_json::to_string_pretty(&keys)?;
                fs::write(&self.path, body)
                    .with_context(|| format!("Failed to write {}", self.path.display()))?;
            }
        }

        debug!("Recorded '{}' in {}", key, self.path.display());
        Ok(())
    }

    fn append_line(&self, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

fn parse_entries(raw: &str, format: HistoryFormat, path: &Path) -> Vec<HistoryEntry> {
    match format {
        HistoryFormat::Lines => raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| HistoryEntry {
                key: l.to_string(),
                time: None,
            })
            .collect(),
        HistoryFormat::JsonArray { .. } => match serde_json::from_str::<Vec<String>>(raw) {
            Ok(keys) => keys
                .into_iter()
                .map(|key| HistoryEntry { key, time: None })
                .collect(),
            Err(e) => {
                warn!("Ignoring unreadable history {}: {}", path.display(), e);
                Vec::new()
            }
        },
        HistoryFormat::JsonLines { field } => raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|v| {
                let key = v.get(field)?.as_str()?.to_string();
                let time = v
                    .get("time")
                    .and_then(Value::as_str)
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok());
                Some(HistoryEntry { key, time })
            })
            .collect(),
    }
}
