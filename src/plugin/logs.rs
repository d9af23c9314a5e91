//! Bounded execution log shared by every plugin call.
//!
//! The buffer is a FIFO ring: once `capacity` entries are stored, each new
//! entry evicts the oldest one. Writers never wait on readers for longer than
//! the copy of a single entry.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::host::LogLevel;

/// Default number of entries kept by the process-wide buffer.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

static GLOBAL: OnceCell<Arc<LogBuffer>> = OnceCell::new();

/// One execution log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub plugin_name: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Function being invoked, when the entry describes a call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Error class from [`PluginError::kind`](super::PluginError::kind).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl LogEntry {
    pub fn new(plugin_name: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            plugin_name: plugin_name.to_string(),
            level,
            message: message.into(),
            timestamp: Utc::now(),
            function: None,
            error_kind: None,
            duration_ms: None,
        }
    }

    pub fn with_function(mut self, function: &str) -> Self {
        self.function = Some(function.to_string());
        self
    }

    pub fn with_error_kind(mut self, kind: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self
    }

    pub fn with_duration_ms(mut self, millis: u64) -> Self {
        self.duration_ms = Some(millis);
        self
    }
}

/// Thread-safe ring buffer of [`LogEntry`] values.
#[derive(Debug)]
pub struct LogBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    /// The process-wide buffer. The first call fixes its capacity.
    pub fn global(capacity: usize) -> Arc<Self> {
        GLOBAL.get_or_init(|| Arc::new(Self::new(capacity))).clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Convenience wrapper around [`push`](Self::push).
    pub fn log(&self, plugin_name: &str, level: LogLevel, message: impl Into<String>) {
        self.push(LogEntry::new(plugin_name, level, message));
    }

    /// All entries for one plugin, oldest first.
    pub fn by_plugin(&self, plugin_name: &str) -> Vec<LogEntry> {
        self.entries.lock().iter().filter(|e| e.plugin_name == plugin_name).cloned().collect()
    }

    /// All entries at exactly `level`, oldest first.
    pub fn by_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries.lock().iter().filter(|e| e.level == level).cloned().collect()
    }

    /// The `limit` most recent entries, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Snapshot of every entry, oldest first.
    pub fn all(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
