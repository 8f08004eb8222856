use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    /// Строка в формате отладочной консоли: `[HH:MM:SS] message`
    pub fn display_line(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Лента событий звонка для отладочной консоли.
///
/// Хранит только последние `capacity` записей; каждая запись дублируется в `tracing`.
#[derive(Clone)]
pub struct LogStream {
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl LogStream {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    pub fn log(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Info | LogLevel::Success => tracing::info!("{msg}"),
            LogLevel::Warning => tracing::warn!("{msg}"),
            LogLevel::Error => tracing::error!("{msg}"),
        }

        let entry = LogEntry {
            timestamp: Local::now(),
            level,
            message: msg.to_string(),
        };
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg);
    }

    pub fn warn(&self, msg: &str) {
        self.log(LogLevel::Warning, msg);
    }

    pub fn error(&self, msg: &str) {
        self.log(LogLevel::Error, msg);
    }

    /// Снимок текущих записей, от старых к новым
    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_the_newest_entries() {
        let stream = LogStream::new(3);
        for i in 0..5 {
            stream.info(&format!("message {i}"));
        }
        let messages: Vec<_> = stream.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn entries_keep_their_level() {
        let stream = LogStream::new(10);
        stream.log(LogLevel::Success, "connected");
        stream.error("boom");
        let entries = stream.entries();
        assert_eq!(entries[0].level, LogLevel::Success);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert!(entries[1].display_line().ends_with("] boom"));
    }

    #[test]
    fn clones_share_the_same_stream() {
        let stream = LogStream::new(4);
        let other = stream.clone();
        other.warn("from clone");
        assert_eq!(stream.len(), 1);
    }
}
