//! Job trace
//!
//! The trace is the ordered, append-only, human readable output of a job.
//! It is distinct from the agent's own `tracing` logs: the trace is what the
//! control plane shows to the user.

use keel_core::domain::log::{LogEntry, LogLevel};
use std::sync::{Arc, Mutex};

/// Destination for trace lines
///
/// Implementations must keep lines in the order they were appended.
pub trait TraceSink: Send + Sync {
    /// Appends one entry to the trace
    fn append(&self, entry: LogEntry);
}

/// Renders an entry the way it is shown to users
pub fn render(entry: &LogEntry) -> String {
    match entry.level {
        LogLevel::Warning => format!("WARNING: {}", entry.message),
        LogLevel::Error => format!("ERROR: {}", entry.message),
        LogLevel::Debug | LogLevel::Info => entry.message.clone(),
    }
}

/// Cheap handle used by the components of a run to write to the trace
#[derive(Clone)]
pub struct JobTrace {
    sink: Arc<dyn TraceSink>,
}

impl JobTrace {
    pub fn new(sink: Arc<dyn TraceSink>) -> Self {
        Self { sink }
    }

    pub fn log_debug(&self, message: impl Into<String>) {
        self.sink.append(LogEntry::new(LogLevel::Debug, message));
    }

    pub fn log_info(&self, message: impl Into<String>) {
        self.sink.append(LogEntry::new(LogLevel::Info, message));
    }

    pub fn log_warning(&self, message: impl Into<String>) {
        self.sink.append(LogEntry::new(LogLevel::Warning, message));
    }

    pub fn log_error(&self, message: impl Into<String>) {
        self.sink.append(LogEntry::new(LogLevel::Error, message));
    }
}

/// In-memory trace
///
/// Collects entries for later draining (e.g. by a periodic uploader).
#[derive(Clone, Default)]
pub struct InMemoryTrace {
    buffer: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all buffered entries and clears the buffer
    pub fn drain(&self) -> Vec<LogEntry> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.drain(..).collect()
    }

    /// Rendered trace text without draining
    pub fn text(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.iter().map(render).collect::<Vec<_>>().join("\n")
    }
}

impl TraceSink for InMemoryTrace {
    fn append(&self, entry: LogEntry) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(entry);
    }
}

/// Trace written straight to stdout, used by the binary
pub struct ConsoleTrace;

impl TraceSink for ConsoleTrace {
    fn append(&self, entry: LogEntry) {
        if entry.level == LogLevel::Debug {
            return;
        }
        println!("{}", render(&entry));
    }
}
