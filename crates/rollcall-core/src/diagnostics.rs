//! Structured diagnostic events emitted on every notable transition or failure.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ModelLoading,
    ModelReady,
    ModelDegraded,
    ModelFailed,
    GalleryBuilt,
    GalleryEmpty,
    CameraError,
    TrackingStarted,
    TrackingStopped,
    PassFailed,
    IdentityObserved,
    SessionStarted,
    SessionCommitted,
    SessionRejected,
    SessionStopped,
}

/// A single diagnostic event.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl DiagnosticEvent {
    pub fn info(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Info, message)
    }

    pub fn warning(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Warning, message)
    }

    pub fn error(kind: EventKind, message: impl Into<String>) -> Self {
        Self::new(kind, Severity::Error, message)
    }

    fn new(kind: EventKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            severity,
            code: None,
            suggestion: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// Receiver of diagnostic events.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, event: DiagnosticEvent);
}

/// Forwards events to `tracing` and keeps the most recent ones in memory.
pub struct DiagnosticLog {
    capacity: usize,
    recent: Mutex<VecDeque<DiagnosticEvent>>,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<DiagnosticEvent> {
        match self.recent.lock() {
            Ok(ring) => ring.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(256)
    }
}

impl DiagnosticSink for DiagnosticLog {
    fn emit(&self, event: DiagnosticEvent) {
        let code = event.code.unwrap_or("-");
        match event.severity {
            Severity::Info => tracing::info!(kind = ?event.kind, code, "{}", event.message),
            Severity::Warning => tracing::warn!(
                kind = ?event.kind,
                code,
                suggestion = event.suggestion.as_deref(),
                "{}",
                event.message
            ),
            Severity::Error => tracing::error!(
                kind = ?event.kind,
                code,
                suggestion = event.suggestion.as_deref(),
                "{}",
                event.message
            ),
        }

        let mut ring = match self.recent.lock() {
            Ok(ring) => ring,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }
}
