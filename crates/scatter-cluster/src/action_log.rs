//! Observational log of published actions and their correlated results.
//!
//! Owned by the coordinator loop; records what was dispatched and what came
//! back, newest first for display. Not consulted by the orchestration itself.

use std::time::SystemTime;

use scatter_core::{Action, ActionResult};

/// A result recorded against a logged action.
#[derive(Debug, Clone)]
pub struct LoggedResult {
    pub context: String,
    pub data: String,
    pub at: SystemTime,
}

/// One published action with whatever completed it.
#[derive(Debug, Clone)]
pub struct ActionLogEntry {
    pub action_type: String,
    pub action_id: String,
    pub params: String,
    pub at: SystemTime,
    pub results: Vec<LoggedResult>,
    pub error: Option<String>,
}

/// Append-ordered action log. Entries are keyed by the sequence number
/// returned from [`ActionLog::record_action`].
#[derive(Default)]
pub struct ActionLog {
    entries: Vec<ActionLogEntry>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a published action, returning its sequence number.
    pub fn record_action(&mut self, action: &Action) -> usize {
        self.entries.push(ActionLogEntry {
            action_type: action.action_type.clone(),
            action_id: action.id.clone(),
            params: String::from_utf8_lossy(&action.params).into_owned(),
            at: SystemTime::now(),
            results: Vec::new(),
            error: None,
        });
        self.entries.len() - 1
    }

    /// Attach a correlated result to a logged action.
    pub fn record_result(&mut self, seq: usize, result: &ActionResult) {
        if let Some(entry) = self.entries.get_mut(seq) {
            entry.results.push(LoggedResult {
                context: result.context.clone(),
                data: String::from_utf8_lossy(&result.data).into_owned(),
                at: SystemTime::now(),
            });
        }
    }

    /// Attach a terminal error to a logged action.
    pub fn record_error(&mut self, seq: usize, error: &str) {
        if let Some(entry) = self.entries.get_mut(seq) {
            entry.error = Some(error.to_string());
        }
    }

    /// Entries newest-first, for display.
    pub fn entries(&self) -> impl Iterator<Item = &ActionLogEntry> {
        self.entries.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
