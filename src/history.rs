//! Broadcast history
//!
//! Append-only record of broadcast messages, replayed in full to every newly
//! entered client. Unbounded unless a line limit is configured.

use std::collections::VecDeque;

/// Ordered `sender: message` lines
#[derive(Debug, Default)]
pub struct HistoryLog {
    lines: VecDeque<String>,
    limit: Option<usize>,
}

impl HistoryLog {
    /// Create an empty, unbounded log
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty log keeping only the most recent `limit` lines
    pub fn with_limit(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            limit: Some(limit),
        }
    }

    /// Record one broadcast
    pub fn append(&mut self, sender: &str, body: &str) {
        self.lines.push_back(format!("{}: {}\n", sender, body));
        if let Some(limit) = self.limit {
            while self.lines.len() > limit {
                self.lines.pop_front();
            }
        }
    }

    /// The full history as a single blob
    pub fn snapshot(&self) -> String {
        self.lines.iter().map(String::as_str).collect()
    }

    /// Number of retained lines
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Check if nothing has been broadcast yet
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
