//! Bounded FIFO buffer of dev-server output lines.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Default number of lines kept per project.
pub const DEFAULT_LOG_CAPACITY: usize = 400;

/// Fixed-capacity line buffer. Appending to a full buffer evicts the oldest
/// line; lines are never reordered.
#[derive(Debug, Clone)]
pub struct LogRing {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    /// The last `n` lines, oldest first.
    pub fn tail(&self, n: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(n);
        self.lines.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// A [`LogRing`] shared between the output reader tasks and the supervisor.
#[derive(Debug, Clone, Default)]
pub struct SharedLogs(Arc<Mutex<LogRing>>);

impl SharedLogs {
    pub fn new(capacity: usize) -> Self {
        Self(Arc::new(Mutex::new(LogRing::new(capacity))))
    }

    pub fn push(&self, line: impl Into<String>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    pub fn tail(&self, n: usize) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).tail(n)
    }

    pub fn clear(&self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
