use std::collections::VecDeque;

use crate::diff::{self, DiffSegment};
use crate::model::OptimizationEntry;

/// Prompt revisions received during a session, newest first.
#[derive(Debug, Clone, Default)]
pub struct PromptHistory {
    entries: VecDeque<OptimizationEntry>,
}

impl PromptHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the front so index 0 is always the last one received.
    pub fn append(&mut self, entry: OptimizationEntry) {
        self.entries.push_front(entry);
    }

    #[must_use]
    pub fn latest(&self) -> Option<&OptimizationEntry> {
        self.entries.front()
    }

    pub fn all(&self) -> impl ExactSizeIterator<Item = &OptimizationEntry> {
        self.entries.iter()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&OptimizationEntry> {
        self.entries.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn latest_diff(&self) -> Option<Vec<DiffSegment>> {
        self.latest()
            .map(|entry| diff::diff_words(&entry.old_prompt, &entry.new_prompt))
    }
}

impl FromIterator<OptimizationEntry> for PromptHistory {
    /// Build from entries in arrival order.
    fn from_iter<I: IntoIterator<Item = OptimizationEntry>>(iter: I) -> Self {
        let mut history = Self::new();
        for entry in iter {
            history.append(entry);
        }
        history
    }
}
