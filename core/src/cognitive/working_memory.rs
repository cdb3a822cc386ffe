//! Bounded scratchpad of conversational turns kept alongside a cognitive run.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_CAPACITY: usize = 50;

/// `{role, content, metadata?}`; capped at N (default 50), oldest dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryItem {
    pub role: String,
    pub content: String,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct WorkingMemory {
    items: VecDeque<MemoryItem>,
    capacity: usize,
}

impl WorkingMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn push(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.push_with_metadata(role, content, None)
    }

    pub fn push_with_metadata(&mut self, role: impl Into<String>, content: impl Into<String>, metadata: Option<Value>) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(MemoryItem {
            role: role.into(),
            content: content.into(),
            metadata,
        });
    }

    pub fn items(&self) -> impl Iterator<Item = &MemoryItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl Default for WorkingMemory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_dropped_beyond_capacity() {
        let mut memory = WorkingMemory::new(2);
        memory.push("user", "first");
        memory.push("assistant", "second");
        memory.push("user", "third");

        let contents: Vec<&str> = memory.items().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["second", "third"]);
    }

    #[test]
    fn clear_empties_memory() {
        let mut memory = WorkingMemory::default();
        memory.push("user", "hi");
        memory.clear();
        assert!(memory.is_empty());
    }
}
