//! Feedback Manager — FIFO-bounded, typed feedback history injected into
//! subsequent agent invocations without exceeding a token budget.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

/// Why a [`FeedbackEntry`] was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackType {
    ValidationFailure,
    JudgeSoftFailure,
    JudgeHardFailure,
    SchemaInvalid,
}

/// One immutable, append-order feedback record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEntry {
    pub feedback_type: FeedbackType,
    pub content: String,
    pub iteration: u32,
    /// Unix seconds at the time of `add`. Supplied by the caller rather
    /// than read from the system clock here, matching the crate's
    /// injectable-clock idiom used for cache TTL (`cache::Clock`) so the
    /// ordering tests stay deterministic without real time.
    pub timestamp: u64,
}

/// Append-only, token-bounded feedback history for one agent controller
/// run. Not `Clone` — entries only ever grow via [`FeedbackManager::add`].
#[derive(Debug, Default)]
pub struct FeedbackManager {
    entries: VecDeque<FeedbackEntry>,
}

/// Rough token estimator: no tokenizer dependency is added for this (the
/// spec explicitly permits "a simple heuristic or the provider's tokenizer
/// capability"). Four characters per token is the crate's standing
/// approximation for English prose.
fn estimate_tokens(s: &str) -> usize {
    (s.len() / 4).max(1)
}

impl FeedbackManager {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Append a feedback entry, stamped with `timestamp` (unix seconds).
    pub fn add(
        &mut self,
        feedback_type: FeedbackType,
        content: impl Into<String>,
        iteration: u32,
        timestamp: u64,
    ) {
        self.entries.push_back(FeedbackEntry {
            feedback_type,
            content: content.into(),
            iteration,
            timestamp,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &FeedbackEntry> {
        self.entries.iter()
    }

    /// Format a newest-preserved, token-bounded window of the history as a
    /// single string suitable for injection into a prompt.
    ///
    /// Walks newest-to-oldest, accumulating entries while the running
    /// estimated token count stays under `max_tokens`; older entries beyond
    /// that point are dropped silently. If `filter_types` is non-empty,
    /// only entries whose type is in the set are considered at all.
    /// Returned order is chronological (oldest of the kept window first).
    pub fn get_for_prompt(&self, max_tokens: usize, filter_types: Option<&[FeedbackType]>) -> String {
        let matches = |e: &FeedbackEntry| match filter_types {
            Some(types) => types.contains(&e.feedback_type),
            None => true,
        };

        let mut kept: Vec<&FeedbackEntry> = Vec::new();
        let mut used_tokens = 0usize;
        for entry in self.entries.iter().rev().filter(|e| matches(e)) {
            let cost = estimate_tokens(&entry.content);
            if used_tokens + cost > max_tokens && !kept.is_empty() {
                break;
            }
            used_tokens += cost;
            kept.push(entry);
            if used_tokens >= max_tokens {
                break;
            }
        }
        kept.reverse();

        kept.into_iter()
            .map(|e| format!("[iteration {}] {:?}: {}", e.iteration, e.feedback_type, e.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_manager_empty_window() {
        let mgr = FeedbackManager::new();
        assert_eq!(mgr.get_for_prompt(1000, None), "");
    }

    #[test]
    fn test_append_order_preserved_in_window() {
        let mut mgr = FeedbackManager::new();
        mgr.add(FeedbackType::ValidationFailure, "first", 0, 0);
        mgr.add(FeedbackType::JudgeSoftFailure, "second", 1, 1);
        let window = mgr.get_for_prompt(10_000, None);
        let first_pos = window.find("first").unwrap();
        let second_pos = window.find("second").unwrap();
        assert!(first_pos < second_pos);
    }

    #[test]
    fn test_filter_by_type_is_exact() {
        let mut mgr = FeedbackManager::new();
        mgr.add(FeedbackType::ValidationFailure, "a validation issue", 0, 0);
        mgr.add(FeedbackType::JudgeHardFailure, "a judge issue", 1, 1);
        let window = mgr.get_for_prompt(10_000, Some(&[FeedbackType::JudgeHardFailure]));
        assert!(!window.contains("validation issue"));
        assert!(window.contains("judge issue"));
    }

    #[test]
    fn test_token_window_drops_oldest_silently() {
        let mut mgr = FeedbackManager::new();
        // Each ~40-char entry costs ~10 estimated tokens.
        for i in 0..10 {
            mgr.add(
                FeedbackType::JudgeSoftFailure,
                format!("entry number {i} padded out to forty chars!!"),
                i,
                i as u64,
            );
        }
        let window = mgr.get_for_prompt(25, None);
        // Only the newest couple of entries should survive a tight budget.
        assert!(window.contains("entry number 9"));
        assert!(!window.contains("entry number 0"));
    }

    #[test]
    fn test_always_keeps_at_least_the_newest_entry() {
        let mut mgr = FeedbackManager::new();
        mgr.add(FeedbackType::SchemaInvalid, "a".repeat(1000), 0, 0);
        let window = mgr.get_for_prompt(1, None);
        assert!(!window.is_empty());
    }
}
