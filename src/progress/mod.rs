//! Progress Aggregator (component B): rolls up per-task completion into a
//! composite total, in either byte mode or unit mode.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::error::DownloadError;

/// How a [`ProgressNode`] weighs each task's contribution to the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    /// Each task contributes its known byte size (plus one, to account for
    /// the atomic "file present" bit once the transfer finishes).
    Byte,
    /// Each task contributes exactly one unit, regardless of size.
    Unit,
}

/// Failure when merging two nodes of incompatible mode.
#[derive(Debug, Clone, Error)]
pub enum ProgressError {
    #[error("cannot merge a byte-mode progress node with a unit-mode node")]
    ModeMismatch,
}

/// A composite progress total over a fixed set of tasks.
#[derive(Debug, Clone)]
pub struct ProgressNode {
    mode: ProgressMode,
    total: u64,
    completed: u64,
    known_ids: HashSet<String>,
    byte_totals: HashMap<String, u64>,
    completed_ids: HashSet<String>,
    errored_id: Option<String>,
    error: Option<DownloadError>,
}

impl ProgressNode {
    /// Builds a byte-mode node. `tasks` is `(task_id, known_byte_size)`.
    #[must_use]
    pub fn new_byte_mode(tasks: &[(String, u64)]) -> Self {
        let byte_totals: HashMap<String, u64> = tasks.iter().cloned().collect();
        let known_ids: HashSet<String> = byte_totals.keys().cloned().collect();
        let total = byte_totals.values().sum::<u64>() + byte_totals.len() as u64;
        Self {
            mode: ProgressMode::Byte,
            total,
            completed: 0,
            known_ids,
            byte_totals,
            completed_ids: HashSet::new(),
            errored_id: None,
            error: None,
        }
    }

    /// Builds a unit-mode node over the given task ids.
    #[must_use]
    pub fn new_unit_mode(task_ids: &[String]) -> Self {
        let known_ids: HashSet<String> = task_ids.iter().cloned().collect();
        Self {
            mode: ProgressMode::Unit,
            total: known_ids.len() as u64,
            completed: 0,
            known_ids,
            byte_totals: HashMap::new(),
            completed_ids: HashSet::new(),
            errored_id: None,
            error: None,
        }
    }

    #[must_use]
    pub fn mode(&self) -> ProgressMode {
        self.mode
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed
    }

    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }

    #[must_use]
    pub fn current_error(&self) -> Option<(&str, &DownloadError)> {
        match (&self.errored_id, &self.error) {
            (Some(id), Some(err)) => Some((id.as_str(), err)),
            _ => None,
        }
    }

    /// Marks `id` as successfully finished. A no-op for unknown or
    /// already-completed ids.
    pub fn complete(&mut self, id: &str) {
        if !self.known_ids.contains(id) || self.completed_ids.contains(id) {
            return;
        }
        let contribution = match self.mode {
            ProgressMode::Byte => self.byte_totals.get(id).copied().unwrap_or(0) + 1,
            ProgressMode::Unit => 1,
        };
        self.completed += contribution;
        self.completed_ids.insert(id.to_string());
    }

    /// Records a terminal failure for `id`, surfaced via [`Self::current_error`]
    /// until cleared by [`Self::retry`].
    pub fn complete_with_error(&mut self, id: &str, error: DownloadError) {
        if !self.known_ids.contains(id) {
            return;
        }
        self.errored_id = Some(id.to_string());
        self.error = Some(error);
    }

    /// Clears a recorded error for `id` ahead of a mirror-policy retry.
    pub fn retry(&mut self, id: &str) {
        if self.errored_id.as_deref() == Some(id) {
            self.errored_id = None;
            self.error = None;
        }
    }

    /// Combines `self` with `other`, summing totals and unioning completion
    /// state. The more recent error (from `other`) wins.
    pub fn merge(self, other: Self) -> Result<Self, ProgressError> {
        if self.mode != other.mode {
            return Err(ProgressError::ModeMismatch);
        }
        let mut known_ids = self.known_ids;
        known_ids.extend(other.known_ids);
        let mut byte_totals = self.byte_totals;
        byte_totals.extend(other.byte_totals);
        let mut completed_ids = self.completed_ids;
        completed_ids.extend(other.completed_ids);
        Ok(Self {
            mode: self.mode,
            total: self.total + other.total,
            completed: self.completed + other.completed,
            known_ids,
            byte_totals,
            completed_ids,
            errored_id: other.errored_id.or(self.errored_id),
            error: other.error.or(self.error),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{MirrorError, NetworkError};

    #[test]
    fn test_byte_mode_total_is_sum_plus_task_count() {
        let node = ProgressNode::new_byte_mode(&[("a".into(), 100), ("b".into(), 200)]);
        assert_eq!(node.total(), 302);
    }

    #[test]
    fn test_unit_mode_total_is_task_count() {
        let node = ProgressNode::new_unit_mode(&["a".into(), "b".into(), "c".into()]);
        assert_eq!(node.total(), 3);
    }

    #[test]
    fn test_complete_unknown_id_is_noop() {
        let mut node = ProgressNode::new_unit_mode(&["a".into()]);
        node.complete("ghost");
        assert_eq!(node.completed(), 0);
    }

    #[test]
    fn test_complete_is_idempotent() {
        let mut node = ProgressNode::new_byte_mode(&[("a".into(), 100)]);
        node.complete("a");
        node.complete("a");
        assert_eq!(node.completed(), 101);
    }

    #[test]
    fn test_error_then_retry_clears_it() {
        let mut node = ProgressNode::new_unit_mode(&["a".into()]);
        node.complete_with_error(
            "a",
            DownloadError::Network(NetworkError::Cancelled),
        );
        assert!(node.current_error().is_some());
        node.retry("a");
        assert!(node.current_error().is_none());
    }

    #[test]
    fn test_merge_mismatched_modes_fails() {
        let byte_node = ProgressNode::new_byte_mode(&[("a".into(), 10)]);
        let unit_node = ProgressNode::new_unit_mode(&["b".into()]);
        assert!(byte_node.merge(unit_node).is_err());
    }

    #[test]
    fn test_merge_sums_totals_and_unions_completion() {
        let mut a = ProgressNode::new_unit_mode(&["a".into()]);
        a.complete("a");
        let b = ProgressNode::new_unit_mode(&["b".into()]);
        let merged = a.merge(b).unwrap();
        assert_eq!(merged.total(), 2);
        assert_eq!(merged.completed(), 1);
    }

    #[test]
    fn test_merge_prefers_others_error() {
        let a_err = ProgressNode::new_unit_mode(&["a".into()]);
        let mut a_err = a_err;
        a_err.complete_with_error(
            "a",
            DownloadError::Mirror(MirrorError::NoMirrors {
                resource_id: "a".into(),
            }),
        );
        let mut b_err = ProgressNode::new_unit_mode(&["b".into()]);
        b_err.complete_with_error(
            "b",
            DownloadError::Network(NetworkError::Cancelled),
        );
        let merged = a_err.merge(b_err).unwrap();
        let (id, _) = merged.current_error().unwrap();
        assert_eq!(id, "b");
    }
}
