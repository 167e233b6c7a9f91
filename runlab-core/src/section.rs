//! Section stack — nested, timed units of work with progress.
//!
//! A section is owned by the stack while it runs and turns into an immutable
//! [`SectionRecord`] when popped. Only the top of the stack is ever popped.
//!
//! A *partial* section covers `total_steps` of its parent's steps: while it
//! runs, and after it closes, its progress adds
//! `progress * total_steps / parent.total_steps` to the parent's displayed
//! progress. The parent's own progress is left alone.

use crate::error::SectionError;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Stable identity of a pushed section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SectionId(u64);

/// How a section is displayed and timed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SectionOptions {
    pub is_silent: bool,
    pub is_timed: bool,
    pub is_partial: bool,
    pub total_steps: f64,
}

impl Default for SectionOptions {
    fn default() -> Self {
        Self {
            is_silent: false,
            is_timed: true,
            is_partial: false,
            total_steps: 1.0,
        }
    }
}

impl SectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent(mut self) -> Self {
        self.is_silent = true;
        self
    }

    pub fn untimed(mut self) -> Self {
        self.is_timed = false;
        self
    }

    /// Report progress into the parent, covering `total_steps` of its steps.
    pub fn partial(mut self, total_steps: f64) -> Self {
        self.is_partial = true;
        self.total_steps = total_steps;
        self
    }

    pub fn total_steps(mut self, total_steps: f64) -> Self {
        self.total_steps = total_steps;
        self
    }
}

/// Terminal outcome of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl SectionOutcome {
    pub fn from_success(is_successful: bool) -> Self {
        if is_successful {
            SectionOutcome::Succeeded
        } else {
            SectionOutcome::Failed
        }
    }
}

impl fmt::Display for SectionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionOutcome::Succeeded => write!(f, "DONE"),
            SectionOutcome::Failed => write!(f, "FAIL"),
            SectionOutcome::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A running section.
#[derive(Debug, Clone)]
pub struct Section {
    id: SectionId,
    label: String,
    options: SectionOptions,
    progress: f64,
    partial_progress: f64,
    started: Option<Instant>,
    outcome: Option<SectionOutcome>,
}

impl Section {
    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn options(&self) -> &SectionOptions {
        &self.options
    }

    /// Own progress in `[0, 1]`, excluding partial children.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Outcome recorded so far; `None` means it will default on pop.
    pub fn outcome(&self) -> Option<SectionOutcome> {
        self.outcome
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }
}

/// A closed section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionRecord {
    pub id: SectionId,
    pub label: String,
    pub options: SectionOptions,
    pub outcome: SectionOutcome,
    pub elapsed: Option<Duration>,
    /// Displayed progress at the moment of closing.
    pub progress: f64,
    /// Number of sections that were below this one on the stack.
    pub depth: usize,
}

/// The stack of running sections.
#[derive(Debug, Default)]
pub struct SectionStack {
    sections: Vec<Section>,
    next_id: u64,
}

impl SectionStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and activate a new section on top of the stack.
    pub fn push(&mut self, label: impl Into<String>, mut options: SectionOptions) -> SectionId {
        if !(options.total_steps.is_finite() && options.total_steps > 0.0) {
            options.total_steps = 1.0;
        }
        let id = SectionId(self.next_id);
        self.next_id += 1;
        self.sections.push(Section {
            id,
            label: label.into(),
            options,
            progress: 0.0,
            partial_progress: 0.0,
            started: options.is_timed.then(Instant::now),
            outcome: None,
        });
        id
    }

    /// Close the top section. An unrecorded outcome defaults to success.
    pub fn pop(&mut self) -> Result<SectionRecord, SectionError> {
        self.pop_or(SectionOutcome::Succeeded)
    }

    /// Close the top section, using `default` when no outcome was recorded.
    pub fn pop_or(&mut self, default: SectionOutcome) -> Result<SectionRecord, SectionError> {
        let depth = self.sections.len().checked_sub(1).ok_or(SectionError::EmptyStack)?;
        let progress = self.displayed_progress_at(depth);
        let section = self.sections.pop().ok_or(SectionError::EmptyStack)?;

        if section.options.is_partial {
            if let Some(parent) = self.sections.last_mut() {
                parent.partial_progress +=
                    progress * section.options.total_steps / parent.options.total_steps;
            }
        }

        Ok(SectionRecord {
            id: section.id,
            label: section.label,
            options: section.options,
            outcome: section.outcome.unwrap_or(default),
            elapsed: section.started.map(|s| s.elapsed()),
            progress,
            depth,
        })
    }

    /// Update the top section's progress, clamped to `[0, 1]`.
    ///
    /// Returns `false` when the stack is empty.
    pub fn set_progress(&mut self, fraction: f64) -> bool {
        match self.sections.last_mut() {
            Some(top) => {
                if !fraction.is_nan() {
                    top.progress = fraction.clamp(0.0, 1.0);
                }
                true
            }
            None => false,
        }
    }

    /// Update the top section's progress in its own step units.
    pub fn set_progress_steps(&mut self, steps: f64) -> bool {
        let total = match self.sections.last() {
            Some(top) => top.options.total_steps,
            None => return false,
        };
        self.set_progress(steps / total)
    }

    /// Record the top section's outcome. Returns `false` when the stack is empty.
    pub fn set_outcome(&mut self, outcome: SectionOutcome) -> bool {
        match self.sections.last_mut() {
            Some(top) => {
                top.outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    pub fn set_successful(&mut self, is_successful: bool) -> bool {
        self.set_outcome(SectionOutcome::from_success(is_successful))
    }

    /// Record the outcome of the section with `id`, wherever it is on the stack.
    pub fn set_outcome_of(&mut self, id: SectionId, outcome: SectionOutcome) -> bool {
        match self.sections.iter_mut().find(|s| s.id == id) {
            Some(section) => {
                section.outcome = Some(outcome);
                true
            }
            None => false,
        }
    }

    /// Update the progress of the section with `id`, clamped to `[0, 1]`.
    pub fn set_progress_of(&mut self, id: SectionId, fraction: f64) -> bool {
        match self.sections.iter_mut().find(|s| s.id == id) {
            Some(section) => {
                if !fraction.is_nan() {
                    section.progress = fraction.clamp(0.0, 1.0);
                }
                true
            }
            None => false,
        }
    }

    /// Progress shown for the section at `index`, including partial children.
    pub fn displayed_progress_at(&self, index: usize) -> f64 {
        let Some(section) = self.sections.get(index) else {
            return 0.0;
        };
        let mut progress = section.progress + section.partial_progress;
        if let Some(child) = self.sections.get(index + 1) {
            if child.options.is_partial {
                progress += self.displayed_progress_at(index + 1) * child.options.total_steps
                    / section.options.total_steps;
            }
        }
        progress.clamp(0.0, 1.0)
    }

    /// Progress shown for the top section.
    pub fn displayed_progress(&self) -> Option<f64> {
        self.depth()
            .checked_sub(1)
            .map(|index| self.displayed_progress_at(index))
    }

    pub fn top(&self) -> Option<&Section> {
        self.sections.last()
    }

    pub fn get(&self, index: usize) -> Option<&Section> {
        self.sections.get(index)
    }

    /// Stack position of the section with `id`.
    pub fn position(&self, id: SectionId) -> Option<usize> {
        self.sections.iter().position(|s| s.id == id)
    }

    pub fn depth(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Sections from the bottom of the stack to the top.
    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_empty_is_error() {
        let mut stack = SectionStack::new();
        assert!(matches!(stack.pop(), Err(SectionError::EmptyStack)));
    }

    #[test]
    fn test_pop_defaults_to_success() {
        let mut stack = SectionStack::new();
        stack.push("load", SectionOptions::new());
        let record = stack.pop().unwrap();
        assert_eq!(record.outcome, SectionOutcome::Succeeded);
        assert!(record.elapsed.is_some());
        assert_eq!(record.depth, 0);
    }

    #[test]
    fn test_set_successful_false_records_failure() {
        let mut stack = SectionStack::new();
        stack.push("load", SectionOptions::new());
        stack.set_successful(false);
        assert_eq!(stack.pop().unwrap().outcome, SectionOutcome::Failed);
    }

    #[test]
    fn test_untimed_has_no_elapsed() {
        let mut stack = SectionStack::new();
        stack.push("quick", SectionOptions::new().untimed());
        assert!(stack.pop().unwrap().elapsed.is_none());
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut stack = SectionStack::new();
        stack.push("a", SectionOptions::new());
        stack.set_progress(1.7);
        assert_eq!(stack.top().unwrap().progress(), 1.0);
        stack.set_progress(-0.2);
        assert_eq!(stack.top().unwrap().progress(), 0.0);
        stack.set_progress(f64::NAN);
        assert_eq!(stack.top().unwrap().progress(), 0.0);
    }

    #[test]
    fn test_progress_steps_uses_total() {
        let mut stack = SectionStack::new();
        stack.push("train", SectionOptions::new().total_steps(8.0));
        stack.set_progress_steps(2.0);
        assert_eq!(stack.top().unwrap().progress(), 0.25);
    }

    #[test]
    fn test_partial_child_contributes_to_parent() {
        let mut stack = SectionStack::new();
        stack.push("A", SectionOptions::new().total_steps(4.0));
        stack.push("B", SectionOptions::new().partial(2.0));
        stack.set_progress(1.0);
        // Live contribution while B runs.
        assert_eq!(stack.displayed_progress_at(0), 0.5);
        stack.pop().unwrap();

        assert_eq!(stack.displayed_progress(), Some(0.5));
        // Parent completion is untouched.
        assert_eq!(stack.top().unwrap().progress(), 0.0);
    }

    #[test]
    fn test_non_partial_child_does_not_contribute() {
        let mut stack = SectionStack::new();
        stack.push("A", SectionOptions::new().total_steps(4.0));
        stack.push("B", SectionOptions::new().total_steps(2.0));
        stack.set_progress(1.0);
        stack.pop().unwrap();
        assert_eq!(stack.displayed_progress(), Some(0.0));
    }

    #[test]
    fn test_invalid_total_steps_falls_back_to_one() {
        let mut stack = SectionStack::new();
        stack.push("A", SectionOptions::new().total_steps(0.0));
        assert_eq!(stack.top().unwrap().options().total_steps, 1.0);
    }

    #[test]
    fn test_position_and_ids_are_unique() {
        let mut stack = SectionStack::new();
        let a = stack.push("a", SectionOptions::new());
        let b = stack.push("b", SectionOptions::new());
        assert_ne!(a, b);
        assert_eq!(stack.position(a), Some(0));
        assert_eq!(stack.position(b), Some(1));
        stack.pop().unwrap();
        assert_eq!(stack.position(b), None);
    }
}
