//! Progress-tracking wrapper around an arbitrary iterator.

use super::Tracker;
use crate::section::{SectionId, SectionOptions, SectionOutcome};

/// Yields the items of the wrapped iterator inside a section.
///
/// The section opens on the first pull, its progress follows
/// `items yielded / total`, and it closes when the iterator is exhausted or
/// dropped. Dropping it early (e.g. `break`) still counts as success unless
/// the thread is panicking.
pub struct Iterate<I> {
    tracker: Tracker,
    label: String,
    options: SectionOptions,
    inner: I,
    total: usize,
    index: usize,
    section: Option<SectionId>,
    done: bool,
}

impl<I: Iterator> Iterate<I> {
    pub(crate) fn new(tracker: Tracker, label: &str, inner: I, total: usize) -> Self {
        Self {
            tracker,
            label: label.to_string(),
            options: SectionOptions::new(),
            inner,
            total,
            index: 0,
            section: None,
            done: false,
        }
    }

    /// Use custom section options. `total_steps` is always the item count.
    pub fn with_options(mut self, options: SectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn silent(mut self) -> Self {
        self.options = self.options.silent();
        self
    }

    pub fn total(&self) -> usize {
        self.total
    }

    fn close(&mut self, outcome: SectionOutcome) {
        self.done = true;
        if let Some(id) = self.section.take() {
            self.tracker.lock().close_section(id, outcome);
        }
    }
}

impl<I: Iterator> Iterator for Iterate<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        if self.done {
            return None;
        }
        let id = match self.section {
            Some(id) => id,
            None => {
                let mut options = self.options;
                if !options.is_partial {
                    options.total_steps = self.total.max(1) as f64;
                }
                let id = self.tracker.push_section(&self.label, options);
                self.section = Some(id);
                id
            }
        };

        match self.inner.next() {
            Some(item) => {
                if self.total > 0 {
                    let fraction = self.index as f64 / self.total as f64;
                    self.tracker.lock().set_section_progress(id, fraction);
                }
                self.index += 1;
                Some(item)
            }
            None => {
                self.tracker.lock().set_section_progress(id, 1.0);
                self.close(SectionOutcome::Succeeded);
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            self.inner.size_hint()
        }
    }
}

impl<I> Drop for Iterate<I> {
    fn drop(&mut self) {
        if let Some(id) = self.section.take() {
            let outcome = if std::thread::panicking() {
                SectionOutcome::Failed
            } else {
                SectionOutcome::Succeeded
            };
            self.tracker.lock().close_section(id, outcome);
        }
    }
}
