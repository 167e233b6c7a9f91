//! Console sink collaborator — where rendered progress lines go.
//!
//! The tracker keeps at most one "live" line that it rewrites in place
//! ([`ConsoleSink::redraw`]) and finishes with [`ConsoleSink::commit`].

use crate::style::{Fragment, plain_text};
use std::sync::{Arc, Mutex, PoisonError};

/// Receiver of styled console output.
pub trait ConsoleSink: Send {
    /// Replace the contents of the current (unfinished) line.
    fn redraw(&mut self, fragments: &[Fragment]);

    /// Replace the current line with `fragments` and move to a new line.
    fn commit(&mut self, fragments: &[Fragment]);
}

/// A sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ConsoleSink for NullSink {
    fn redraw(&mut self, _fragments: &[Fragment]) {}
    fn commit(&mut self, _fragments: &[Fragment]) {}
}

/// One event observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    Redraw(Vec<Fragment>),
    Commit(Vec<Fragment>),
}

impl ConsoleEvent {
    pub fn text(&self) -> String {
        match self {
            ConsoleEvent::Redraw(f) | ConsoleEvent::Commit(f) => plain_text(f),
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, ConsoleEvent::Commit(_))
    }
}

/// A sink that records all events for test assertions.
///
/// Clones share the same event log, so a test can hand one clone to the
/// tracker and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<ConsoleEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ConsoleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Plain text of every committed line, in order.
    pub fn lines(&self) -> Vec<String> {
        self.events()
            .iter()
            .filter(|e| e.is_commit())
            .map(ConsoleEvent::text)
            .collect()
    }

    /// Plain text of the most recent event, committed or not.
    pub fn last_text(&self) -> Option<String> {
        self.events().last().map(ConsoleEvent::text)
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, event: ConsoleEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

impl ConsoleSink for RecordingSink {
    fn redraw(&mut self, fragments: &[Fragment]) {
        self.push(ConsoleEvent::Redraw(fragments.to_vec()));
    }

    fn commit(&mut self, fragments: &[Fragment]) {
        self.push(ConsoleEvent::Commit(fragments.to_vec()));
    }
}
