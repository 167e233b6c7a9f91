//! Global-step loop: one console line per iteration.

use super::{LoopId, Tracker};
use std::ops::Range;
use tokio_util::sync::CancellationToken;

/// Iterator over global steps.
///
/// Each step sets the tracker's global step and opens an iteration frame;
/// sections opened in the body render inline on the step's line, which is
/// committed with the iteration time when the next step is pulled. The loop
/// ends early once its cancellation token is cancelled, either through
/// [`Tracker::finish_loop`] or a deferred interrupt.
pub struct StepLoop {
    tracker: Tracker,
    steps: Range<u64>,
    token: CancellationToken,
    id: Option<LoopId>,
    finished: bool,
}

impl StepLoop {
    pub(crate) fn new(tracker: Tracker, steps: Range<u64>) -> Self {
        Self {
            tracker,
            steps,
            token: CancellationToken::new(),
            id: None,
            finished: false,
        }
    }

    /// Token that stops the loop after the current iteration when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(id) = self.id.take() {
            self.tracker.lock().end_loop(id);
        }
    }
}

impl Iterator for StepLoop {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.finished {
            return None;
        }
        let mut state = self.tracker.lock();
        let id = match self.id {
            Some(id) => {
                state.end_iteration(id);
                id
            }
            None => {
                let total = (self.steps.end.saturating_sub(self.steps.start)) as usize;
                let id = state.begin_loop(self.token.clone(), total);
                self.id = Some(id);
                id
            }
        };

        let step = if state.loop_cancelled(id) {
            None
        } else {
            self.steps.next()
        };
        match step {
            Some(step) => {
                state.begin_iteration(id, step);
                Some(step)
            }
            None => {
                drop(state);
                self.finish();
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            (0, Some(0))
        } else {
            (0, self.steps.size_hint().1)
        }
    }
}

impl Drop for StepLoop {
    fn drop(&mut self) {
        self.finish();
    }
}
