//! Tracker — the orchestration surface of a training run.
//!
//! A [`Tracker`] owns the indicator set, the section stack, the global step
//! and the console sink. It is a cheap cloneable handle so that the iterators
//! it hands out ([`Iterate`], [`StepLoop`]) can keep driving it while the
//! loop body uses the same tracker to store values and open sections.
//!
//! Rendering has two modes:
//!
//! - outside a loop every visible section gets its own line, rewritten while
//!   it runs and committed with its outcome and time when it closes;
//! - inside a loop iteration all sections, the indicator summary and the
//!   iteration timing share a single line that is committed when the
//!   iteration ends.

mod iterate;
mod render;
mod step_loop;

pub use iterate::Iterate;
pub use step_loop::StepLoop;

use crate::console::ConsoleSink;
use crate::error::{Result, SectionError};
use crate::indicator::{IndicatorSpec, IndicatorSummary, Sample};
use crate::indicator_set::IndicatorSet;
use crate::interrupt::{InterruptGuard, InterruptHub};
use crate::section::{SectionId, SectionOptions, SectionOutcome, SectionRecord, SectionStack};
use crate::step::GlobalStepCounter;
use crate::style::{Fragment, Style};
use crate::writer::MetricWriter;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Display and registration behavior of a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerSettings {
    /// Minimum time between progress-driven redraws.
    pub redraw_interval: Duration,
    /// Append iteration time and elapsed/estimated totals to loop lines.
    pub print_iteration_time: bool,
    /// Spaces per nesting level on section lines.
    pub indent: usize,
    /// Register unknown names as printed scalars on first store.
    pub auto_register: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            redraw_interval: Duration::from_millis(100),
            print_iteration_time: true,
            indent: 2,
            auto_register: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopId(u64);

/// Book-keeping for one active [`StepLoop`].
struct LoopFrame {
    id: LoopId,
    /// Stack depth at which the per-iteration section sits.
    base_depth: usize,
    token: CancellationToken,
    total: usize,
    /// Iterations started so far.
    started_iterations: usize,
    started: Instant,
    iteration: Option<SectionId>,
    /// Sections closed during the current iteration, shown inline.
    closed: Vec<SectionRecord>,
    summary: Vec<IndicatorSummary>,
}

pub(crate) struct TrackerState {
    settings: TrackerSettings,
    sections: SectionStack,
    indicators: IndicatorSet,
    global_step: GlobalStepCounter,
    sink: Box<dyn ConsoleSink>,
    writers: Vec<Box<dyn MetricWriter>>,
    loops: Vec<LoopFrame>,
    next_loop_id: u64,
    current_line: Vec<Fragment>,
    last_redraw: Option<Instant>,
    last_summary: Vec<IndicatorSummary>,
}

impl TrackerState {
    fn new(sink: Box<dyn ConsoleSink>, settings: TrackerSettings) -> Self {
        Self {
            indicators: IndicatorSet::new().with_auto_register(settings.auto_register),
            settings,
            sections: SectionStack::new(),
            global_step: GlobalStepCounter::default(),
            sink,
            writers: Vec::new(),
            loops: Vec::new(),
            next_loop_id: 0,
            current_line: Vec::new(),
            last_redraw: None,
            last_summary: Vec::new(),
        }
    }

    fn in_loop(&self) -> bool {
        self.loops.last().is_some_and(|f| f.iteration.is_some())
    }

    fn indent(&self, depth: usize) -> String {
        let visible = self
            .sections
            .iter()
            .take(depth)
            .filter(|s| !s.options().is_silent)
            .count();
        " ".repeat(self.settings.indent * visible)
    }

    fn live_section_line(&self) -> Option<Vec<Fragment>> {
        let index = self.sections.depth().checked_sub(1)?;
        let top = self.sections.get(index)?;
        if top.options().is_silent {
            return None;
        }
        Some(render::section_line(
            &self.indent(index),
            top.label(),
            self.sections.displayed_progress_at(index),
        ))
    }

    /// The shared line of the innermost loop; `iteration_time` marks the final
    /// rendering at the end of an iteration.
    fn loop_line(&self, iteration_time: Option<Duration>) -> Vec<Fragment> {
        let Some(frame) = self.loops.last() else {
            return Vec::new();
        };
        let mut line = vec![Fragment::new(
            format!("{:>8}:  ", self.global_step.get()),
            Style::Key,
        )];
        for record in &frame.closed {
            line.extend(render::inline_record(record));
        }
        for index in frame.base_depth + 1..self.sections.depth() {
            let Some(section) = self.sections.get(index) else {
                continue;
            };
            if section.options().is_silent {
                continue;
            }
            line.push(Fragment::plain(format!("{}: ", section.label())));
            line.push(Fragment::new(
                render::format_percent(self.sections.displayed_progress_at(index)),
                Style::Highlight,
            ));
            line.push(Fragment::plain("  "));
        }
        line.extend(render::summary_fragments(&frame.summary));

        if let Some(elapsed) = iteration_time
            && self.settings.print_iteration_time
        {
            let spent = frame.started.elapsed();
            let estimate =
                spent.mul_f64(frame.total as f64 / frame.started_iterations.max(1) as f64);
            line.push(Fragment::new(
                format!("  {}", render::format_elapsed(elapsed)),
                Style::Subtle,
            ));
            line.push(Fragment::new(
                format!(
                    "  {}/{}",
                    render::format_clock(spent),
                    render::format_clock(estimate)
                ),
                Style::Subtle,
            ));
        }
        line
    }

    fn redraw(&mut self) {
        let line = if self.in_loop() {
            Some(self.loop_line(None))
        } else {
            self.live_section_line()
        };
        if let Some(line) = line {
            self.sink.redraw(&line);
            self.current_line = line;
            self.last_redraw = Some(Instant::now());
        }
    }

    fn redraw_throttled(&mut self) {
        if let Some(last) = self.last_redraw
            && last.elapsed() < self.settings.redraw_interval
        {
            return;
        }
        self.redraw();
    }

    fn commit(&mut self, line: Vec<Fragment>) {
        self.sink.commit(&line);
        self.current_line.clear();
    }

    fn push_section(&mut self, label: &str, options: SectionOptions) -> SectionId {
        if !options.is_silent && !self.in_loop() && !self.current_line.is_empty() {
            // Keep the parent's live line on screen.
            let line = std::mem::take(&mut self.current_line);
            self.sink.commit(&line);
        }
        let id = self.sections.push(label, options);
        tracing::trace!(section = label, depth = self.sections.depth(), "Section pushed");
        if !options.is_silent {
            self.redraw();
        }
        id
    }

    fn pop_section(
        &mut self,
        default: SectionOutcome,
    ) -> std::result::Result<SectionRecord, SectionError> {
        let record = self.sections.pop_or(default)?;
        tracing::debug!(
            section = %record.label,
            outcome = %record.outcome,
            elapsed_ms = record.elapsed.map(|e| e.as_millis() as u64),
            "Section closed"
        );
        if record.options.is_silent {
            return Ok(record);
        }
        if let Some(frame) = self.loops.last_mut()
            && frame.iteration.is_some()
            && record.depth > frame.base_depth
        {
            frame.closed.push(record.clone());
            self.redraw();
        } else {
            let line = render::closed_line(&self.indent(record.depth), &record);
            self.commit(line);
        }
        Ok(record)
    }

    fn pop_to_depth(&mut self, depth: usize, outcome: SectionOutcome) {
        while self.sections.depth() > depth {
            if self.pop_section(outcome).is_err() {
                break;
            }
        }
    }

    /// Close the section `id`, cancelling anything still open above it.
    /// Does nothing if the section was already closed.
    fn close_section(&mut self, id: SectionId, default: SectionOutcome) -> Option<SectionRecord> {
        let position = self.sections.position(id)?;
        self.pop_to_depth(position + 1, SectionOutcome::Cancelled);
        self.pop_section(default).ok()
    }

    fn set_section_progress(&mut self, id: SectionId, fraction: f64) {
        if self.sections.set_progress_of(id, fraction) {
            self.redraw_throttled();
        }
    }

    fn write(&mut self) {
        let step = self.global_step.get();
        let record = self.indicators.export(step);
        for writer in &mut self.writers {
            if let Err(e) = writer.write_step(&record) {
                tracing::warn!(step, error = %e, "Metric writer failed");
            }
        }

        let summary = self.indicators.summarize();
        self.indicators.clear_step_buffers();
        self.last_summary = summary.clone();

        if self.in_loop() {
            if let Some(frame) = self.loops.last_mut() {
                frame.summary = summary;
            }
            self.redraw();
        } else if !summary.is_empty() {
            let mut line = vec![Fragment::new(format!("{step:>8}: "), Style::Key)];
            if let Some(index) = self.sections.depth().checked_sub(1)
                && let Some(top) = self.sections.get(index)
                && !top.options().is_silent
            {
                line.push(Fragment::plain(format!("{} ", top.label())));
                line.push(Fragment::new(
                    render::format_percent(self.sections.displayed_progress_at(index)),
                    Style::Highlight,
                ));
                line.push(Fragment::plain(" "));
            }
            line.extend(render::summary_fragments(&summary));
            self.commit(line);
        }
    }

    fn begin_loop(&mut self, token: CancellationToken, total: usize) -> LoopId {
        let id = LoopId(self.next_loop_id);
        self.next_loop_id += 1;
        self.loops.push(LoopFrame {
            id,
            base_depth: self.sections.depth(),
            token,
            total,
            started_iterations: 0,
            started: Instant::now(),
            iteration: None,
            closed: Vec::new(),
            summary: Vec::new(),
        });
        id
    }

    fn frame_position(&self, id: LoopId) -> Option<usize> {
        self.loops.iter().position(|f| f.id == id)
    }

    /// Whether the loop `id` was stopped by `finish_loop` or an interrupt.
    fn loop_cancelled(&self, id: LoopId) -> bool {
        self.frame_position(id)
            .is_none_or(|pos| self.loops[pos].token.is_cancelled())
    }

    fn begin_iteration(&mut self, id: LoopId, step: u64) {
        let Some(pos) = self.frame_position(id) else {
            return;
        };
        self.global_step.set(step);
        let section = self
            .sections
            .push(format!("{step}"), SectionOptions::new().silent());
        let frame = &mut self.loops[pos];
        frame.iteration = Some(section);
        frame.started_iterations += 1;
        frame.closed.clear();
        frame.summary.clear();
        self.redraw();
    }

    fn end_iteration(&mut self, id: LoopId) {
        let Some(pos) = self.frame_position(id) else {
            return;
        };
        while self.loops.len() > pos + 1 {
            let inner = self.loops[self.loops.len() - 1].id;
            self.end_loop(inner);
        }
        let frame = &self.loops[pos];
        let (Some(iteration), base_depth) = (frame.iteration, frame.base_depth) else {
            return;
        };

        self.pop_to_depth(base_depth + 1, SectionOutcome::Cancelled);
        let elapsed = match self.sections.position(iteration) {
            Some(_) => self
                .sections
                .pop()
                .ok()
                .and_then(|record| record.elapsed)
                .unwrap_or_default(),
            None => Duration::ZERO,
        };
        let line = self.loop_line(Some(elapsed));
        self.commit(line);
        self.loops[pos].iteration = None;
    }

    fn end_loop(&mut self, id: LoopId) {
        let Some(pos) = self.frame_position(id) else {
            return;
        };
        if self.loops[pos].iteration.is_some() {
            self.end_iteration(id);
        }
        let base_depth = self.loops[pos].base_depth;
        self.pop_to_depth(base_depth, SectionOutcome::Cancelled);
        self.loops.truncate(pos);
    }

    fn finish_loop(&mut self) -> bool {
        let Some(frame) = self.loops.last() else {
            return false;
        };
        frame.token.cancel();
        let keep = frame.base_depth + usize::from(frame.iteration.is_some());
        tracing::debug!(step = self.global_step.get(), "Loop finished early");
        self.pop_to_depth(keep, SectionOutcome::Cancelled);
        true
    }
}

/// Cloneable handle to a run's indicators, sections and console output.
#[derive(Clone)]
pub struct Tracker {
    state: Arc<Mutex<TrackerState>>,
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Tracker")
            .field("global_step", &state.global_step.get())
            .field("sections", &state.sections.depth())
            .field("indicators", &state.indicators.len())
            .finish()
    }
}

impl Tracker {
    pub fn new(sink: impl ConsoleSink + 'static) -> Self {
        Self::with_settings(sink, TrackerSettings::default())
    }

    pub fn with_settings(sink: impl ConsoleSink + 'static, settings: TrackerSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::new(Box::new(sink), settings))),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> TrackerSettings {
        self.lock().settings.clone()
    }

    /// Attach a writer that receives every step record.
    pub fn add_writer(&self, writer: Box<dyn MetricWriter>) {
        self.lock().writers.push(writer);
    }

    /// Clear every writer's output. All writers are tried; the first
    /// failure is returned.
    pub fn clear_writers(&self) -> std::io::Result<()> {
        let mut first_error = None;
        for writer in &mut self.lock().writers {
            if let Err(e) = writer.clear() {
                tracing::warn!(error = %e, "Failed to clear metric writer");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn flush_writers(&self) {
        for writer in &mut self.lock().writers {
            if let Err(e) = writer.flush() {
                tracing::warn!(error = %e, "Failed to flush metric writer");
            }
        }
    }

    // --- Indicators -------------------------------------------------------

    /// Register an indicator or a wildcard template such as `loss.*`.
    pub fn register(&self, spec: IndicatorSpec) -> Result<()> {
        self.lock().indicators.register(spec)?;
        Ok(())
    }

    /// Run `f` with read access to the indicator set.
    pub fn with_indicators<R>(&self, f: impl FnOnce(&IndicatorSet) -> R) -> R {
        f(&self.lock().indicators)
    }

    pub fn store(&self, name: &str, value: impl Into<Sample>) -> Result<()> {
        self.lock().indicators.store(name, value.into())?;
        Ok(())
    }

    /// Store several values. An unknown name rejects the whole batch.
    pub fn store_all<K, V, I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Sample>,
    {
        let samples = values
            .into_iter()
            .map(|(name, value)| (name.as_ref().to_string(), value.into()))
            .collect();
        self.lock().indicators.store_batch(samples)?;
        Ok(())
    }

    /// Flush the step: export to writers, render the summary, clear buffers.
    pub fn write(&self) {
        self.lock().write();
    }

    pub fn write_step(&self, step: u64) {
        let mut state = self.lock();
        state.global_step.set(step);
        state.write();
    }

    pub fn write_values<K, V, I>(&self, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Sample>,
    {
        self.store_all(values)?;
        self.write();
        Ok(())
    }

    pub fn write_step_values<K, V, I>(&self, step: u64, values: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Sample>,
    {
        self.set_global_step(step);
        self.write_values(values)
    }

    /// Summary rendered by the most recent `write`.
    pub fn last_summary(&self) -> Vec<IndicatorSummary> {
        self.lock().last_summary.clone()
    }

    // --- Global step ------------------------------------------------------

    pub fn global_step(&self) -> u64 {
        self.lock().global_step.get()
    }

    pub fn set_global_step(&self, step: u64) {
        self.lock().global_step.set(step);
    }

    pub fn add_global_step(&self, delta: i64) {
        self.lock().global_step.add(delta);
    }

    // --- Sections ---------------------------------------------------------

    pub fn push_section(&self, label: &str, options: SectionOptions) -> SectionId {
        self.lock().push_section(label, options)
    }

    /// Close the top section; an unrecorded outcome counts as success.
    pub fn pop_section(&self) -> Result<SectionRecord> {
        Ok(self.lock().pop_section(SectionOutcome::Succeeded)?)
    }

    /// Open a section that closes when the returned guard is dropped.
    pub fn section(&self, label: &str, options: SectionOptions) -> SectionGuard {
        let id = self.push_section(label, options);
        SectionGuard {
            tracker: self.clone(),
            id,
            closed: false,
        }
    }

    /// Run `f` inside a section that is marked failed when `f` returns `Err`.
    pub fn section_scope<T, E>(
        &self,
        label: &str,
        options: SectionOptions,
        f: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let guard = self.section(label, options);
        let result = f();
        if result.is_err() {
            guard.set_successful(false);
        }
        drop(guard);
        result
    }

    /// Set the top section's progress as a fraction in `[0, 1]`.
    pub fn set_progress(&self, fraction: f64) {
        let mut state = self.lock();
        if state.sections.set_progress(fraction) {
            state.redraw_throttled();
        }
    }

    /// Set the top section's progress in its own `total_steps` units.
    pub fn progress(&self, steps: f64) {
        let mut state = self.lock();
        if state.sections.set_progress_steps(steps) {
            state.redraw_throttled();
        }
    }

    pub fn set_successful(&self, is_successful: bool) {
        self.lock().sections.set_successful(is_successful);
    }

    /// Progress of the top section as it would be displayed.
    pub fn displayed_progress(&self) -> Option<f64> {
        self.lock().sections.displayed_progress()
    }

    pub fn section_depth(&self) -> usize {
        self.lock().sections.depth()
    }

    // --- Loops ------------------------------------------------------------

    /// Iterate `iterable` inside a section whose progress follows the items.
    pub fn iterate<I>(&self, label: &str, iterable: I) -> Iterate<I::IntoIter>
    where
        I: IntoIterator,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = iterable.into_iter();
        let total = iter.len();
        Iterate::new(self.clone(), label, iter, total)
    }

    /// Like [`Tracker::iterate`] for iterators whose length is only known
    /// to the caller.
    pub fn iterate_with_total<I>(&self, label: &str, iterable: I, total: usize) -> Iterate<I::IntoIter>
    where
        I: IntoIterator,
    {
        Iterate::new(self.clone(), label, iterable.into_iter(), total)
    }

    /// Loop over global steps, one console line per step.
    pub fn loop_steps(&self, steps: std::ops::Range<u64>) -> StepLoop {
        StepLoop::new(self.clone(), steps)
    }

    /// Loop over `0..count`.
    pub fn loop_count(&self, count: u64) -> StepLoop {
        self.loop_steps(0..count)
    }

    /// Stop the innermost loop after the current iteration.
    ///
    /// Sections still open inside the iteration are closed as cancelled.
    /// Returns `false` when no loop is active.
    pub fn finish_loop(&self) -> bool {
        self.lock().finish_loop()
    }

    /// Cancellation token of the innermost active loop.
    pub fn loop_token(&self) -> Option<CancellationToken> {
        self.lock().loops.last().map(|f| f.token.clone())
    }

    /// Defer Ctrl-C until the guard drops, then stop the innermost loop.
    ///
    /// Outside a loop the interrupt is only recorded on the guard.
    pub fn delayed_interrupt(&self, hub: &Arc<InterruptHub>) -> InterruptGuard {
        let token = self.loop_token().unwrap_or_default();
        InterruptGuard::arm(hub, token)
    }

    // --- Free-form output ---------------------------------------------------

    /// Commit a line of styled fragments.
    pub fn log<F, I>(&self, fragments: I)
    where
        I: IntoIterator<Item = F>,
        F: Into<Fragment>,
    {
        let line: Vec<Fragment> = fragments.into_iter().map(Into::into).collect();
        self.lock().commit(line);
    }

    /// Commit whatever is on the live line and start a fresh one.
    pub fn new_line(&self) {
        let mut state = self.lock();
        let line = std::mem::take(&mut state.current_line);
        state.commit(line);
    }

    /// Commit aligned `key: value` lines.
    pub fn info<K, V, I>(&self, items: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: fmt::Display,
    {
        let items: Vec<(String, String)> = items
            .into_iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.to_string()))
            .collect();
        let width = items.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        let mut state = self.lock();
        for (key, value) in items {
            state.commit(vec![
                Fragment::new(format!("{key:>width$}: "), Style::Key),
                Fragment::new(value, Style::Value),
            ]);
        }
    }
}

/// Closes its section on drop; as failed if the thread is panicking.
#[must_use = "the section closes as soon as the guard is dropped"]
pub struct SectionGuard {
    tracker: Tracker,
    id: SectionId,
    closed: bool,
}

impl SectionGuard {
    pub fn id(&self) -> SectionId {
        self.id
    }

    pub fn set_successful(&self, is_successful: bool) {
        self.tracker
            .lock()
            .sections
            .set_outcome_of(self.id, SectionOutcome::from_success(is_successful));
    }

    pub fn set_progress(&self, fraction: f64) {
        self.tracker.lock().set_section_progress(self.id, fraction);
    }

    /// Close now and return the record, unless something already closed it.
    pub fn close(mut self) -> Option<SectionRecord> {
        self.closed = true;
        self.tracker
            .lock()
            .close_section(self.id, SectionOutcome::Succeeded)
    }
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let default = if std::thread::panicking() {
            SectionOutcome::Failed
        } else {
            SectionOutcome::Succeeded
        };
        self.tracker.lock().close_section(self.id, default);
    }
}
