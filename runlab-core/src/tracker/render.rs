//! Line building for the tracker's console output.

use crate::indicator::IndicatorSummary;
use crate::section::{SectionOutcome, SectionRecord};
use crate::style::{Fragment, Style};
use std::time::Duration;

pub(crate) fn outcome_style(outcome: SectionOutcome) -> Style {
    match outcome {
        SectionOutcome::Succeeded => Style::Success,
        SectionOutcome::Failed => Style::Failure,
        SectionOutcome::Cancelled => Style::Warning,
    }
}

/// Milliseconds with precision that shrinks as the value grows.
pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let ms = elapsed.as_secs_f64() * 1000.0;
    if ms < 10.0 {
        format!("{ms:.2}ms")
    } else if ms < 1000.0 {
        format!("{ms:.1}ms")
    } else {
        format!("{ms:.0}ms")
    }
}

/// Wall clock as `M:SSm`, or `H:MMh` past an hour.
pub(crate) fn format_clock(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}:{m:02}h")
    } else {
        format!("{m}:{s:02}m")
    }
}

pub(crate) fn format_percent(fraction: f64) -> String {
    format!("{:>3.0}%", fraction * 100.0)
}

/// The live line of a running section: `label...` with optional progress.
pub(crate) fn section_line(indent: &str, label: &str, progress: f64) -> Vec<Fragment> {
    let mut line = vec![Fragment::new(format!("{indent}{label}..."), Style::Heading)];
    if progress > 0.0 && progress < 1.0 {
        line.push(Fragment::new(
            format!(" {}", format_percent(progress)),
            Style::Highlight,
        ));
    }
    line
}

/// The committed line of a closed section: `label...[DONE]` and its time.
pub(crate) fn closed_line(indent: &str, record: &SectionRecord) -> Vec<Fragment> {
    let mut line = vec![
        Fragment::new(format!("{indent}{}...", record.label), Style::Heading),
        Fragment::new(
            format!("[{}]", record.outcome),
            outcome_style(record.outcome),
        ),
    ];
    if let Some(elapsed) = record.elapsed {
        line.push(Fragment::new(
            format!("\t{}", format_elapsed(elapsed)),
            Style::Subtle,
        ));
    }
    line
}

/// A closed section as it appears inside a loop line.
pub(crate) fn inline_record(record: &SectionRecord) -> Vec<Fragment> {
    let value = match (record.outcome, record.elapsed) {
        (SectionOutcome::Succeeded, Some(elapsed)) => format_elapsed(elapsed),
        (outcome, _) => outcome.to_string(),
    };
    vec![
        Fragment::plain(format!("{}: ", record.label)),
        Fragment::new(value, outcome_style(record.outcome)),
        Fragment::plain("  "),
    ]
}

pub(crate) fn summary_fragments(summary: &[IndicatorSummary]) -> Vec<Fragment> {
    summary
        .iter()
        .flat_map(|s| {
            [
                Fragment::new(format!(" {}: ", s.name), Style::Key),
                Fragment::new(s.display_value(), s.style),
            ]
        })
        .collect()
}
