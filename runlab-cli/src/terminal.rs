//! ANSI terminal rendering of tracker output.

use runlab_core::{ConsoleSink, Fragment, Style};
use std::io::{IsTerminal, Write};

/// ANSI escape codes for terminal styling.
mod ansi {
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const RED: &str = "\x1b[31m";
    pub const CYAN: &str = "\x1b[36m";
    pub const MAGENTA: &str = "\x1b[35m";
    pub const RESET: &str = "\x1b[0m";
    /// Return to column 0 and erase the line.
    pub const CLEAR_LINE: &str = "\r\x1b[2K";
}

fn style_code(style: Style) -> Option<&'static str> {
    match style {
        Style::Plain => None,
        Style::Heading => Some(ansi::BOLD),
        Style::Key => Some(ansi::CYAN),
        Style::Value => Some(ansi::BOLD),
        Style::Subtle => Some(ansi::DIM),
        Style::Success => Some(ansi::GREEN),
        Style::Warning => Some(ansi::YELLOW),
        Style::Failure => Some(ansi::RED),
        Style::Highlight => Some(ansi::MAGENTA),
    }
}

/// Render fragments, with colors when `color` is set.
pub fn render(fragments: &[Fragment], color: bool) -> String {
    let mut out = String::new();
    for fragment in fragments {
        match style_code(fragment.style).filter(|_| color) {
            Some(code) => {
                out.push_str(code);
                out.push_str(&fragment.text);
                out.push_str(ansi::RESET);
            }
            None => out.push_str(&fragment.text),
        }
    }
    out
}

/// Console sink writing to any [`Write`].
///
/// On a terminal the live line is rewritten in place. Otherwise redraws are
/// dropped and only committed lines are written, without colors.
pub struct TerminalSink<W: Write + Send> {
    out: W,
    interactive: bool,
}

impl TerminalSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        let out = std::io::stdout();
        let interactive = out.is_terminal();
        Self::new(out, interactive)
    }
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(out: W, interactive: bool) -> Self {
        Self { out, interactive }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out
    }

    fn emit(&mut self, text: &str) {
        // Console failures are not training failures.
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|()| self.out.flush()) {
            tracing::debug!(error = %e, "Console write failed");
        }
    }
}

impl<W: Write + Send> ConsoleSink for TerminalSink<W> {
    fn redraw(&mut self, fragments: &[Fragment]) {
        if self.interactive {
            let line = format!("{}{}", ansi::CLEAR_LINE, render(fragments, true));
            self.emit(&line);
        }
    }

    fn commit(&mut self, fragments: &[Fragment]) {
        let line = if self.interactive {
            format!("{}{}\n", ansi::CLEAR_LINE, render(fragments, true))
        } else {
            format!("{}\n", render(fragments, false))
        };
        self.emit(&line);
    }
}
