//! Semantic display styles.
//!
//! The core never emits terminal escape codes; it tags text with a [`Style`]
//! and leaves the rendering to a [`ConsoleSink`](crate::console::ConsoleSink).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A semantic style tag attached to console text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    Plain,
    Heading,
    Key,
    Value,
    Subtle,
    Success,
    Warning,
    Failure,
    Highlight,
}

impl fmt::Display for Style {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Style::Plain => "plain",
            Style::Heading => "heading",
            Style::Key => "key",
            Style::Value => "value",
            Style::Subtle => "subtle",
            Style::Success => "success",
            Style::Warning => "warning",
            Style::Failure => "failure",
            Style::Highlight => "highlight",
        };
        f.write_str(name)
    }
}

/// A piece of console text with its style.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub text: String,
    pub style: Style,
}

impl Fragment {
    pub fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Style::Plain)
    }
}

impl From<&str> for Fragment {
    fn from(text: &str) -> Self {
        Self::plain(text)
    }
}

impl From<String> for Fragment {
    fn from(text: String) -> Self {
        Self::plain(text)
    }
}

impl<T: Into<String>> From<(T, Style)> for Fragment {
    fn from((text, style): (T, Style)) -> Self {
        Self::new(text, style)
    }
}

/// Concatenate the text of fragments, dropping styles.
pub fn plain_text(fragments: &[Fragment]) -> String {
    fragments.iter().map(|f| f.text.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_from_tuple() {
        let f: Fragment = ("loss", Style::Key).into();
        assert_eq!(f.text, "loss");
        assert_eq!(f.style, Style::Key);
    }

    #[test]
    fn test_plain_text_joins() {
        let line = vec![Fragment::plain("a"), Fragment::new("b", Style::Success)];
        assert_eq!(plain_text(&line), "ab");
    }

    #[test]
    fn test_style_serde_snake_case() {
        let json = serde_json::to_string(&Style::Highlight).unwrap();
        assert_eq!(json, "\"highlight\"");
    }
}
