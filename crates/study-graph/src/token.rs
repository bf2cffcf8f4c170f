//! `$(...)` token model
//!
//! Every placeholder in a command or binding is one of a closed set of kinds.
//! Scanning is done once here so call sites never pattern-match strings.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;
use study_spec::{StudySpec, LAUNCHER_TOKEN};

/// Suffix selecting a parameter's rendered label instead of its value
pub const LABEL_SUFFIX: &str = ".label";

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\(([^()\s]+)\)").expect("token pattern is valid"))
}

/// One placeholder occurrence in a template string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'t> {
    /// Text between the parentheses
    pub name: &'t str,
    /// Byte range of the whole `$(...)` occurrence
    pub span: (usize, usize),
}

/// What a token refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// `$(P)` - parameter value
    Parameter(String),
    /// `$(P.label)` - parameter label
    ParameterLabel(String),
    /// `$(NAME)` - study variable or label binding
    Binding(String),
    /// `$(LAUNCHER)` - scheduler launch prefix
    Launcher,
}

impl<'t> Token<'t> {
    #[must_use]
    pub fn range(&self) -> Range<usize> {
        self.span.0..self.span.1
    }

    /// Parameter name when the token uses the `.label` form
    #[must_use]
    pub fn label_target(&self) -> Option<&'t str> {
        self.name.strip_suffix(LABEL_SUFFIX)
    }

    /// Classify against a study; `None` means the name is not bound anywhere
    #[must_use]
    pub fn classify(&self, spec: &StudySpec) -> Option<TokenKind> {
        if self.name == LAUNCHER_TOKEN {
            return Some(TokenKind::Launcher);
        }
        if spec.parameters().contains(self.name) {
            return Some(TokenKind::Parameter(self.name.to_string()));
        }
        if let Some(target) = self.label_target() {
            if spec.parameters().contains(target) {
                return Some(TokenKind::ParameterLabel(target.to_string()));
            }
        }
        if spec.environment().get(self.name).is_some() {
            return Some(TokenKind::Binding(self.name.to_string()));
        }
        None
    }
}

/// All tokens of `text`, left to right
pub fn scan(text: &str) -> impl Iterator<Item = Token<'_>> {
    token_pattern().captures_iter(text).filter_map(|caps| {
        let whole = caps.get(0)?;
        let name = caps.get(1)?;
        Some(Token {
            name: name.as_str(),
            span: (whole.start(), whole.end()),
        })
    })
}
