// File: src/error.rs
//
// Diagnostics (spec §4.7): a single `SkiffError` enum covering every stage of the
// pipeline, with a `colored`-backed rustc-style `Display` and Levenshtein "did you
// mean" suggestions. Ported from the teacher's `errors.rs` (`RuffError`/`ErrorKind`,
// `levenshtein_distance`, `find_closest_match`) and regrouped around the bytecode
// pipeline's four error kinds instead of the tree-walker's six.

use colored::Colorize;
use std::fmt;

use crate::bytecode::LoadError;

#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: u32,
    pub column: u32,
    pub file: Option<String>,
}

impl SourceLocation {
    pub fn new(line: u32, column: u32) -> Self {
        SourceLocation { line, column, file: None }
    }

    pub fn with_file(line: u32, column: u32, file: impl Into<String>) -> Self {
        SourceLocation { line, column, file: Some(file.into()) }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(file) => write!(f, "{}:{}:{}", file, self.line, self.column),
            None => write!(f, "{}:{}", self.line, self.column),
        }
    }
}

/// One frame of a captured runtime call stack (spec §7).
#[derive(Debug, Clone)]
pub struct FrameInfo {
    pub function_name: String,
    pub file: Option<String>,
    pub line: u32,
}

#[derive(Debug, Clone)]
pub enum SkiffError {
    Lex { message: String, location: SourceLocation, source_line: Option<String> },
    Compile { message: String, location: SourceLocation, source_line: Option<String>, suggestion: Option<String> },
    Load { message: String },
    Runtime { message: String, location: Option<SourceLocation>, frames: Vec<FrameInfo>, source_line: Option<String> },
}

impl SkiffError {
    pub fn lex(message: impl Into<String>, location: SourceLocation) -> Self {
        SkiffError::Lex { message: message.into(), location, source_line: None }
    }

    pub fn compile(message: impl Into<String>, location: SourceLocation) -> Self {
        SkiffError::Compile { message: message.into(), location, source_line: None, suggestion: None }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        SkiffError::Runtime { message: message.into(), location: None, frames: Vec::new(), source_line: None }
    }

    pub fn with_source_line(mut self, line: impl Into<String>) -> Self {
        match &mut self {
            SkiffError::Lex { source_line, .. } => *source_line = Some(line.into()),
            SkiffError::Compile { source_line, .. } => *source_line = Some(line.into()),
            SkiffError::Runtime { source_line, .. } => *source_line = Some(line.into()),
            SkiffError::Load { .. } => {}
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        if let SkiffError::Compile { suggestion: s, .. } = &mut self {
            *s = Some(suggestion.into());
        }
        self
    }

    pub fn with_frames(mut self, frames: Vec<FrameInfo>) -> Self {
        if let SkiffError::Runtime { frames: f, .. } = &mut self {
            *f = frames;
        }
        self
    }

    pub fn with_location(mut self, location: SourceLocation) -> Self {
        if let SkiffError::Runtime { location: l, .. } = &mut self {
            *l = Some(location);
        }
        self
    }
}

impl From<LoadError> for SkiffError {
    fn from(e: LoadError) -> Self {
        SkiffError::Load { message: e.to_string() }
    }
}

fn render_snippet(f: &mut fmt::Formatter<'_>, location: &SourceLocation, source_line: &str) -> fmt::Result {
    writeln!(f, "   {}", "|".bright_blue())?;
    writeln!(f, "{} {} {}", format!("{:>3}", location.line).bright_blue(), "|".bright_blue(), source_line)?;
    writeln!(
        f,
        "   {} {}{}",
        "|".bright_blue(),
        " ".repeat(location.column.saturating_sub(1) as usize),
        "^".red().bold()
    )?;
    writeln!(f, "   {}", "|".bright_blue())
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Lex { message, location, source_line } => {
                writeln!(f, "{}: {}", "lex error".red().bold(), message.bold())?;
                writeln!(f, "{}", format!("  --> {location}").bright_blue())?;
                if let Some(src) = source_line {
                    render_snippet(f, location, src)?;
                }
                Ok(())
            }
            SkiffError::Compile { message, location, source_line, suggestion } => {
                writeln!(f, "{}: {}", "compile error".red().bold(), message.bold())?;
                writeln!(f, "{}", format!("  --> {location}").bright_blue())?;
                if let Some(src) = source_line {
                    render_snippet(f, location, src)?;
                }
                if let Some(s) = suggestion {
                    writeln!(f, "   {} {}", "=".bright_green(), format!("did you mean '{s}'?").bright_green())?;
                }
                Ok(())
            }
            SkiffError::Load { message } => {
                writeln!(f, "{}: {}", "bytecode load error".red().bold(), message.bold())
            }
            SkiffError::Runtime { message, location, frames, source_line } => {
                writeln!(f, "{}: {}", "runtime error".red().bold(), message.bold())?;
                if let Some(location) = location {
                    writeln!(f, "{}", format!("  --> {location}").bright_blue())?;
                    if let Some(src) = source_line {
                        render_snippet(f, location, src)?;
                    }
                }
                for frame in frames {
                    let file = frame.file.as_deref().unwrap_or("<script>");
                    writeln!(f, "   {} at {} ({}:{})", "=".bright_cyan(), frame.function_name, file, frame.line)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for SkiffError {}

/// Computes the Levenshtein edit distance between two strings.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();
    let (len1, len2) = (s1_chars.len(), s2_chars.len());
    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }
    let mut matrix = vec![vec![0usize; len2 + 1]; len1 + 1];
    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for (j, cell) in matrix[0].iter_mut().enumerate().take(len2 + 1) {
        *cell = j;
    }
    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }
    matrix[len1][len2]
}

/// Find the closest candidate to `target` within edit distance 3.
pub fn find_closest_match<'a>(target: &str, candidates: impl Iterator<Item = &'a str>) -> Option<String> {
    let mut best: Option<(usize, &str)> = None;
    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && best.map(|(d, _)| distance < d).unwrap_or(true) {
            best = Some((distance, candidate));
        }
    }
    best.map(|(_, c)| c.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_strings_have_zero_distance() {
        assert_eq!(levenshtein_distance("abc", "abc"), 0);
    }

    #[test]
    fn single_substitution_has_distance_one() {
        assert_eq!(levenshtein_distance("cat", "bat"), 1);
    }

    #[test]
    fn closest_match_ignores_far_candidates() {
        let candidates = vec!["length", "list", "total"];
        let found = find_closest_match("lenght", candidates.into_iter());
        assert_eq!(found.as_deref(), Some("length"));
    }

    #[test]
    fn closest_match_none_when_too_far() {
        let candidates = vec!["zzzzzzzz"];
        assert_eq!(find_closest_match("abc", candidates.into_iter()), None);
    }

    #[test]
    fn display_renders_caret_under_column() {
        let err = SkiffError::compile("unexpected token", SourceLocation::new(3, 5)).with_source_line("  x + ");
        let rendered = format!("{err}");
        assert!(rendered.contains("compile error"));
        assert!(rendered.contains("3:5"));
    }
}
