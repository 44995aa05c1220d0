// bog-parser - Shared diagnostics for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Append-only diagnostics list shared by the tokenizer, parser, compiler
//! and VM.
//!
//! Diagnostics carry a byte offset into the original source; line and column
//! are derived at render time so the hot paths only store a `u32`.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Write};

/// Severity of a single diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A primary error message.
    Error,
    /// A stack trace entry emitted while unwinding call frames.
    Trace,
    /// Supplementary information (e.g. trace truncation).
    Note,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Error => write!(f, "error"),
            ErrorKind::Trace => write!(f, "trace"),
            ErrorKind::Note => write!(f, "note"),
        }
    }
}

/// One rendered-to-be diagnostic with a source byte offset.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub kind: ErrorKind,
    pub message: Cow<'static, str>,
    /// Byte offset into the source the diagnostic refers to.
    pub offset: u32,
}

/// Append-only list of diagnostics.
///
/// Every stage of the pipeline writes into one `Errors` value owned by the
/// caller, so a failed run can be rendered in full afterwards.
#[derive(Debug, Default)]
pub struct Errors {
    list: Vec<Diagnostic>,
}

impl Errors {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a primary error.
    pub fn push_error(&mut self, message: impl Into<Cow<'static, str>>, offset: u32) {
        self.push(ErrorKind::Error, message, offset);
    }

    /// Append a stack trace entry.
    pub fn push_trace(&mut self, message: impl Into<Cow<'static, str>>, offset: u32) {
        self.push(ErrorKind::Trace, message, offset);
    }

    /// Append a note.
    pub fn push_note(&mut self, message: impl Into<Cow<'static, str>>, offset: u32) {
        self.push(ErrorKind::Note, message, offset);
    }

    fn push(&mut self, kind: ErrorKind, message: impl Into<Cow<'static, str>>, offset: u32) {
        self.list.push(Diagnostic {
            kind,
            message: message.into(),
            offset,
        });
    }

    /// Number of recorded diagnostics.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// True if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Iterate over the recorded diagnostics in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.list.iter()
    }

    /// The most recently recorded diagnostic.
    pub fn last(&self) -> Option<&Diagnostic> {
        self.list.last()
    }

    /// Render all diagnostics against the source they refer to.
    ///
    /// Line numbers are 1-indexed; columns count code points.
    pub fn render(&self, source: &str, out: &mut impl Write) -> io::Result<()> {
        for diag in &self.list {
            let (line, column) = line_column(source, diag.offset);
            writeln!(out, "{}: {} [{}:{}]", diag.kind, diag.message, line, column)?;
        }
        Ok(())
    }
}

/// Derive a 1-indexed line/column pair from a byte offset.
pub fn line_column(source: &str, offset: u32) -> (usize, usize) {
    let offset = (offset as usize).min(source.len());
    let mut line = 1;
    let mut column = 1;
    for (i, c) in source.char_indices() {
        if i >= offset {
            break;
        }
        if c == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_column_counts_code_points() {
        let src = "let x = 1\nlet y = \u{3000}2\n";
        assert_eq!(line_column(src, 0), (1, 1));
        assert_eq!(line_column(src, 4), (1, 5));
        // offset of the '2' after the ideographic space
        let off = src.find('2').unwrap() as u32;
        assert_eq!(line_column(src, off), (2, 10));
    }

    #[test]
    fn render_includes_kind_and_position() {
        let mut errors = Errors::new();
        errors.push_error("unexpected token", 4);
        errors.push_note("while parsing this", 0);
        let mut out = Vec::new();
        errors.render("let x = 1", &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("error: unexpected token [1:5]"));
        assert!(text.contains("note: while parsing this [1:1]"));
    }
}
