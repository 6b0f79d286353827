//! Diagnostic system for compile-time errors
//!
//! All lexical and syntax errors flow through the unified Diagnostic type,
//! ensuring consistent formatting between the library and the CLI. Runtime
//! errors are a separate domain (see [`crate::value::RuntimeError`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use termcolor::{Color, ColorSpec, WriteColor};

/// Severity level of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    /// Fatal error that prevents compilation
    Error,
    /// Warning that doesn't prevent compilation
    Warning,
}

impl fmt::Display for DiagnosticLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticLevel::Error => write!(f, "error"),
            DiagnosticLevel::Warning => write!(f, "warning"),
        }
    }
}

/// A compile-time diagnostic message
///
/// Codes: `NV1xxx` lexical, `NV2xxx` syntax and compiler limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Severity level
    pub level: DiagnosticLevel,
    /// Error code (e.g. "NV2001")
    pub code: String,
    /// Main diagnostic message
    pub message: String,
    /// Module (chunk) name the source was compiled as
    pub module: String,
    /// Line number (1-based)
    pub line: u32,
    /// Source line text
    pub snippet: String,
    /// Short label describing the problem location
    pub label: String,
    /// Additional notes (optional)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub notes: Vec<String>,
    /// Suggested fix (optional)
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub help: Option<String>,
}

impl Diagnostic {
    /// Create a new error diagnostic with code
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            code: code.into(),
            message: message.into(),
            module: "<unknown>".to_string(),
            line: 1,
            snippet: String::new(),
            label: String::new(),
            notes: Vec::new(),
            help: None,
        }
    }

    /// Create a new warning diagnostic with code
    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            ..Self::error(code, message)
        }
    }

    /// Set the module name
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Set the line number
    pub fn with_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Set the snippet (source line)
    pub fn with_snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Add a note
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    /// Add a help message
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Format as human-readable string
    pub fn to_human_string(&self) -> String {
        let mut output = String::new();

        output.push_str(&format!(
            "{}[{}]: {}\n",
            self.level, self.code, self.message
        ));
        output.push_str(&format!("  --> {}:{}\n", self.module, self.line));

        if !self.snippet.is_empty() {
            output.push_str("   |\n");
            output.push_str(&format!("{:>2} | {}\n", self.line, self.snippet));
            if !self.label.is_empty() {
                output.push_str(&format!("   | {}\n", self.label));
            }
        }

        for note in &self.notes {
            output.push_str(&format!("   = note: {}\n", note));
        }
        if let Some(help) = &self.help {
            output.push_str(&format!("   = help: {}\n", help));
        }

        output
    }

    /// Render with color to a terminal-capable writer
    pub fn emit(&self, out: &mut dyn WriteColor) -> std::io::Result<()> {
        let color = match self.level {
            DiagnosticLevel::Error => Color::Red,
            DiagnosticLevel::Warning => Color::Yellow,
        };
        out.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
        write!(out, "{}[{}]", self.level, self.code)?;
        out.reset()?;
        writeln!(out, ": {}", self.message)?;
        writeln!(out, "  --> {}:{}", self.module, self.line)?;
        if !self.snippet.is_empty() {
            writeln!(out, "   |")?;
            writeln!(out, "{:>2} | {}", self.line, self.snippet)?;
            if !self.label.is_empty() {
                writeln!(out, "   | {}", self.label)?;
            }
        }
        for note in &self.notes {
            writeln!(out, "   = note: {}", note)?;
        }
        if let Some(help) = &self.help {
            writeln!(out, "   = help: {}", help)?;
        }
        Ok(())
    }

    /// Format as JSON string
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Sort diagnostics by level (errors first), then by location
pub fn sort_diagnostics(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by(|a, b| {
        match (a.level, b.level) {
            (DiagnosticLevel::Error, DiagnosticLevel::Warning) => std::cmp::Ordering::Less,
            (DiagnosticLevel::Warning, DiagnosticLevel::Error) => std::cmp::Ordering::Greater,
            _ => a.module.cmp(&b.module).then(a.line.cmp(&b.line)),
        }
    });
}
